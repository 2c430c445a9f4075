use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{anyhow, Result};
use sysinfo::{get_current_pid, Pid, Signal, System};
use tracing::info;

use super::daemon_path::to_daemon_path;

/// Processes other than this one started from the executable at `name`.
pub fn find_running_servers(name: &Path) -> Result<Vec<Pid>> {
    let system = System::new_all();
    let current_id = get_current_pid().map_err(|e| anyhow!("Failed to get current pid {e}"))?;
    Ok(system
        .processes()
        .iter()
        .filter(|(pid, _)| **pid != current_id)
        .filter(|(_, process)| !matches!(process.parent(), Some(p) if p == current_id))
        .filter(|(_, process)| process.exe().is_some_and(|v| v.exists() && name == v))
        .map(|(pid, _)| *pid)
        .collect())
}

/// Terminates every daemon started from `name`. Returns how many were stopped.
pub fn kill_previous_servers(name: &Path) -> Result<usize> {
    let pids = find_running_servers(name)?;
    let system = System::new_all();
    for pid in &pids {
        let Some(process) = system.process(*pid) else {
            continue;
        };
        // This will forcefully terminate the process on Windows. Anything better will require a
        // lot more work.
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
        process.wait();
        info!("Stopped daemon {pid}");
    }
    Ok(pids.len())
}

pub fn daemon_executable() -> Result<PathBuf> {
    Ok(to_daemon_path(std::env::current_exe()?))
}

/// Shuts down the previous daemon and starts a new one. The daemon binary detaches itself.
pub fn restart_server(application_path: &Path) -> Result<()> {
    let daemon = daemon_executable()?;
    if !daemon.exists() {
        return Err(anyhow!("Daemon executable {daemon:?} is missing"));
    }
    kill_previous_servers(&daemon)?;

    let mut command = std::process::Command::new(&daemon);
    command.arg("--dir").arg(application_path);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    println!("Spawning");
    let status = command.status()?;
    if !status.success() {
        return Err(anyhow!("Daemon failed to start {status}"));
    }
    println!("Success");
    Ok(())
}
