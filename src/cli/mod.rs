pub mod daemon_path;
pub mod dates;
pub mod process;
pub mod report;
pub mod taxonomy;

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};
use dates::{parse_day, DateStyle};
use futures::TryStreamExt;
use process::{daemon_executable, find_running_servers, kill_previous_servers, restart_server};
use taxonomy::{process_taxonomy_command, TaxonomyCommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{TrackerConfig, CONFIG_FILE_NAME, TAXONOMY_FILE_NAME},
    daemon::start_daemon,
    pipeline::{create_pipeline, pause::PauseMarker, pause::PauseSignal, RECORDS_DIR_NAME},
    storage::{
        activity_log::{read_range, ActivityLog, JsonActivityLog},
        stats::analyze_days,
    },
    taxonomy::{
        store::{self, FileTaxonomyStore},
        TaxonomySnapshot,
    },
    utils::{
        dir::resolve_application_path,
        logging::{enable_logging, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "zeit", version, long_about = None)]
#[command(about = "Tracks what you are working on with local AI models", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default $XDG_STATE_HOME/zeit or $HOME/.local/state/zeit"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Run one tracking iteration now")]
    Track {
        #[arg(long, help = "Ignore pause, work hours and idleness")]
        force: bool,
    },
    #[command(about = "Show the entries of a day")]
    View {
        #[arg(help = "Day to show. Examples are \"2025-03-15\", \"yesterday\", \"15/03/2025\"")]
        date: Option<String>,
    },
    #[command(about = "Share of every activity during a day or a range of days")]
    Stats {
        #[arg(help = "First day. Examples are \"2025-03-15\", \"yesterday\", \"15/03/2025\"")]
        date: Option<String>,
        #[arg(long, help = "Last day of the range, the first day by default")]
        until: Option<String>,
        #[arg(long, help = "Count idle entries into the shares")]
        include_idle: bool,
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
    #[command(about = "Pause state, work hours, daemon and the last recorded entry")]
    Status,
    #[command(about = "Days with recorded activity")]
    Days,
    #[command(about = "Delete every entry of a day")]
    DeleteDay {
        date: String,
        #[arg(long, help = "Confirm the deletion")]
        yes: bool,
    },
    #[command(about = "Manage the activity types")]
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
    #[command(about = "Pause tracking until resumed")]
    Pause,
    #[command(about = "Resume tracking")]
    Resume,
    #[command(about = "Print the effective configuration")]
    Config {
        #[arg(long, help = "Write the default configuration file")]
        write_default: bool,
    },
    #[command(about = "Starts a daemon for the application")]
    Init,
    #[command(
        about = "Run a daemon directly in current console. Used for debugging"
    )]
    Serve,
    #[command(about = "Stop currently running daemon.")]
    Stop,
}

fn validation_error(message: String) -> anyhow::Error {
    Args::command()
        .error(clap::error::ErrorKind::ValueValidation, message)
        .into()
}

/// Taxonomy used to present records. Falls back to the defaults like a tracking run would.
async fn load_snapshot(application_path: &Path) -> Result<TaxonomySnapshot> {
    store::load_snapshot(&FileTaxonomyStore::new(
        application_path.join(TAXONOMY_FILE_NAME),
    ))
    .await
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();
    let application_path = resolve_application_path(args.dir)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(CLI_PREFIX, &application_path, logging_level, args.log)?;

    let config_path = application_path.join(CONFIG_FILE_NAME);
    let config = TrackerConfig::load(&config_path);
    let record_dir = application_path.join(RECORDS_DIR_NAME);
    let now = Local::now();
    let day = |input: Option<&str>| {
        parse_day(input, args.date_style, now).map_err(|e| validation_error(e.to_string()))
    };

    match args.commands {
        Commands::Track { force } => {
            let pipeline = create_pipeline(&config, &application_path)?;
            match pipeline.run_once(force).await {
                Ok(outcome) => {
                    report::print_outcome(&outcome);
                    Ok(())
                }
                Err(failure) => {
                    if let Some(entry) = failure.unsaved_entry() {
                        println!("Unsaved entry {}", serde_json::to_string(entry)?);
                    }
                    Err(failure.into())
                }
            }
        }
        Commands::View { date } => {
            let date = day(date.as_deref())?;
            let log = JsonActivityLog::new(record_dir)?;
            let record = log.get_day_record(date).await?;
            report::print_record(record.as_ref(), date, &load_snapshot(&application_path).await?);
            Ok(())
        }
        Commands::Stats {
            date,
            until,
            include_idle,
            json,
        } => {
            let from = day(date.as_deref())?;
            let to = match until {
                Some(until) => day(Some(&until))?,
                None => from,
            };
            if to < from {
                return Err(validation_error(format!("{to} is before {from}")));
            }
            let log = JsonActivityLog::new(record_dir)?;
            let records: Vec<_> = read_range(&log, from, to).try_collect().await?;
            let stats = analyze_days(
                &records,
                from,
                to,
                &load_snapshot(&application_path).await?,
                include_idle,
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                report::print_stats(&stats);
            }
            Ok(())
        }
        Commands::Status => {
            let marker = PauseMarker::new(config.pause_marker_path(&application_path));
            if marker.is_paused().await {
                println!("Tracking is paused");
            } else {
                println!("Tracking is active");
            }
            println!("{}", config.work_schedule().describe(now.naive_local()));

            let daemons = find_running_servers(&daemon_executable()?)?;
            if daemons.is_empty() {
                println!("Daemon is not running");
            } else {
                println!("Daemon is running");
            }

            let log = JsonActivityLog::new(record_dir)?;
            match log.last_entry(now.date_naive()).await? {
                Some(entry) => println!(
                    "Last entry {}",
                    report::format_entry(&entry, &load_snapshot(&application_path).await?)
                ),
                None => println!("Nothing recorded today"),
            }
            Ok(())
        }
        Commands::Days => {
            let log = JsonActivityLog::new(record_dir)?;
            report::print_days(&log.list_days().await?);
            Ok(())
        }
        Commands::DeleteDay { date, yes } => {
            let date = day(Some(&date))?;
            if !yes {
                return Err(validation_error(format!(
                    "Refusing to delete {date} without --yes"
                )));
            }
            let log = JsonActivityLog::new(record_dir)?;
            if log.delete_day(date).await? {
                println!("Deleted {date}");
            } else {
                println!("Nothing recorded on {date}");
            }
            Ok(())
        }
        Commands::Taxonomy { command } => {
            let store = FileTaxonomyStore::new(application_path.join(TAXONOMY_FILE_NAME));
            process_taxonomy_command(&store, command).await
        }
        Commands::Pause => {
            let marker = PauseMarker::new(config.pause_marker_path(&application_path));
            if marker.pause().await? {
                println!("Tracking paused");
            } else {
                println!("Tracking was already paused");
            }
            Ok(())
        }
        Commands::Resume => {
            let marker = PauseMarker::new(config.pause_marker_path(&application_path));
            if marker.resume().await? {
                println!("Tracking resumed");
            } else {
                println!("Tracking wasn't paused");
            }
            Ok(())
        }
        Commands::Config { write_default } => {
            if write_default {
                if config_path.exists() {
                    return Err(validation_error(format!(
                        "{} already exists",
                        config_path.display()
                    )));
                }
                TrackerConfig::write_default(&config_path)?;
                println!("Wrote {}", config_path.display());
                return Ok(());
            }
            if let Err(e) = TrackerConfig::try_load(&config_path) {
                eprintln!("{e}, the defaults are used instead");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Init => restart_server(&application_path),
        Commands::Serve => start_daemon(application_path).await,
        Commands::Stop => {
            let stopped = kill_previous_servers(&daemon_executable()?)?;
            println!("Stopped {stopped} daemon(s)");
            Ok(())
        }
    }
}
