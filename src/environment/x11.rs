use std::time::Duration;

use anyhow::{anyhow, Result};
use image::DynamicImage;
use sysinfo::Pid;
use tracing::{debug, instrument};
use xcb::{
    randr::GetMonitors,
    screensaver::{QueryInfo, QueryInfoReply},
    x::{
        self, Atom, Drawable, GetGeometry, GetProperty, InternAtom, TranslateCoordinates, Window,
        ATOM_ANY,
    },
    Connection, Extension,
};

use super::{frame::bgrx_to_rgb, ActiveWindowHint, EnvironmentSampler};

/// Bounds of one RandR monitor in root window coordinates.
#[derive(Debug, Clone, Copy)]
struct Monitor {
    x: i16,
    y: i16,
    width: u16,
    height: u16,
}

impl Monitor {
    fn contains(&self, x: i32, y: i32) -> bool {
        let left = self.x as i32;
        let top = self.y as i32;
        left <= x && x < left + self.width as i32 && top <= y && y < top + self.height as i32
    }
}

fn intern_atom(conn: &Connection, name: &[u8]) -> Result<Atom> {
    let reply = conn.wait_for_reply(conn.send_request(&InternAtom {
        only_if_exists: false,
        name,
    }))?;
    Ok(reply.atom())
}

fn get_pid(conn: &Connection, window: Window, pid_atom: Atom) -> Result<Option<u32>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property: pid_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    Ok(result.value::<u32>().first().copied())
}

fn get_process_name(id: u32) -> Option<String> {
    let system = sysinfo::System::new_all();
    let process = system.process(Pid::from_u32(id))?;
    Some(process.name().to_string_lossy().into_owned())
}

fn get_active_window(conn: &Connection, root: Window, active_window_atom: Atom) -> Result<Window> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window: root,
        property: active_window_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    result
        .value::<Window>()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("_NET_ACTIVE_WINDOW is not set"))
}

/// Center of `window` in root coordinates.
fn window_center(conn: &Connection, root: Window, window: Window) -> Result<(i32, i32)> {
    let geometry = conn.wait_for_reply(conn.send_request(&GetGeometry {
        drawable: Drawable::Window(window),
    }))?;
    let translated = conn.wait_for_reply(conn.send_request(&TranslateCoordinates {
        src_window: window,
        dst_window: root,
        src_x: 0,
        src_y: 0,
    }))?;
    Ok((
        translated.dst_x() as i32 + geometry.width() as i32 / 2,
        translated.dst_y() as i32 + geometry.height() as i32 / 2,
    ))
}

pub struct LinuxEnvironment {
    connection: Connection,
    preferred_screen: i32,
    active_window_atom: Atom,
    pid_atom: Atom,
}

impl LinuxEnvironment {
    pub fn new() -> Result<Self> {
        let (connection, preferred_screen) = Connection::connect_with_extensions(
            None,
            &[Extension::ScreenSaver, Extension::RandR],
            &[],
        )?;
        let active_window_atom = intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let pid_atom = intern_atom(&connection, b"_NET_WM_PID")?;
        Ok(Self {
            connection,
            preferred_screen,
            active_window_atom,
            pid_atom,
        })
    }

    fn root(&self) -> Result<Window> {
        // Only a single x11 screen is supported, multiple monitors come from RandR.
        self.connection
            .get_setup()
            .roots()
            .nth(self.preferred_screen.max(0) as usize)
            .map(|v| v.root())
            .ok_or_else(|| anyhow!("X screen {} doesn't exist", self.preferred_screen))
    }

    fn monitors(&self, root: Window) -> Result<Vec<Monitor>> {
        let reply = self
            .connection
            .wait_for_reply(self.connection.send_request(&GetMonitors {
                window: root,
                get_active: true,
            }))?;
        Ok(reply
            .monitors()
            .map(|v| Monitor {
                x: v.x(),
                y: v.y(),
                width: v.width(),
                height: v.height(),
            })
            .collect())
    }
}

impl EnvironmentSampler for LinuxEnvironment {
    #[instrument(skip(self))]
    fn idle_time(&mut self) -> Result<Duration> {
        let root = self.root()?;
        let idle = self.connection.send_request(&QueryInfo {
            drawable: Drawable::Window(root),
        });
        let reply: QueryInfoReply = self.connection.wait_for_reply(idle)?;
        Ok(Duration::from_millis(reply.ms_since_user_input() as u64))
    }

    #[instrument(skip(self))]
    fn active_window(&mut self) -> Result<ActiveWindowHint> {
        let root = self.root()?;
        let window = get_active_window(&self.connection, root, self.active_window_atom)?;
        let app_name = get_pid(&self.connection, window, self.pid_atom)?.and_then(get_process_name);

        let (x, y) = window_center(&self.connection, root, window)?;
        let screen_index = self
            .monitors(root)?
            .iter()
            .position(|v| v.contains(x, y))
            .map_or(1, |v| v + 1);
        debug!("Active window {app_name:?} is on screen {screen_index}");

        Ok(ActiveWindowHint {
            screen_index,
            app_name,
        })
    }

    #[instrument(skip(self))]
    fn capture_screens(&mut self) -> Result<Vec<DynamicImage>> {
        let root = self.root()?;
        let mut monitors = self.monitors(root)?;
        if monitors.is_empty() {
            let geometry = self
                .connection
                .wait_for_reply(self.connection.send_request(&GetGeometry {
                    drawable: Drawable::Window(root),
                }))?;
            monitors.push(Monitor {
                x: 0,
                y: 0,
                width: geometry.width(),
                height: geometry.height(),
            });
        }

        monitors
            .iter()
            .map(|monitor| {
                let reply = self
                    .connection
                    .wait_for_reply(self.connection.send_request(&x::GetImage {
                        format: x::ImageFormat::ZPixmap,
                        drawable: Drawable::Window(root),
                        x: monitor.x,
                        y: monitor.y,
                        width: monitor.width,
                        height: monitor.height,
                        plane_mask: u32::MAX,
                    }))?;
                let rgb =
                    bgrx_to_rgb(reply.data(), monitor.width as u32, monitor.height as u32)?;
                Ok(DynamicImage::ImageRgb8(rgb))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Monitor;

    #[test]
    fn monitor_bounds_are_half_open() {
        let monitor = Monitor {
            x: 1920,
            y: 0,
            width: 1280,
            height: 1024,
        };
        assert!(monitor.contains(1920, 0));
        assert!(!monitor.contains(3200, 10));
        assert!(!monitor.contains(1919, 10));
    }
}
