use std::{ffi::c_void, path::Path, time::Duration};

use anyhow::{anyhow, bail, Result};
use image::DynamicImage;
use tracing::{error, instrument};
use windows::{
    core::PWSTR,
    Win32::{
        Foundation::{CloseHandle, BOOL, HANDLE, HWND, LPARAM, RECT},
        Graphics::Gdi::{
            BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject,
            EnumDisplayMonitors, GetDC, GetDIBits, MonitorFromWindow, ReleaseDC, SelectObject,
            BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HDC, HMONITOR,
            MONITOR_DEFAULTTONEAREST, SRCCOPY,
        },
        System::{
            SystemInformation::GetTickCount64,
            Threading::{
                OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
                PROCESS_QUERY_LIMITED_INFORMATION,
            },
        },
        UI::{
            Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO},
            WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId},
        },
    },
};

use super::{frame::bgrx_to_rgb, ActiveWindowHint, EnvironmentSampler};

unsafe extern "system" fn collect_monitor(
    monitor: HMONITOR,
    _: HDC,
    rect: *mut RECT,
    data: LPARAM,
) -> BOOL {
    let monitors = unsafe { &mut *(data.0 as *mut Vec<(HMONITOR, RECT)>) };
    monitors.push((monitor, unsafe { *rect }));
    BOOL::from(true)
}

/// Monitors with their bounds in virtual screen coordinates, in enumeration order.
fn monitors() -> Result<Vec<(HMONITOR, RECT)>> {
    let mut monitors: Vec<(HMONITOR, RECT)> = vec![];
    let success = unsafe {
        EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(collect_monitor),
            LPARAM(&mut monitors as *mut _ as isize),
        )
    };
    if !success.as_bool() {
        bail!("Failed to enumerate monitors");
    }
    Ok(monitors)
}

fn process_name(id: u32) -> Result<String> {
    let process_handle =
        unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, BOOL::from(false), id) }
            .inspect_err(|e| error!("Failed to open process {e:?}"))?;

    let mut text: [u16; 4096] = [0; 4096];
    let path = unsafe { get_process_path(process_handle, &mut text) };
    unsafe { CloseHandle(process_handle) }
        .inspect_err(|e| error!("Failed to close handle {e:?}"))?;
    let path = path?;

    Ok(Path::new(&path)
        .file_stem()
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or(path))
}

unsafe fn get_process_path(process_handle: HANDLE, text: &mut [u16]) -> Result<String> {
    let mut length = text.len() as u32;
    unsafe {
        QueryFullProcessImageNameW(
            process_handle,
            PROCESS_NAME_WIN32,
            PWSTR(text.as_mut_ptr()),
            &mut length,
        )?
    };
    Ok(String::from_utf16_lossy(&text[..length as usize]))
}

#[instrument]
fn get_active() -> Result<ActiveWindowHint> {
    let window = unsafe { GetForegroundWindow() };
    if window.is_invalid() {
        return Err(anyhow!("Failed to get foreground window"));
    }

    let monitor = unsafe { MonitorFromWindow(window, MONITOR_DEFAULTTONEAREST) };
    let screen_index = monitors()?
        .iter()
        .position(|(v, _)| *v == monitor)
        .map_or(1, |v| v + 1);

    let mut id = 0u32;
    unsafe { GetWindowThreadProcessId(window, Some(&mut id)) };
    let app_name = if id == 0 {
        None
    } else {
        process_name(id)
            .inspect_err(|e| error!("Failed to resolve process name {e:?}"))
            .ok()
    };

    Ok(ActiveWindowHint {
        screen_index,
        app_name,
    })
}

fn get_idle_time() -> Result<Duration> {
    let mut last: LASTINPUTINFO = LASTINPUTINFO {
        cbSize: size_of::<LASTINPUTINFO>() as u32,
        dwTime: 0,
    };
    let is_success = unsafe { GetLastInputInfo(&mut last) };
    if !is_success.as_bool() {
        return Err(anyhow!("Failed to retrieve user idle time"));
    }

    // GetLastInputInfo is based on the 32 bit tick count which wraps after ~49 days.
    let tick_count = unsafe { GetTickCount64() } as u32;
    Ok(Duration::from_millis(
        tick_count.wrapping_sub(last.dwTime) as u64,
    ))
}

/// Copies the `rect` area of the virtual screen through a memory DC.
fn capture_rect(rect: &RECT) -> Result<DynamicImage> {
    let width = rect.right - rect.left;
    let height = rect.bottom - rect.top;
    if width <= 0 || height <= 0 {
        bail!("Monitor has an empty area {width}x{height}");
    }

    unsafe {
        let screen = GetDC(HWND::default());
        if screen.is_invalid() {
            bail!("Failed to get the screen device context");
        }
        let memory = CreateCompatibleDC(screen);
        let bitmap = CreateCompatibleBitmap(screen, width, height);
        let previous = SelectObject(memory, bitmap);

        let result = (|| -> Result<DynamicImage> {
            BitBlt(
                memory, 0, 0, width, height, screen, rect.left, rect.top, SRCCOPY,
            )?;

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    // Negative height gives top-down rows.
                    biHeight: -height,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let mut buffer = vec![0u8; width as usize * height as usize * 4];
            let lines = GetDIBits(
                memory,
                bitmap,
                0,
                height as u32,
                Some(buffer.as_mut_ptr() as *mut c_void),
                &mut info,
                DIB_RGB_COLORS,
            );
            if lines == 0 {
                bail!("Failed to read the captured bitmap");
            }
            Ok(DynamicImage::ImageRgb8(bgrx_to_rgb(
                &buffer,
                width as u32,
                height as u32,
            )?))
        })();

        SelectObject(memory, previous);
        let _ = DeleteObject(bitmap);
        let _ = DeleteDC(memory);
        ReleaseDC(HWND::default(), screen);
        result
    }
}

pub struct WindowsEnvironment {}

impl WindowsEnvironment {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for WindowsEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentSampler for WindowsEnvironment {
    fn idle_time(&mut self) -> Result<Duration> {
        get_idle_time().inspect_err(|e| error!("Failed to get idle time {e:?}"))
    }

    fn active_window(&mut self) -> Result<ActiveWindowHint> {
        get_active().inspect_err(|e| error!("Failed to get active window {e:?}"))
    }

    #[instrument(skip(self))]
    fn capture_screens(&mut self) -> Result<Vec<DynamicImage>> {
        monitors()?.iter().map(|(_, rect)| capture_rect(rect)).collect()
    }
}
