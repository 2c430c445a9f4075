//! Contains logic for observing the user's environment on different platforms.
//! [GenericEnvironment] is the main artifact of this module that abstracts the operations,
//! [capture_sample] applies the rules about which failures are tolerated.

pub mod frame;
#[cfg(feature = "win")]
pub mod win;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "win")]
extern crate windows;

#[cfg(feature = "x11")]
extern crate xcb;

use std::time::Duration;

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::pipeline::error::PipelineError;

use self::frame::{downscale, encode_png, MAX_FRAME_DIMENSION};

/// Where the user is looking, as far as the platform can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindowHint {
    /// 1-based index of the display holding the focused window.
    pub screen_index: usize,
    /// For example `code` or `firefox`.
    pub app_name: Option<String>,
}

/// One display, downscaled and PNG encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// 1-based.
    pub screen_index: usize,
    pub image: Vec<u8>,
    pub is_active_screen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSample {
    pub frames: Vec<CapturedFrame>,
    pub active_screen_index: usize,
    pub frontmost_app_name: Option<String>,
    pub idle_time: Duration,
}

/// Intended to serve as a contract every supported platform must implement.
#[cfg_attr(test, mockall::automock)]
pub trait EnvironmentSampler: Send {
    /// Time since the last keyboard or mouse input.
    fn idle_time(&mut self) -> Result<Duration>;

    fn active_window(&mut self) -> Result<ActiveWindowHint>;

    /// One image per connected display, in display order.
    fn capture_screens(&mut self) -> Result<Vec<DynamicImage>>;
}

/// Reads the idle time. A failure is treated as an active user so that tracking isn't silently
/// replaced by idle entries.
pub fn read_idle_time(sampler: &mut dyn EnvironmentSampler) -> Duration {
    match sampler.idle_time() {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to read idle time, assuming the user is active {e:?}");
            Duration::ZERO
        }
    }
}

/// Captures every display and gathers the hints describing them. Hint failures degrade to screen 1
/// and no application name, a failure to capture anything fails the sample.
pub fn capture_sample(
    sampler: &mut dyn EnvironmentSampler,
    idle_time: Duration,
) -> Result<EnvironmentSample, PipelineError> {
    let hint = sampler.active_window().unwrap_or_else(|e| {
        warn!("Failed to detect the active window {e:?}");
        ActiveWindowHint {
            screen_index: 1,
            app_name: None,
        }
    });

    let images = sampler
        .capture_screens()
        .map_err(|e| PipelineError::CaptureUnavailable(format!("{e:#}")))?;
    if images.is_empty() {
        return Err(PipelineError::CaptureUnavailable(
            "no displays were found".into(),
        ));
    }

    let active_screen_index = if (1..=images.len()).contains(&hint.screen_index) {
        hint.screen_index
    } else {
        debug!(
            "Active screen {} doesn't exist among {} displays",
            hint.screen_index,
            images.len()
        );
        1
    };

    let frames = images
        .into_iter()
        .enumerate()
        .map(|(i, image)| {
            let image = encode_png(&downscale(image, MAX_FRAME_DIMENSION))
                .map_err(|e| PipelineError::CaptureUnavailable(format!("{e:#}")))?;
            Ok(CapturedFrame {
                screen_index: i + 1,
                image,
                is_active_screen: i + 1 == active_screen_index,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    Ok(EnvironmentSample {
        frames,
        active_screen_index,
        frontmost_app_name: hint.app_name.filter(|v| !v.trim().is_empty()),
        idle_time,
    })
}

/// Full sample including the idle time.
pub fn sample(sampler: &mut dyn EnvironmentSampler) -> Result<EnvironmentSample, PipelineError> {
    let idle_time = read_idle_time(sampler);
    capture_sample(sampler, idle_time)
}

/// Serves as a cross-compatible EnvironmentSampler implementation.
pub struct GenericEnvironment {
    inner: Box<dyn EnvironmentSampler>,
}

impl GenericEnvironment {
    pub fn new() -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "win")] {
                use win::WindowsEnvironment;
                Ok(Self {
                    inner: Box::new(WindowsEnvironment::new()),
                })
            }
            else if #[cfg(feature = "x11")] {
                use x11::LinuxEnvironment;
                Ok(Self {
                    inner: Box::new(LinuxEnvironment::new()?),
                })
            }
            else {
                anyhow::bail!("zeit was built without a capture backend, enable the `x11` or `win` feature")
            }
        }
    }
}

impl EnvironmentSampler for GenericEnvironment {
    fn idle_time(&mut self) -> Result<Duration> {
        self.inner.idle_time()
    }

    fn active_window(&mut self) -> Result<ActiveWindowHint> {
        self.inner.active_window()
    }

    fn capture_screens(&mut self) -> Result<Vec<DynamicImage>> {
        self.inner.capture_screens()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use image::{DynamicImage, RgbImage};

    use crate::pipeline::error::PipelineError;

    use super::{capture_sample, sample, ActiveWindowHint, MockEnvironmentSampler};

    fn screens(count: usize) -> Vec<DynamicImage> {
        (0..count)
            .map(|_| DynamicImage::ImageRgb8(RgbImage::new(2000, 1000)))
            .collect()
    }

    #[test]
    fn marks_the_active_screen() {
        let mut sampler = MockEnvironmentSampler::new();
        sampler.expect_idle_time().returning(|| Ok(Duration::from_secs(4)));
        sampler.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 2,
                app_name: Some("code".into()),
            })
        });
        sampler.expect_capture_screens().returning(|| Ok(screens(2)));

        let sample = sample(&mut sampler).unwrap();
        assert_eq!(sample.active_screen_index, 2);
        assert_eq!(sample.frontmost_app_name.as_deref(), Some("code"));
        assert_eq!(sample.idle_time, Duration::from_secs(4));
        assert_eq!(
            sample
                .frames
                .iter()
                .map(|v| (v.screen_index, v.is_active_screen))
                .collect::<Vec<_>>(),
            vec![(1, false), (2, true)]
        );
        let first = image::load_from_memory(&sample.frames[0].image).unwrap();
        assert_eq!((first.width(), first.height()), (1536, 768));
    }

    #[test]
    fn hint_failures_degrade_to_defaults() {
        let mut sampler = MockEnvironmentSampler::new();
        sampler.expect_idle_time().returning(|| Err(anyhow!("no screensaver extension")));
        sampler
            .expect_active_window()
            .returning(|| Err(anyhow!("no active window")));
        sampler.expect_capture_screens().returning(|| Ok(screens(2)));

        let sample = sample(&mut sampler).unwrap();
        assert_eq!(sample.active_screen_index, 1);
        assert_eq!(sample.frontmost_app_name, None);
        assert_eq!(sample.idle_time, Duration::ZERO);
        assert!(sample.frames[0].is_active_screen);
    }

    #[test]
    fn unknown_screen_falls_back_to_the_first() {
        let mut sampler = MockEnvironmentSampler::new();
        sampler.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 3,
                app_name: Some(" ".into()),
            })
        });
        sampler.expect_capture_screens().returning(|| Ok(screens(1)));

        let sample = capture_sample(&mut sampler, Duration::ZERO).unwrap();
        assert_eq!(sample.active_screen_index, 1);
        assert_eq!(sample.frontmost_app_name, None);
    }

    #[test]
    fn capture_failures_are_fatal() {
        let mut sampler = MockEnvironmentSampler::new();
        sampler.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 1,
                app_name: None,
            })
        });
        sampler
            .expect_capture_screens()
            .returning(|| Err(anyhow!("permission denied")));
        assert!(matches!(
            capture_sample(&mut sampler, Duration::ZERO),
            Err(PipelineError::CaptureUnavailable(_))
        ));

        let mut sampler = MockEnvironmentSampler::new();
        sampler.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 1,
                app_name: None,
            })
        });
        sampler.expect_capture_screens().returning(|| Ok(vec![]));
        assert!(matches!(
            capture_sample(&mut sampler, Duration::ZERO),
            Err(PipelineError::CaptureUnavailable(_))
        ));
    }
}
