//! Screen frames as the session's video source, via `xcap`.
//!
//! The recorder handle stays with the session controller (it is the release
//! path); the sampler only sees the frame receiver.

use super::{CameraDevice, DeviceError, StreamControl, VideoGrabber};
use image::RgbaImage;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::info;
use xcap::{Frame, Monitor, VideoRecorder};

struct ScreenControl {
    recorder: Option<VideoRecorder>,
}

impl StreamControl for ScreenControl {
    fn stop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            let _ = recorder.stop();
        }
    }
}

struct ScreenGrabber {
    frames: Receiver<Frame>,
}

impl VideoGrabber for ScreenGrabber {
    fn grab(&mut self) -> Result<RgbaImage, DeviceError> {
        let frame = self
            .frames
            .recv_timeout(Duration::from_millis(500))
            .map_err(|e| DeviceError::Backend(format!("no frame available: {e}")))?;
        RgbaImage::from_raw(frame.width, frame.height, frame.raw)
            .ok_or_else(|| DeviceError::Backend("frame buffer size mismatch".into()))
    }
}

/// Open a recorder on the primary monitor.
pub fn open_screen() -> Result<CameraDevice, DeviceError> {
    let monitors = Monitor::all().map_err(|e| DeviceError::Backend(e.to_string()))?;
    if monitors.is_empty() {
        return Err(DeviceError::NotFound("no monitors found".into()));
    }
    let monitor = monitors
        .iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .unwrap_or(&monitors[0])
        .clone();

    info!(
        "using monitor {} ({}x{})",
        monitor.name().unwrap_or_else(|_| "unknown".to_string()),
        monitor.width().unwrap_or(0),
        monitor.height().unwrap_or(0),
    );

    let (recorder, frames) = monitor
        .video_recorder()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;
    recorder
        .start()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

    Ok(CameraDevice {
        control: Box::new(ScreenControl {
            recorder: Some(recorder),
        }),
        frames: Box::new(ScreenGrabber { frames }),
    })
}
