//! Device seams: microphone, video source, and audio output.
//!
//! The session controller is the only owner of device handles; producers get
//! frame streams, the controller keeps the matching [`StreamControl`] and is
//! the only code path that releases anything. Real backends live in
//! [`pulse`] (PulseAudio capture/playback) and [`screen`] (xcap frames as
//! the video source).

pub mod pulse;
pub mod screen;

use crate::codec::PlayableBuffer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier for a buffer scheduled on an output device.
pub type PlaybackId = u64;

/// Completion callback invoked by the output device once a scheduled buffer
/// has finished playing. Not invoked for cancelled buffers.
pub type DoneFn = Box<dyn FnOnce(PlaybackId) + Send>;

/// Errors raised by device backends.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no suitable device found: {0}")]
    NotFound(String),

    #[error("device backend error: {0}")]
    Backend(String),
}

/// Release handle for a live capture stream. Implementations must be
/// idempotent and safe to call after the underlying stream already ended.
pub trait StreamControl: Send {
    fn stop(&mut self);
}

/// Pull interface for raw video frames. Owned by the visual sampler for the
/// lifetime of one session.
pub trait VideoGrabber: Send {
    fn grab(&mut self) -> Result<image::RgbaImage, DeviceError>;
}

/// Audio output device: schedules decoded buffers at explicit positions on
/// its own clock. The caller assigns the id and must register it before
/// handing over the completion callback; the callback may fire from another
/// thread at any point once `schedule` has been entered.
pub trait AudioOutput: Send + Sync {
    /// Current position on the device clock.
    fn now(&self) -> Duration;

    /// Schedule `buffer` to begin at `at` on the device clock, under the
    /// caller-chosen `id`.
    fn schedule(&self, buffer: PlayableBuffer, at: Duration, id: PlaybackId, on_done: DoneFn);

    /// Discard a scheduled buffer. No-op for ids already finished.
    fn cancel(&self, id: PlaybackId);

    /// Release the output device. Idempotent.
    fn close(&self);
}

/// An opened microphone: fixed-size float frames plus its release handle.
/// The frame channel closing without a `stop()` means the device was lost.
pub struct MicDevice {
    pub control: Box<dyn StreamControl>,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

/// An opened video source.
pub struct CameraDevice {
    pub control: Box<dyn StreamControl>,
    pub frames: Box<dyn VideoGrabber>,
}

/// Factory for the devices one session owns exclusively.
pub trait Devices: Send + Sync {
    fn open_mic(&self, sample_rate: u32, frame_size: usize) -> Result<MicDevice, DeviceError>;
    fn open_camera(&self) -> Result<CameraDevice, DeviceError>;
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError>;
}

/// Real system devices: PulseAudio for audio in/out, the primary screen as
/// the video source.
pub struct SystemDevices {
    app_name: String,
}

impl SystemDevices {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

impl Devices for SystemDevices {
    fn open_mic(&self, sample_rate: u32, frame_size: usize) -> Result<MicDevice, DeviceError> {
        pulse::open_mic(&self.app_name, sample_rate, frame_size)
    }

    fn open_camera(&self) -> Result<CameraDevice, DeviceError> {
        screen::open_screen()
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError> {
        Ok(pulse::open_output(&self.app_name, sample_rate)?)
    }
}
