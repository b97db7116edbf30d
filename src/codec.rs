//! Frame codec: PCM16 buffers to and from the text-safe transport encoding,
//! plus expansion into playable floating-point buffers.
//!
//! Everything here is stateless. Capture frames (16 kHz) and playback frames
//! (24 kHz) use different rates by design, so every buffer carries its own
//! rate and channel metadata instead of relying on a crate-wide constant.

use base64::engine::general_purpose;
use base64::Engine;
use image::RgbaImage;
use std::time::Duration;

/// Sample rate used for outbound speech capture.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the remote session uses for synthesized speech.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// An ordered buffer of 16-bit signed PCM samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcm16Buffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Content carried by a [`TransportFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Image,
}

/// The encoded form of an audio or image frame as it crosses the session
/// boundary: base64 payload plus a MIME tag.
#[derive(Debug, Clone)]
pub struct TransportFrame {
    pub kind: FrameKind,
    pub data: String,
    pub mime_type: String,
}

/// A decoded buffer ready for scheduling on an output device.
#[derive(Debug, Clone)]
pub struct PlayableBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u8,
}

impl PlayableBuffer {
    /// Exact playback duration of this buffer.
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as f64 / self.channels.max(1) as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }
}

/// Error type for decode failures. Malformed inbound frames are expected to
/// be dropped by the caller; they are never fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("truncated PCM payload ({0} bytes, not a whole number of samples)")]
    TruncatedPayload(usize),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Encode a PCM buffer into its transport form. Total for well-formed input:
/// samples are serialized little-endian and base64-encoded.
pub fn encode_audio(pcm: &Pcm16Buffer) -> TransportFrame {
    let mut bytes = Vec::with_capacity(pcm.samples.len() * 2);
    for s in &pcm.samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    TransportFrame {
        kind: FrameKind::Audio,
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", pcm.sample_rate),
    }
}

/// Decode a transport payload back into PCM samples.
pub fn decode_audio(data: &str, sample_rate: u32) -> Result<Pcm16Buffer, CodecError> {
    let bytes = general_purpose::STANDARD.decode(data)?;
    if bytes.len() % 2 != 0 {
        return Err(CodecError::TruncatedPayload(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(Pcm16Buffer {
        samples,
        sample_rate,
        channels: 1,
    })
}

/// Expand 16-bit samples to normalized floats. Pure and total.
pub fn to_playable(pcm: &Pcm16Buffer) -> PlayableBuffer {
    PlayableBuffer {
        samples: pcm.samples.iter().map(|s| *s as f32 / 32768.0).collect(),
        sample_rate: pcm.sample_rate,
        channels: pcm.channels,
    }
}

/// Convert captured floating-point samples to 16-bit PCM, clamping anything
/// outside [-1.0, 1.0].
pub fn samples_from_f32(frame: &[f32]) -> Vec<i16> {
    frame
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Downscale a raw video frame and encode it as a JPEG transport frame.
/// The longer side is reduced to `max_dim` (aspect preserved); frames already
/// small enough are encoded as-is.
pub fn encode_image(
    frame: &RgbaImage,
    max_dim: u32,
    quality: u8,
) -> Result<TransportFrame, CodecError> {
    let (w, h) = frame.dimensions();
    let rgb = if w.max(h) > max_dim {
        let scale = max_dim as f32 / w.max(h) as f32;
        let nw = ((w as f32 * scale) as u32).max(1);
        let nh = ((h as f32 * scale) as u32).max(1);
        image::imageops::resize(frame, nw, nh, image::imageops::FilterType::Triangle)
    } else {
        frame.clone()
    };
    let rgb = image::DynamicImage::ImageRgba8(rgb).to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ExtendedColorType::Rgb8,
    )?;

    Ok(TransportFrame {
        kind: FrameKind::Image,
        data: general_purpose::STANDARD.encode(&jpeg),
        mime_type: "image/jpeg".to_string(),
    })
}
