//! Capture pipeline: turns the live microphone stream into a steady cadence
//! of outbound audio frames.
//!
//! Each frame boundary does three bounded-cost steps in order: level metric
//! to the side channel, f32 -> PCM16 conversion, encode + push to the ordered
//! outbound sink. The level side channel never blocks the push path. If the
//! stream ends without a stop, `DeviceLost` goes upward and the pipeline goes
//! quiet; the session controller decides what happens next.

use crate::codec::{self, Pcm16Buffer};
use crate::codec::TransportFrame;
use crate::session::EngineEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Coarse amplitude metric for UI meters: RMS of one frame, in [0, 1].
pub fn rms_level(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

pub(crate) fn spawn_capture(
    mut frames: mpsc::Receiver<Vec<f32>>,
    sample_rate: u32,
    outbound: mpsc::UnboundedSender<TransportFrame>,
    level_tx: watch::Sender<f32>,
    muted: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("capture pipeline started at {} Hz", sample_rate);
        while let Some(frame) = frames.recv().await {
            let _ = level_tx.send(rms_level(&frame));

            if muted.load(Ordering::Relaxed) {
                continue;
            }

            let pcm = Pcm16Buffer {
                samples: codec::samples_from_f32(&frame),
                sample_rate,
                channels: 1,
            };
            if outbound.send(codec::encode_audio(&pcm)).is_err() {
                // Sink is gone; teardown is already underway.
                break;
            }
        }
        debug!("capture pipeline stream ended");
        let _ = events.send(EngineEvent::DeviceLost(
            "microphone stream ended".to_string(),
        ));
    })
}
