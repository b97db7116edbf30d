//! Visual sampler: injects a downscaled still frame into the outbound sink
//! on a fixed wall-clock cadence, independent of the audio frame cadence.
//!
//! Disabling the camera mid-session does not tear the timer down; each tick
//! just no-ops, so re-enabling resumes on the next tick without any
//! resubscription race.

use crate::codec::{self, TransportFrame};
use crate::device::VideoGrabber;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Longer image side after downscaling.
pub const IMAGE_MAX_DIM: u32 = 512;

/// JPEG quality for outbound frames.
pub const IMAGE_QUALITY: u8 = 75;

pub(crate) fn spawn_sampler(
    mut grabber: Box<dyn VideoGrabber>,
    period: Duration,
    enabled: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<TransportFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("visual sampler started, one frame per {:?}", period);
        let mut ticker = interval(period);
        // First tick fires immediately; skip it so the cadence starts one
        // period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            match grabber.grab() {
                Ok(frame) => match codec::encode_image(&frame, IMAGE_MAX_DIM, IMAGE_QUALITY) {
                    Ok(encoded) => {
                        if outbound.send(encoded).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("image encode failed, skipping frame: {}", e),
                },
                Err(e) => debug!("no video frame this tick: {}", e),
            }
        }
        debug!("visual sampler stopped");
    })
}
