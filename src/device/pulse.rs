//! PulseAudio backends: microphone capture via the simple recording API and
//! scheduled playback on a wall-clock device timeline.
//!
//! Both backends run their blocking PulseAudio calls on dedicated OS threads
//! and talk to the async engine over channels, so no audio-path operation
//! ever blocks the supervisor task.

use super::{AudioOutput, DeviceError, DoneFn, MicDevice, PlaybackId, StreamControl};
use crate::codec::PlayableBuffer;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

fn map_pulse_err(context: &str, e: libpulse_binding::error::PAErr) -> DeviceError {
    let msg = format!("{context}: {e}");
    if msg.to_ascii_lowercase().contains("denied") {
        DeviceError::PermissionDenied(msg)
    } else {
        DeviceError::Backend(msg)
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

struct PulseMicControl {
    shutdown: Arc<AtomicBool>,
    stopped: bool,
}

impl StreamControl for PulseMicControl {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.shutdown.store(true, Ordering::Relaxed);
        }
    }
}

/// Open the default PulseAudio source as a float stream delivering
/// `frame_size`-sample frames.
pub fn open_mic(
    app_name: &str,
    sample_rate: u32,
    frame_size: usize,
) -> Result<MicDevice, DeviceError> {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };

    let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(32);
    let shutdown = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = std_mpsc::channel();

    let app = app_name.to_string();
    let shutdown_worker = shutdown.clone();
    std::thread::spawn(move || {
        // The Simple handle is created on the capture thread and never
        // leaves it.
        let simple = match Simple::new(
            None,
            &app,
            Direction::Record,
            None,
            "live-capture",
            &spec,
            None,
            None,
        ) {
            Ok(s) => {
                let _ = ready_tx.send(Ok(()));
                s
            }
            Err(e) => {
                let _ = ready_tx.send(Err(map_pulse_err("microphone open failed", e)));
                return;
            }
        };

        info!("microphone capture started at {} Hz", sample_rate);
        let mut buf = vec![0u8; frame_size * 4];
        loop {
            if shutdown_worker.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = simple.read(&mut buf) {
                error!("microphone read failed: {}", e);
                break;
            }
            let samples: Vec<f32> = buf
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if frame_tx.blocking_send(samples).is_err() {
                break;
            }
        }
        debug!("microphone capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(MicDevice {
            control: Box::new(PulseMicControl {
                shutdown,
                stopped: false,
            }),
            frames: frame_rx,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::Backend(
            "microphone capture thread died during startup".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct PlaybackJob {
    id: PlaybackId,
    at: Duration,
    buffer: PlayableBuffer,
    on_done: DoneFn,
}

struct OutputShared {
    epoch: Instant,
    cancelled: Mutex<HashSet<PlaybackId>>,
    closed: AtomicBool,
    /// Highest id the worker has fully processed. Jobs travel a FIFO and
    /// carry ascending ids, so this is a watermark.
    completed: AtomicU64,
}

impl OutputShared {
    fn take_cancelled(&self, id: PlaybackId) -> bool {
        self.cancelled.lock().unwrap().remove(&id)
    }

    /// Advance the watermark and drop any cancel that raced in while the
    /// job was being written, so the set never pins a finished id.
    fn finish(&self, id: PlaybackId) {
        self.completed.store(id, Ordering::Release);
        self.cancelled.lock().unwrap().remove(&id);
    }

    fn cancel(&self, id: PlaybackId) {
        if id <= self.completed.load(Ordering::Acquire) {
            return;
        }
        let mut cancelled = self.cancelled.lock().unwrap();
        cancelled.insert(id);
        // The job may have finished between the check and the insert.
        if id <= self.completed.load(Ordering::Acquire) {
            cancelled.remove(&id);
        }
    }
}

/// Blocking PCM sink the worker writes into. Seam over `Simple` so the
/// worker loop is testable without a PulseAudio server.
trait PcmWriter {
    fn write_pcm(&self, bytes: &[u8]) -> Result<(), String>;
}

impl PcmWriter for Simple {
    fn write_pcm(&self, bytes: &[u8]) -> Result<(), String> {
        self.write(bytes).map_err(|e| format!("{e}"))
    }
}

fn playback_worker<W: PcmWriter>(
    job_rx: std_mpsc::Receiver<PlaybackJob>,
    shared: Arc<OutputShared>,
    writer: W,
) {
    while let Ok(job) = job_rx.recv() {
        if shared.closed.load(Ordering::Relaxed) {
            break;
        }
        // Cancelled jobs are dropped before the start-time sleep, so a
        // flushed backlog cannot delay whatever was scheduled after it.
        if shared.take_cancelled(job.id) {
            debug!("skipping cancelled playback buffer {}", job.id);
            shared.finish(job.id);
            continue;
        }
        let now = shared.epoch.elapsed();
        if job.at > now {
            std::thread::sleep(job.at - now);
        }
        // The flush may have landed during the sleep.
        if shared.take_cancelled(job.id) {
            debug!("skipping cancelled playback buffer {}", job.id);
            shared.finish(job.id);
            continue;
        }
        let mut bytes = Vec::with_capacity(job.buffer.samples.len() * 4);
        for s in &job.buffer.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        if let Err(e) = writer.write_pcm(&bytes) {
            error!("playback write failed: {}", e);
        }
        (job.on_done)(job.id);
        shared.finish(job.id);
    }
    debug!("playback thread exiting");
}

/// PulseAudio playback device. Buffers are written to the server in schedule
/// order; a buffer whose start time has not been reached yet is held back
/// until the device clock catches up. Cancellation discards buffers that
/// have not started on the wire; a buffer mid-write finishes its write
/// (barge-in is about the queue, not the few milliseconds in flight).
pub struct PulseOutput {
    shared: Arc<OutputShared>,
    jobs: Mutex<Option<std_mpsc::Sender<PlaybackJob>>>,
}

pub fn open_output(app_name: &str, sample_rate: u32) -> Result<Arc<PulseOutput>, DeviceError> {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };

    let shared = Arc::new(OutputShared {
        epoch: Instant::now(),
        cancelled: Mutex::new(HashSet::new()),
        closed: AtomicBool::new(false),
        completed: AtomicU64::new(0),
    });

    let (job_tx, job_rx) = std_mpsc::channel::<PlaybackJob>();
    let (ready_tx, ready_rx) = std_mpsc::channel();

    let app = app_name.to_string();
    let worker_shared = shared.clone();
    std::thread::spawn(move || {
        let simple = match Simple::new(
            None,
            &app,
            Direction::Playback,
            None,
            "live-playback",
            &spec,
            None,
            None,
        ) {
            Ok(s) => {
                let _ = ready_tx.send(Ok(()));
                s
            }
            Err(e) => {
                let _ = ready_tx.send(Err(map_pulse_err("output open failed", e)));
                return;
            }
        };

        info!("playback output opened at {} Hz", sample_rate);
        playback_worker(job_rx, worker_shared, simple);
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Arc::new(PulseOutput {
            shared,
            jobs: Mutex::new(Some(job_tx)),
        })),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::Backend(
            "playback thread died during startup".into(),
        )),
    }
}

impl AudioOutput for PulseOutput {
    fn now(&self) -> Duration {
        self.shared.epoch.elapsed()
    }

    fn schedule(&self, buffer: PlayableBuffer, at: Duration, id: PlaybackId, on_done: DoneFn) {
        if let Some(tx) = self.jobs.lock().unwrap().as_ref() {
            let _ = tx.send(PlaybackJob {
                id,
                at,
                buffer,
                on_done,
            });
        }
    }

    fn cancel(&self, id: PlaybackId) {
        self.shared.cancel(id);
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::Relaxed) {
            // Dropping the sender lets the worker drain out and exit.
            self.jobs.lock().unwrap().take();
        }
    }
}
