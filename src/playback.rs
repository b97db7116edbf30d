//! Gapless playback scheduling for inbound synthesized speech.
//!
//! Buffers arrive in bursts with network jitter; each one is scheduled at
//! `max(next_start, now)` and advances `next_start` by exactly its duration,
//! so consecutive buffers play back-to-back with no gap and no overlap. A
//! barge-in flush cancels everything still queued and resets the timeline to
//! the current device clock.

use crate::codec::PlayableBuffer;
use crate::device::{AudioOutput, PlaybackId};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

struct Inner {
    state: Mutex<Schedule>,
    speaking_tx: watch::Sender<bool>,
}

struct Schedule {
    /// Earliest time the next buffer may begin on the device clock.
    /// Monotonically non-decreasing except when reset by `flush`.
    next_start: Duration,
    /// Buffers scheduled but not yet finished, tracked for cancellation.
    active: SmallVec<[PlaybackId; 8]>,
}

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    inner: Arc<Inner>,
    next_id: AtomicU64,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (speaking_tx, _) = watch::channel(false);
        let next_start = output.now();
        Self {
            output,
            inner: Arc::new(Inner {
                state: Mutex::new(Schedule {
                    next_start,
                    active: SmallVec::new(),
                }),
                speaking_tx,
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Observe whether any buffer is scheduled or playing. Drops to `false`
    /// only when the active-set drains.
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.inner.speaking_tx.subscribe()
    }

    /// Schedule a decoded buffer directly after whatever is already queued,
    /// or immediately if the queue has drained past the device clock. The id
    /// joins the active-set before the device ever sees the buffer, so a
    /// completion can never precede its registration.
    pub fn enqueue(&self, buffer: PlayableBuffer) {
        let duration = buffer.duration();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let start = {
            let mut state = self.inner.state.lock().unwrap();
            let start = state.next_start.max(self.output.now());
            state.next_start = start + duration;
            state.active.push(id);
            start
        };
        let _ = self.inner.speaking_tx.send(true);

        let inner = Arc::clone(&self.inner);
        self.output.schedule(
            buffer,
            start,
            id,
            Box::new(move |id| {
                let drained = {
                    let mut state = inner.state.lock().unwrap();
                    state.active.retain(|a| *a != id);
                    state.active.is_empty()
                };
                if drained {
                    let _ = inner.speaking_tx.send(false);
                }
            }),
        );
    }

    /// Barge-in: discard every queued-but-unplayed buffer and reset the
    /// timeline to now, so the agent appears to stop talking instantly.
    pub fn flush(&self) {
        let ids: SmallVec<[PlaybackId; 8]> = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_start = self.output.now();
            std::mem::take(&mut state.active)
        };
        for id in ids {
            self.output.cancel(id);
        }
        let _ = self.inner.speaking_tx.send(false);
    }

    /// Number of buffers scheduled but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    /// Earliest start time for the next buffer.
    pub fn next_start(&self) -> Duration {
        self.inner.state.lock().unwrap().next_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MockOutput;

    fn buffer_ms(ms: u64) -> PlayableBuffer {
        PlayableBuffer {
            samples: vec![0.0; (24 * ms) as usize],
            sample_rate: 24_000,
            channels: 1,
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<MockOutput>) {
        let output = Arc::new(MockOutput::default());
        (PlaybackScheduler::new(output.clone()), output)
    }

    #[test]
    fn consecutive_buffers_are_gapless() {
        let (scheduler, output) = scheduler();
        output.set_now(Duration::from_millis(100));

        scheduler.enqueue(buffer_ms(250));
        scheduler.enqueue(buffer_ms(250));
        scheduler.enqueue(buffer_ms(250));

        let starts = output.starts();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0].1, Duration::from_millis(100));
        assert_eq!(starts[1].1, Duration::from_millis(350));
        assert_eq!(starts[2].1, Duration::from_millis(600));
        // nextStartTime advanced by exactly the summed durations.
        assert_eq!(scheduler.next_start(), Duration::from_millis(850));
    }

    #[test]
    fn clock_ahead_of_schedule_wins_the_tiebreak() {
        let (scheduler, output) = scheduler();
        scheduler.enqueue(buffer_ms(100));
        assert_eq!(scheduler.next_start(), Duration::from_millis(100));

        // Device clock drifted past the last buffer's end: never schedule
        // into the past.
        output.set_now(Duration::from_millis(500));
        scheduler.enqueue(buffer_ms(100));

        let starts = output.starts();
        assert_eq!(starts[1].1, Duration::from_millis(500));
        assert_eq!(scheduler.next_start(), Duration::from_millis(600));
    }

    #[test]
    fn flush_empties_the_active_set_and_resets_to_now() {
        let (scheduler, output) = scheduler();
        scheduler.enqueue(buffer_ms(250));
        scheduler.enqueue(buffer_ms(250));
        scheduler.enqueue(buffer_ms(250));
        assert_eq!(scheduler.in_flight(), 3);

        output.set_now(Duration::from_millis(120));
        scheduler.flush();

        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.next_start(), Duration::from_millis(120));
        assert_eq!(output.cancelled_ids().len(), 3);

        // A buffer enqueued right after the flush starts at now, not at the
        // stale pre-flush schedule.
        scheduler.enqueue(buffer_ms(250));
        let starts = output.starts();
        assert_eq!(starts[3].1, Duration::from_millis(120));
    }

    #[test]
    fn speaking_flag_tracks_the_active_set() {
        let (scheduler, output) = scheduler();
        let speaking = scheduler.speaking();
        assert!(!*speaking.borrow());

        scheduler.enqueue(buffer_ms(50));
        scheduler.enqueue(buffer_ms(50));
        assert!(*speaking.borrow());

        output.finish_next();
        assert!(*speaking.borrow());
        output.finish_next();
        assert!(!*speaking.borrow());
    }

    /// Output that fires the completion synchronously inside `schedule`,
    /// the earliest moment the device contract allows.
    struct InstantOutput;

    impl AudioOutput for InstantOutput {
        fn now(&self) -> Duration {
            Duration::ZERO
        }

        fn schedule(
            &self,
            _buffer: PlayableBuffer,
            _at: Duration,
            id: PlaybackId,
            on_done: crate::device::DoneFn,
        ) {
            on_done(id);
        }

        fn cancel(&self, _id: PlaybackId) {}

        fn close(&self) {}
    }

    #[test]
    fn completion_during_schedule_still_retires_the_buffer() {
        let scheduler = PlaybackScheduler::new(Arc::new(InstantOutput));
        let speaking = scheduler.speaking();

        scheduler.enqueue(buffer_ms(50));

        // The buffer finished before `enqueue` returned; nothing may be
        // stranded in the active-set and the speaking flag must be down.
        assert_eq!(scheduler.in_flight(), 0);
        assert!(!*speaking.borrow());
    }

    #[test]
    fn flush_drops_the_speaking_flag() {
        let (scheduler, _output) = scheduler();
        let speaking = scheduler.speaking();
        scheduler.enqueue(buffer_ms(50));
        assert!(*speaking.borrow());
        scheduler.flush();
        assert!(!*speaking.borrow());
    }
}
