//! Session controller: the state machine that owns every device handle and
//! supervises the capture pipeline, visual sampler, playback scheduler, and
//! remote session for the lifetime of one live conversation.
//!
//! All event sources (inbound remote messages, capture pipeline events,
//! speaking-flag changes, presentation commands) interleave on one
//! supervisor task; every transition's side effects live here instead of
//! being scattered across callbacks. Teardown is a single ordered, guarded
//! path reachable from every trigger (local stop, remote close, fatal
//! error), so no device handle can survive a session.

use crate::capture;
use crate::codec::{self, TransportFrame};
use crate::device::{AudioOutput, DeviceError, Devices, StreamControl, VideoGrabber};
use crate::error::SessionError;
use crate::playback::PlaybackScheduler;
use crate::remote::{RemoteConnector, RemoteSession, RemoteSink, SessionConfig};
use crate::remote::ServerEvent;
use crate::sampler;
use crate::transcript::{TranscriptEntry, TranscriptFeed, DEFAULT_WINDOW};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine-level configuration for one session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbound capture rate.
    pub capture_rate: u32,
    /// Samples per capture frame (~250 ms at the capture rate).
    pub frame_samples: usize,
    /// Inbound synthesized speech rate.
    pub playback_rate: u32,
    /// Wall-clock period between outbound video frames.
    pub image_period: Duration,
    /// Whether to open the video source at all.
    pub video: bool,
    /// Transcript ring capacity.
    pub transcript_window: usize,
    /// Remote session parameters (endpoint, persona, voice, modality).
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_rate: codec::CAPTURE_SAMPLE_RATE,
            frame_samples: codec::CAPTURE_SAMPLE_RATE as usize / 4,
            playback_rate: codec::PLAYBACK_SAMPLE_RATE,
            image_period: Duration::from_secs(1),
            video: true,
            transcript_window: DEFAULT_WINDOW,
            session: SessionConfig::from_url(""),
        }
    }
}

/// Status surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Closed,
    Error(String),
}

/// The controller's state. `listening`/`speaking` are independent flags
/// inside `Open`, not mutually exclusive phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open { listening: bool, speaking: bool },
    Closing,
    Closed,
    Error,
}

/// Inputs to the transition function.
#[derive(Debug, Clone, Copy)]
pub enum StateEvent {
    StartRequested,
    RemoteOpened,
    SpeakingChanged(bool),
    CloseRequested,
    TeardownComplete,
    Fatal,
}

impl SessionState {
    /// Single total transition function. Terminal states absorb everything.
    pub fn next(self, event: StateEvent) -> SessionState {
        use SessionState::*;
        use StateEvent::*;
        match (self, event) {
            (Closed, _) | (Error, _) => self,
            (_, Fatal) => Error,
            (Idle, StartRequested) => Connecting,
            (Connecting, RemoteOpened) => Open {
                listening: true,
                speaking: false,
            },
            (Open { listening, .. }, SpeakingChanged(speaking)) => Open { listening, speaking },
            (_, CloseRequested) => Closing,
            (Closing, TeardownComplete) => Closed,
            (state, _) => state,
        }
    }
}

/// Internal events raised by the producer tasks.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    DeviceLost(String),
    RemoteSendFailed(String),
}

enum Command {
    Stop,
}

/// Handle to a running session. Cheap accessors for the presentation layer
/// plus the `stop()` path; dropping the handle also stops the session.
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    level_rx: watch::Receiver<f32>,
    transcript: Arc<TranscriptFeed>,
    muted: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_stream(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Live capture level for UI meters.
    pub fn level_stream(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.snapshot()
    }

    /// Mute the outbound audio path. The level meter stays live.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Toggle the video stream. The sampler timer keeps running either way;
    /// a disabled tick is a no-op.
    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            *self.status_rx.borrow(),
            SessionStatus::Closed | SessionStatus::Error(_)
        )
    }

    /// Request teardown and wait for it to finish. Callable from any state,
    /// any number of times.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
        let mut status = self.status_rx.clone();
        loop {
            let terminal = matches!(
                *status.borrow(),
                SessionStatus::Closed | SessionStatus::Error(_)
            );
            if terminal || status.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Front door: owns the device factories and enforces the one-session-at-a-
/// time policy before any resource is touched.
pub struct LiveEngine {
    devices: Arc<dyn Devices>,
    connector: Arc<dyn RemoteConnector>,
    active: Option<SessionHandle>,
}

impl LiveEngine {
    pub fn new(devices: Arc<dyn Devices>, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            devices,
            connector,
            active: None,
        }
    }

    /// Start a session. Rejected synchronously if one is already active;
    /// every `start()` creates fresh instances of every owned resource.
    pub fn start(&mut self, config: EngineConfig) -> Result<&SessionHandle, SessionError> {
        if let Some(handle) = &self.active {
            if !handle.is_terminal() {
                return Err(SessionError::SchedulingConflict);
            }
        }
        let handle = spawn_session(self.devices.clone(), self.connector.clone(), config);
        Ok(self.active.insert(handle))
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = &self.active {
            handle.stop().await;
        }
    }
}

fn spawn_session(
    devices: Arc<dyn Devices>,
    connector: Arc<dyn RemoteConnector>,
    config: EngineConfig,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
    let (level_tx, level_rx) = watch::channel(0.0);
    let transcript = Arc::new(TranscriptFeed::new(config.transcript_window));
    let muted = Arc::new(AtomicBool::new(false));
    let video_enabled = Arc::new(AtomicBool::new(config.video));

    let supervisor = Supervisor {
        devices,
        connector,
        config,
        status_tx,
        level_tx: Some(level_tx),
        transcript: transcript.clone(),
        muted: muted.clone(),
        video_enabled: video_enabled.clone(),
        command_rx,
        state: SessionState::Idle,
    };
    tokio::spawn(supervisor.run());

    SessionHandle {
        command_tx,
        status_rx,
        level_rx,
        transcript,
        muted,
        video_enabled,
    }
}

type SharedSink = Arc<Mutex<Box<dyn RemoteSink>>>;

/// Everything the open phase needs once the remote session reports `opened`.
struct Wired {
    mic_frames: mpsc::Receiver<Vec<f32>>,
    camera: Option<Box<dyn VideoGrabber>>,
    output: Arc<dyn AudioOutput>,
    sink: SharedSink,
    events: mpsc::Receiver<ServerEvent>,
}

/// Owned resources, released in a fixed order. Every step only acts if the
/// resource is still held, so teardown stays idempotent no matter how many
/// trigger paths race into it.
#[derive(Default)]
struct Teardown {
    sampler: Option<JoinHandle<()>>,
    capture: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    remote: Option<SharedSink>,
    mic: Option<Box<dyn StreamControl>>,
    output: Option<Arc<dyn AudioOutput>>,
    camera: Option<Box<dyn StreamControl>>,
}

impl Teardown {
    /// Producers are silenced before the remote session is touched so no
    /// frame is emitted into a closing channel; device handles go last.
    async fn release(&mut self) {
        if let Some(task) = self.sampler.take() {
            task.abort();
        }
        if let Some(task) = self.capture.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
        if let Some(remote) = self.remote.take() {
            remote.lock().await.close().await;
        }
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
        if let Some(output) = self.output.take() {
            output.close();
        }
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
    }
}

struct Supervisor {
    devices: Arc<dyn Devices>,
    connector: Arc<dyn RemoteConnector>,
    config: EngineConfig,
    status_tx: watch::Sender<SessionStatus>,
    level_tx: Option<watch::Sender<f32>>,
    transcript: Arc<TranscriptFeed>,
    muted: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    state: SessionState,
}

impl Supervisor {
    async fn run(mut self) {
        self.apply(StateEvent::StartRequested);

        let mut guard = Teardown::default();
        let fatal = match self.connect_phase(&mut guard).await {
            Ok(Some(wired)) => self.open_phase(wired, &mut guard).await,
            Ok(None) => None, // stopped before the session opened
            Err(e) => Some(e),
        };

        self.state = self.state.next(StateEvent::CloseRequested);
        guard.release().await;

        match fatal {
            Some(e) => {
                error!("session failed: {}", e);
                self.state = self.state.next(StateEvent::Fatal);
                let _ = self.status_tx.send(SessionStatus::Error(e.to_string()));
            }
            None => {
                self.state = self.state.next(StateEvent::TeardownComplete);
                let _ = self.status_tx.send(SessionStatus::Closed);
                info!("session closed");
            }
        }
    }

    fn apply(&mut self, event: StateEvent) {
        self.state = self.state.next(event);
        let status = match self.state {
            SessionState::Connecting => Some(SessionStatus::Connecting),
            SessionState::Open { speaking, .. } => Some(if speaking {
                SessionStatus::Speaking
            } else {
                SessionStatus::Listening
            }),
            _ => None,
        };
        if let Some(status) = status {
            let _ = self.status_tx.send(status);
        }
    }

    /// Open device handles and the remote session. Every await is
    /// cancellable by `stop()`; `Ok(None)` means the caller stopped us and
    /// whatever was opened so far is in the guard, ready for release.
    async fn connect_phase(&mut self, guard: &mut Teardown) -> Result<Option<Wired>, SessionError> {
        let mic = self
            .devices
            .open_mic(self.config.capture_rate, self.config.frame_samples)
            .map_err(|e| match e {
                DeviceError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
                other => SessionError::Device(other),
            })?;
        let mic_frames = mic.frames;
        guard.mic = Some(mic.control);

        // Only the microphone is required: a refused camera degrades the
        // session to audio-only instead of failing it.
        let camera = if self.config.video {
            match self.devices.open_camera() {
                Ok(camera) => {
                    guard.camera = Some(camera.control);
                    Some(camera.frames)
                }
                Err(e) => {
                    warn!("video source unavailable, continuing audio-only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let output = self
            .devices
            .open_output(self.config.playback_rate)
            .map_err(SessionError::Device)?;
        guard.output = Some(output.clone());

        let session = tokio::select! {
            result = self.connector.connect(&self.config.session) => result?,
            _ = self.command_rx.recv() => {
                info!("stop requested while connecting");
                return Ok(None);
            }
        };
        let RemoteSession { sink, mut events } = session;
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        guard.remote = Some(sink.clone());

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ServerEvent::Opened) => break,
                    Some(ServerEvent::Error(msg)) => {
                        return Err(SessionError::RemoteSession(msg));
                    }
                    Some(ServerEvent::Closed) | None => {
                        return Err(SessionError::RemoteConnect(
                            "session closed before opening".into(),
                        ));
                    }
                    Some(other) => debug!("ignoring pre-open message: {:?}", other),
                },
                _ = self.command_rx.recv() => {
                    info!("stop requested before the session opened");
                    return Ok(None);
                }
            }
        }

        Ok(Some(Wired {
            mic_frames,
            camera,
            output,
            sink,
            events,
        }))
    }

    /// Wire the producers and run the session until it ends. Returns the
    /// fatal error, if any; `None` is a clean close (local stop or remote
    /// `closed`).
    async fn open_phase(&mut self, wired: Wired, guard: &mut Teardown) -> Option<SessionError> {
        self.apply(StateEvent::RemoteOpened);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();

        guard.writer = Some(spawn_writer(outbound_rx, wired.sink.clone(), engine_tx.clone()));

        let level_tx = self
            .level_tx
            .take()
            .unwrap_or_else(|| watch::channel(0.0).0);
        guard.capture = Some(capture::spawn_capture(
            wired.mic_frames,
            self.config.capture_rate,
            outbound_tx.clone(),
            level_tx,
            self.muted.clone(),
            engine_tx,
        ));

        if let Some(grabber) = wired.camera {
            guard.sampler = Some(sampler::spawn_sampler(
                grabber,
                self.config.image_period,
                self.video_enabled.clone(),
                outbound_tx,
            ));
        }

        let scheduler = PlaybackScheduler::new(wired.output.clone());
        let mut speaking_rx = scheduler.speaking();
        let mut events = wired.events;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ServerEvent::Audio { data, sample_rate }) => {
                        match codec::decode_audio(&data, sample_rate) {
                            Ok(pcm) => scheduler.enqueue(codec::to_playable(&pcm)),
                            // Malformed frames are dropped silently; the
                            // surrounding buffers still play back-to-back.
                            Err(e) => debug!("dropping malformed audio chunk: {}", e),
                        }
                    }
                    Some(ServerEvent::Transcript { speaker, text }) => {
                        self.transcript.push(speaker, &text);
                    }
                    Some(ServerEvent::Interrupted) => {
                        info!("barge-in: flushing queued agent speech");
                        scheduler.flush();
                    }
                    Some(ServerEvent::Opened) => {}
                    Some(ServerEvent::Closed) | None => {
                        info!("remote session closed");
                        return None;
                    }
                    Some(ServerEvent::Error(msg)) => {
                        return Some(SessionError::RemoteSession(msg));
                    }
                },
                Some(event) = engine_rx.recv() => match event {
                    EngineEvent::DeviceLost(msg) => {
                        return Some(SessionError::DeviceLost(msg));
                    }
                    EngineEvent::RemoteSendFailed(msg) => {
                        return Some(SessionError::RemoteSession(msg));
                    }
                },
                result = speaking_rx.changed() => {
                    if result.is_ok() {
                        let speaking = *speaking_rx.borrow_and_update();
                        self.apply(StateEvent::SpeakingChanged(speaking));
                    }
                }
                _ = self.command_rx.recv() => {
                    info!("stop requested");
                    return None;
                }
            }
        }
    }
}

/// Drains the ordered outbound sink into the remote session. One writer per
/// session keeps frames in strict capture order.
fn spawn_writer(
    mut outbound_rx: mpsc::UnboundedReceiver<TransportFrame>,
    sink: SharedSink,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = sink.lock().await.send_frame(&frame).await;
            if let Err(e) = result {
                error!("outbound frame send failed: {}", e);
                let _ = events.send(EngineEvent::RemoteSendFailed(e.to_string()));
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameKind, Pcm16Buffer};
    use crate::device::testing::{CountingControl, MockOutput, SolidGrabber};
    use crate::device::{CameraDevice, MicDevice};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout};

    struct MockDevices {
        mic_ok: bool,
        camera_ok: bool,
        mic: StdMutex<Option<mpsc::Receiver<Vec<f32>>>>,
        output: Arc<MockOutput>,
        mic_stops: Arc<AtomicUsize>,
        camera_stops: Arc<AtomicUsize>,
        grabs: Arc<AtomicUsize>,
    }

    impl Devices for MockDevices {
        fn open_mic(&self, _rate: u32, _frame: usize) -> Result<MicDevice, DeviceError> {
            if !self.mic_ok {
                return Err(DeviceError::PermissionDenied("microphone refused".into()));
            }
            let frames = self
                .mic
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| DeviceError::Backend("microphone already open".into()))?;
            Ok(MicDevice {
                control: Box::new(CountingControl(self.mic_stops.clone())),
                frames,
            })
        }

        fn open_camera(&self) -> Result<CameraDevice, DeviceError> {
            if !self.camera_ok {
                return Err(DeviceError::PermissionDenied("camera refused".into()));
            }
            Ok(CameraDevice {
                control: Box::new(CountingControl(self.camera_stops.clone())),
                frames: Box::new(SolidGrabber {
                    grabs: self.grabs.clone(),
                }),
            })
        }

        fn open_output(&self, _rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError> {
            Ok(self.output.clone())
        }
    }

    struct MockConnector {
        session: StdMutex<Option<RemoteSession>>,
    }

    #[async_trait]
    impl RemoteConnector for MockConnector {
        async fn connect(&self, _config: &SessionConfig) -> Result<RemoteSession, SessionError> {
            self.session
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SessionError::RemoteConnect("no session available".into()))
        }
    }

    struct MockSink {
        sent: Arc<StdMutex<Vec<TransportFrame>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteSink for MockSink {
        async fn send_frame(&mut self, frame: &TransportFrame) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        engine: LiveEngine,
        mic_tx: mpsc::Sender<Vec<f32>>,
        server_tx: mpsc::Sender<ServerEvent>,
        sent: Arc<StdMutex<Vec<TransportFrame>>>,
        closes: Arc<AtomicUsize>,
        mic_stops: Arc<AtomicUsize>,
        camera_stops: Arc<AtomicUsize>,
        output: Arc<MockOutput>,
    }

    fn rig(mic_ok: bool, camera_ok: bool) -> Rig {
        let (mic_tx, mic_rx) = mpsc::channel(32);
        let (server_tx, server_rx) = mpsc::channel(32);
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let mic_stops = Arc::new(AtomicUsize::new(0));
        let camera_stops = Arc::new(AtomicUsize::new(0));
        let output = Arc::new(MockOutput::default());

        let devices = Arc::new(MockDevices {
            mic_ok,
            camera_ok,
            mic: StdMutex::new(Some(mic_rx)),
            output: output.clone(),
            mic_stops: mic_stops.clone(),
            camera_stops: camera_stops.clone(),
            grabs: Arc::new(AtomicUsize::new(0)),
        });
        let connector = Arc::new(MockConnector {
            session: StdMutex::new(Some(RemoteSession {
                sink: Box::new(MockSink {
                    sent: sent.clone(),
                    closes: closes.clone(),
                }),
                events: server_rx,
            })),
        });

        Rig {
            engine: LiveEngine::new(devices, connector),
            mic_tx,
            server_tx,
            sent,
            closes,
            mic_stops,
            camera_stops,
            output,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            image_period: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_status(handle: &SessionHandle, wanted: SessionStatus) {
        let mut status = handle.status_stream();
        timeout(Duration::from_secs(2), async {
            loop {
                let reached = *status.borrow() == wanted;
                if reached || status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("status not reached in time");
    }

    fn audio_chunk(ms: u64) -> ServerEvent {
        let pcm = Pcm16Buffer {
            samples: vec![100; (24 * ms) as usize],
            sample_rate: codec::PLAYBACK_SAMPLE_RATE,
            channels: 1,
        };
        ServerEvent::Audio {
            data: codec::encode_audio(&pcm).data,
            sample_rate: codec::PLAYBACK_SAMPLE_RATE,
        }
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        use StateEvent::*;

        assert_eq!(Idle.next(StartRequested), Connecting);
        assert_eq!(
            Connecting.next(RemoteOpened),
            Open {
                listening: true,
                speaking: false
            }
        );
        let open = Connecting.next(RemoteOpened);
        assert_eq!(
            open.next(SpeakingChanged(true)),
            Open {
                listening: true,
                speaking: true
            }
        );
        assert_eq!(open.next(CloseRequested), Closing);
        assert_eq!(Closing.next(TeardownComplete), Closed);
        assert_eq!(Connecting.next(Fatal), Error);
        // Terminal states absorb everything.
        assert_eq!(Closed.next(StartRequested), Closed);
        assert_eq!(Error.next(RemoteOpened), Error);
    }

    #[tokio::test]
    async fn camera_denial_still_reaches_open_audio_only() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();

        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.mic_tx.send(vec![0.2; 160]).await.unwrap();
        let sent = rig.sent.clone();
        eventually(move || {
            sent.lock()
                .unwrap()
                .iter()
                .any(|f| f.kind == FrameKind::Audio)
        })
        .await;

        // Several image periods pass; the sampler stays inert.
        sleep(Duration::from_millis(100)).await;
        assert!(rig
            .sent
            .lock()
            .unwrap()
            .iter()
            .all(|f| f.kind == FrameKind::Audio));
    }

    #[tokio::test]
    async fn video_frames_flow_when_the_camera_opens() {
        let mut rig = rig(true, true);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();

        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        let sent = rig.sent.clone();
        eventually(move || {
            sent.lock()
                .unwrap()
                .iter()
                .any(|f| f.kind == FrameKind::Image)
        })
        .await;
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_and_neighbors_stay_gapless() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.server_tx.send(audio_chunk(10)).await.unwrap();
        rig.server_tx
            .send(ServerEvent::Audio {
                data: "!!!truncated!!!".into(),
                sample_rate: codec::PLAYBACK_SAMPLE_RATE,
            })
            .await
            .unwrap();
        rig.server_tx.send(audio_chunk(10)).await.unwrap();

        let output = rig.output.clone();
        eventually(move || output.starts().len() == 2).await;

        let starts = rig.output.starts();
        // The two valid chunks play back-to-back as if the bad one were
        // never delivered.
        assert_eq!(starts[1].1, starts[0].1 + starts[0].2);
        assert!(matches!(handle.status(), SessionStatus::Listening | SessionStatus::Speaking));
    }

    #[tokio::test]
    async fn interruption_flushes_queued_speech() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.server_tx.send(audio_chunk(250)).await.unwrap();
        rig.server_tx.send(audio_chunk(250)).await.unwrap();
        let output = rig.output.clone();
        eventually(move || output.starts().len() == 2).await;

        rig.server_tx.send(ServerEvent::Interrupted).await.unwrap();
        let output = rig.output.clone();
        eventually(move || output.cancelled_ids().len() == 2).await;

        // A chunk enqueued after the flush starts immediately, not at the
        // stale schedule.
        rig.server_tx.send(audio_chunk(250)).await.unwrap();
        let output = rig.output.clone();
        eventually(move || output.starts().len() == 3).await;
        assert_eq!(rig.output.starts()[2].1, Duration::ZERO);
    }

    #[tokio::test]
    async fn speaking_status_tracks_playback() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.server_tx.send(audio_chunk(50)).await.unwrap();
        wait_status(handle, SessionStatus::Speaking).await;

        rig.output.finish_all();
        wait_status(handle, SessionStatus::Listening).await;
    }

    #[tokio::test]
    async fn transcript_window_fills_from_inbound_fragments() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.server_tx
            .send(ServerEvent::Transcript {
                speaker: crate::transcript::Speaker::User,
                text: "hello there".into(),
            })
            .await
            .unwrap();
        let transcript = handle.transcript.clone();
        eventually(move || !transcript.snapshot().is_empty()).await;
        assert_eq!(handle.transcript()[0].text, "hello there");
    }

    #[tokio::test]
    async fn stop_while_connecting_releases_everything() {
        let mut rig = rig(true, true);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();

        // `opened` never arrives.
        wait_status(handle, SessionStatus::Connecting).await;
        handle.stop().await;

        assert_eq!(handle.status(), SessionStatus::Closed);
        assert_eq!(rig.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(rig.camera_stops.load(Ordering::SeqCst), 1);
        assert_eq!(rig.closes.load(Ordering::SeqCst), 1);
        assert_eq!(rig.output.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_across_stop_calls() {
        let mut rig = rig(true, true);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        handle.stop().await;
        handle.stop().await;

        assert_eq!(rig.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(rig.camera_stops.load(Ordering::SeqCst), 1);
        assert_eq!(rig.closes.load(Ordering::SeqCst), 1);
        assert_eq!(rig.output.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_close_and_local_stop_release_once() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        rig.server_tx.send(ServerEvent::Closed).await.unwrap();
        wait_status(handle, SessionStatus::Closed).await;
        handle.stop().await;

        assert_eq!(rig.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(rig.closes.load(Ordering::SeqCst), 1);
        assert_eq!(rig.output.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        match rig.engine.start(config()) {
            Err(SessionError::SchedulingConflict) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second start must be rejected"),
        }

        // Once the session is terminal a fresh start is allowed again.
        rig.engine.stop().await;
        assert!(rig.engine.start(config()).is_ok());
    }

    #[tokio::test]
    async fn mic_refusal_fails_start_without_leaking() {
        let mut rig = rig(false, true);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();

        let mut status = handle.status_stream();
        timeout(Duration::from_secs(2), async {
            loop {
                if matches!(*status.borrow(), SessionStatus::Error(_))
                    || status.changed().await.is_err()
                {
                    break;
                }
            }
        })
        .await
        .unwrap();

        match handle.status() {
            SessionStatus::Error(msg) => assert!(msg.contains("permission denied")),
            other => panic!("expected error status, got {:?}", other),
        }
        // Nothing was opened, nothing to release.
        assert_eq!(rig.mic_stops.load(Ordering::SeqCst), 0);
        assert_eq!(rig.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn device_loss_tears_the_session_down() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        // Microphone stream ends unexpectedly.
        drop(rig.mic_tx);

        let mut status = handle.status_stream();
        timeout(Duration::from_secs(2), async {
            loop {
                if matches!(*status.borrow(), SessionStatus::Error(_))
                    || status.changed().await.is_err()
                {
                    break;
                }
            }
        })
        .await
        .unwrap();

        match handle.status() {
            SessionStatus::Error(msg) => assert!(msg.contains("capture device lost")),
            other => panic!("expected error status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn capture_order_is_preserved_end_to_end() {
        let mut rig = rig(true, false);
        rig.engine.start(config()).unwrap();
        let handle = rig.engine.session().unwrap();
        rig.server_tx.send(ServerEvent::Opened).await.unwrap();
        wait_status(handle, SessionStatus::Listening).await;

        for i in 0..4 {
            rig.mic_tx
                .send(vec![(i as f32 + 1.0) / 10.0; 160])
                .await
                .unwrap();
        }
        let sent = rig.sent.clone();
        eventually(move || sent.lock().unwrap().len() >= 4).await;

        let sent = rig.sent.lock().unwrap();
        for (i, frame) in sent.iter().take(4).enumerate() {
            let pcm = codec::decode_audio(&frame.data, codec::CAPTURE_SAMPLE_RATE).unwrap();
            let expected = (((i as f32 + 1.0) / 10.0) * 32767.0) as i16;
            assert_eq!(pcm.samples[0], expected);
        }
    }
}
