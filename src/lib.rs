//! voxlive: a live conversational session engine.
//!
//! Captures microphone audio (and optionally periodic screen stills), streams
//! them to a remote multimodal session over a websocket, and plays the
//! synthesized speech coming back with gapless scheduling, while keeping a
//! rolling transcript and a live status for the presentation layer.
//!
//! The entry point is [`LiveEngine`]: give it a device factory and a remote
//! connector, call [`LiveEngine::start`], and drive the returned
//! [`SessionHandle`].

#![forbid(unsafe_code)]

pub mod capture;
pub mod codec;
pub mod device;
pub mod error;
pub mod playback;
pub mod remote;
pub mod sampler;
pub mod session;
pub mod transcript;

pub use device::{Devices, SystemDevices};
pub use error::SessionError;
pub use remote::{ResponseModality, SessionConfig, WsConnector};
pub use session::{EngineConfig, LiveEngine, SessionHandle, SessionStatus};
pub use transcript::{Speaker, TranscriptEntry};
