//! voxlive demo binary.
//!
//! Opens a live session against the endpoint in `VOXLIVE_URL` using the real
//! system devices, prints status changes and transcript lines to the
//! terminal, and tears the session down on Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use voxlive::{
    EngineConfig, LiveEngine, ResponseModality, SessionConfig, SessionStatus, SystemDevices,
    WsConnector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxlive=info".into()),
        )
        .init();

    let url = std::env::var("VOXLIVE_URL").context("VOXLIVE_URL must point at a live endpoint")?;

    let mut session = SessionConfig::from_url(&url);
    session.persona = std::env::var("VOXLIVE_PERSONA").ok();
    session.voice = std::env::var("VOXLIVE_VOICE").ok();
    session.modality = ResponseModality::Audio;

    let config = EngineConfig {
        video: std::env::var("VOXLIVE_NO_VIDEO").is_err(),
        session,
        ..Default::default()
    };

    let mut engine = LiveEngine::new(
        Arc::new(SystemDevices::new("voxlive")),
        Arc::new(WsConnector),
    );
    let handle = engine.start(config)?;
    info!("session starting, Ctrl-C to stop");

    let mut status = handle.status_stream();
    let mut printed = 0usize;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow().clone();
                println!("[{:?}]", current);
                if matches!(current, SessionStatus::Closed | SessionStatus::Error(_)) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("stopping...");
                engine.stop().await;
                break;
            }
        }

        for entry in engine.session().map(|s| s.transcript()).unwrap_or_default() {
            if entry.sequence >= printed as u64 {
                println!("{:?}: {}", entry.speaker, entry.text);
                printed = entry.sequence as usize + 1;
            }
        }
    }

    Ok(())
}
