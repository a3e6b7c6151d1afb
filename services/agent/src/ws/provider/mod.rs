//! Manages real-time, provider-specific WebSocket connections for voice I/O.

pub mod gemini;
pub mod openai;

use super::{SocketSink, protocol::ServerMessage, session::send_msg};
use crate::{audio_utils, config::Provider, state::AppState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use mike_core::session::SessionHandle;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::error;

/// An internal event passed to the active real-time provider task.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeClientEvent {
    /// A chunk of PCM16 audio from the participant.
    Audio(Bytes),
    /// Ask the model to speak next, optionally steered by instructions.
    GenerateReply(Option<String>),
}

/// Input-side audio processing for the participant's microphone stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputAudioOptions {
    pub sample_rate: f64,
    pub resampler_chunk_size: usize,
}

impl Default for InputAudioOptions {
    fn default() -> Self {
        Self {
            sample_rate: audio_utils::DEFAULT_CLIENT_SAMPLE_RATE,
            resampler_chunk_size: audio_utils::DEFAULT_RESAMPLER_CHUNK_SIZE,
        }
    }
}

/// Everything a provider needs to open a lesson session.
#[derive(Debug, Clone)]
pub struct RealtimeSessionConfig {
    pub model: String,
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
    pub input: InputAudioOptions,
}

/// The lesson logic's handle on a running provider task.
#[derive(Clone)]
pub struct ProviderHandle {
    tx: mpsc::Sender<RealtimeClientEvent>,
}

impl ProviderHandle {
    pub fn new(tx: mpsc::Sender<RealtimeClientEvent>) -> Self {
        Self { tx }
    }

    /// Forwards participant audio to the provider.
    pub async fn send_audio(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(RealtimeClientEvent::Audio(data))
            .await
            .context("Realtime provider is no longer running")
    }
}

#[async_trait]
impl SessionHandle for ProviderHandle {
    async fn generate_reply(&self, instructions: Option<String>) -> Result<()> {
        self.tx
            .send(RealtimeClientEvent::GenerateReply(instructions))
            .await
            .context("Realtime provider is no longer running")
    }
}

/// Starts a new task for the configured real-time provider (Gemini or OpenAI).
///
/// # Returns
/// A tuple containing:
/// 1. A `ProviderHandle` to drive the provider task.
/// 2. A `JoinHandle` for the spawned task.
pub fn start_realtime_provider(
    state: Arc<AppState>,
    session: RealtimeSessionConfig,
    socket_tx: SocketSink,
) -> (ProviderHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(128);
    let provider = state.config.provider.clone();

    let handle = tokio::spawn(async move {
        let result = match provider {
            Provider::Gemini => gemini::run(&state, &session, rx, socket_tx.clone()).await,
            Provider::OpenAI => openai::run(&state, &session, rx, socket_tx.clone()).await,
        };
        if let Err(e) = result {
            error!(?provider, error = ?e, "Realtime provider task failed");
            let mut sink = socket_tx.lock().await;
            let _ = send_msg(
                &mut sink,
                ServerMessage::Error {
                    message: format!("Voice connection failed: {}", e),
                },
            )
            .await;
        }
    });

    (ProviderHandle::new(tx), handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_forwards_replies() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ProviderHandle::new(tx);

        handle
            .generate_reply(Some("Say goodbye.".into()))
            .await
            .unwrap();
        handle.generate_reply(None).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(RealtimeClientEvent::GenerateReply(Some("Say goodbye.".into())))
        );
        assert_eq!(rx.recv().await, Some(RealtimeClientEvent::GenerateReply(None)));
    }

    #[tokio::test]
    async fn test_handle_fails_once_provider_stops() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = ProviderHandle::new(tx);

        assert!(handle.generate_reply(None).await.is_err());
        assert!(handle.send_audio(Bytes::from_static(&[0, 0])).await.is_err());
    }
}
