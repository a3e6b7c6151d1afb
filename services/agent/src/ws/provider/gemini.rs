//! Handles the real-time WebSocket connection to Google Gemini Live for voice interaction.

use super::{RealtimeClientEvent, RealtimeSessionConfig};
use crate::{
    audio_utils::{self, StreamResampler},
    state::AppState,
    ws::{SocketSink, protocol::ServerMessage, session::send_msg},
};
use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

// --- Local Gemini Live Types (for encapsulation) ---
mod gemini_realtime_types {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(BidiGenerateContentSetup),
        RealtimeInput(BidiGenerateContentRealtimeInput),
        ClientContent(BidiGenerateContentClientContent),
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentSetup {
        pub model: String,
        pub generation_config: GenerationConfig,
        pub system_instruction: Content,
        pub input_audio_transcription: AudioTranscriptionConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentClientContent {
        pub turns: Vec<Content>,
        pub turn_complete: bool,
    }
    #[derive(Serialize)]
    pub(super) struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        pub parts: Vec<Part>,
    }
    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<ResponseModality>,
        pub temperature: f32,
        pub speech_config: SpeechConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub(super) enum ResponseModality {
        Audio,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct SpeechConfig {
        pub voice_config: VoiceConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct VoiceConfig {
        pub prebuilt_voice_config: PrebuiltVoiceConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct PrebuiltVoiceConfig {
        pub voice_name: String,
    }
    #[derive(Serialize)]
    pub(super) struct AudioTranscriptionConfig {}
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentRealtimeInput {
        pub audio: Blob,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        pub setup_complete: Option<serde_json::Value>,
        pub server_content: Option<LiveServerContent>,
        pub usage_metadata: Option<UsageMetadata>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct LiveServerContent {
        pub model_turn: Option<ServerContentTurn>,
        pub input_transcription: Option<ServerTranscription>,
        pub turn_complete: Option<bool>,
        pub interrupted: Option<bool>,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct ServerContentTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        pub inline_data: Option<ServerBlob>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerBlob {
        pub data: String,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct ServerTranscription {
        pub text: String,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct UsageMetadata {
        pub prompt_token_count: Option<u64>,
        pub response_token_count: Option<u64>,
        pub total_token_count: Option<u64>,
    }
}

use gemini_realtime_types as types;

fn setup_message(session: &RealtimeSessionConfig) -> types::ClientMessage {
    let model = if session.model.starts_with("models/") {
        session.model.clone()
    } else {
        format!("models/{}", session.model)
    };
    types::ClientMessage::Setup(types::BidiGenerateContentSetup {
        model,
        generation_config: types::GenerationConfig {
            response_modalities: vec![types::ResponseModality::Audio],
            temperature: session.temperature,
            speech_config: types::SpeechConfig {
                voice_config: types::VoiceConfig {
                    prebuilt_voice_config: types::PrebuiltVoiceConfig {
                        voice_name: session.voice.clone(),
                    },
                },
            },
        },
        system_instruction: types::Content {
            role: None,
            parts: vec![types::Part {
                text: session.instructions.clone(),
            }],
        },
        input_audio_transcription: types::AudioTranscriptionConfig {},
    })
}

fn reply_message(instructions: Option<String>) -> types::ClientMessage {
    let turns = instructions
        .map(|text| {
            vec![types::Content {
                role: Some("user".to_string()),
                parts: vec![types::Part { text }],
            }]
        })
        .unwrap_or_default();
    types::ClientMessage::ClientContent(types::BidiGenerateContentClientContent {
        turns,
        turn_complete: true,
    })
}

async fn send_to_gemini<S>(gemini_tx: &mut S, msg: &types::ClientMessage) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    gemini_tx
        .send(WsMessage::Text(serde_json::to_string(msg)?.into()))
        .await?;
    Ok(())
}

async fn forward_event<S>(
    gemini_tx: &mut S,
    input_resampler: &mut StreamResampler,
    event: RealtimeClientEvent,
) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match event {
        RealtimeClientEvent::Audio(data) => {
            let samples = audio_utils::pcm16_le_to_f32(&data);
            let resampled = input_resampler.push(&samples);
            if resampled.is_empty() {
                return Ok(());
            }
            let audio_msg =
                types::ClientMessage::RealtimeInput(types::BidiGenerateContentRealtimeInput {
                    audio: types::Blob {
                        mime_type: "audio/pcm;rate=16000".to_string(),
                        data: audio_utils::encode_f32_to_base64_i16(&resampled),
                    },
                });
            send_to_gemini(gemini_tx, &audio_msg).await
        }
        RealtimeClientEvent::GenerateReply(instructions) => {
            info!(steered = instructions.is_some(), "Requesting a reply from Gemini.");
            send_to_gemini(gemini_tx, &reply_message(instructions)).await
        }
    }
}

/// Runs the main loop for the Gemini Live API connection.
///
/// Connects, sends the session setup (model, voice, system instruction), then
/// proxies audio in both directions, resampling between the client rate and
/// Gemini's rates. Reply requests issued before Gemini confirms the setup are
/// queued and sent once it does.
pub async fn run(
    state: &AppState,
    session: &RealtimeSessionConfig,
    mut rx: mpsc::Receiver<RealtimeClientEvent>,
    socket_tx: SocketSink,
) -> Result<()> {
    let api_key = state
        .config
        .gemini_api_key
        .as_ref()
        .context("Gemini API key not found")?;
    let url = format!("{}?key={}", GEMINI_LIVE_URL, api_key);

    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Gemini Live WebSocket")?;
    info!(model = %session.model, voice = %session.voice, "Connected to Gemini Live WebSocket.");
    let (mut gemini_tx, mut gemini_rx) = ws_stream.split();

    let mut input_resampler = StreamResampler::new(
        session.input.sample_rate,
        audio_utils::GEMINI_LIVE_API_PCM16_SAMPLE_RATE,
        session.input.resampler_chunk_size,
    )?;
    let mut output_resampler = StreamResampler::new(
        audio_utils::GEMINI_LIVE_API_OUTPUT_SAMPLE_RATE,
        session.input.sample_rate,
        session.input.resampler_chunk_size,
    )?;

    send_to_gemini(&mut gemini_tx, &setup_message(session)).await?;

    let mut is_ready = false;
    let mut speaking = false;
    let mut pending_replies = VecDeque::new();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    info!("Session closed the provider channel.");
                    break;
                };
                if is_ready {
                    forward_event(&mut gemini_tx, &mut input_resampler, event).await?;
                } else if matches!(event, RealtimeClientEvent::GenerateReply(_)) {
                    pending_replies.push_back(event);
                } else {
                    debug!("Dropping audio received before Gemini setup was complete.");
                }
            },
            msg_result = gemini_rx.next() => {
                let parsed = match msg_result {
                    Some(Ok(WsMessage::Text(text))) => serde_json::from_str::<types::ServerMessage>(&text),
                    Some(Ok(WsMessage::Binary(data))) => serde_json::from_slice::<types::ServerMessage>(&data),
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        error!(?close_frame, "Gemini WebSocket connection closed by server.");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("Error reading from Gemini WebSocket"),
                    None => break,
                };
                let gemini_msg = match parsed {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unrecognized message from Gemini.");
                        continue;
                    }
                };

                if gemini_msg.setup_complete.is_some() && !is_ready {
                    info!("Gemini session setup is complete. Ready for bidirectional streaming.");
                    is_ready = true;
                    while let Some(event) = pending_replies.pop_front() {
                        forward_event(&mut gemini_tx, &mut input_resampler, event).await?;
                    }
                }

                if let Some(usage) = gemini_msg.usage_metadata {
                    info!(
                        prompt_tokens = ?usage.prompt_token_count,
                        response_tokens = ?usage.response_token_count,
                        total_tokens = ?usage.total_token_count,
                        "Realtime usage metrics"
                    );
                }

                if let Some(content) = gemini_msg.server_content {
                    let mut sink = socket_tx.lock().await;
                    if let Some(transcription) = content.input_transcription {
                        send_msg(&mut sink, ServerMessage::TranscriptionUpdate { text: transcription.text, is_final: true }).await?;
                    }
                    if let Some(model_turn) = content.model_turn {
                        if !speaking {
                            speaking = true;
                            send_msg(&mut sink, ServerMessage::AiSpeakingStart).await?;
                        }
                        for blob in model_turn.parts.into_iter().filter_map(|part| part.inline_data) {
                            let pcm_f32 = audio_utils::decode_f32_from_base64_i16(&blob.data);
                            let resampled = output_resampler.push(&pcm_f32);
                            if !resampled.is_empty() {
                                let data = audio_utils::encode_f32_to_base64_i16(&resampled);
                                send_msg(&mut sink, ServerMessage::AudioChunk { data }).await?;
                            }
                        }
                    }
                    let turn_over = content.turn_complete == Some(true) || content.interrupted == Some(true);
                    if turn_over && speaking {
                        speaking = false;
                        send_msg(&mut sink, ServerMessage::AiSpeakingEnd).await?;
                    }
                }
            },
        }
    }
    Ok(())
}
