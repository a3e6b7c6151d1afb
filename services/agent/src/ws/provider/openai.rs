//! Handles the real-time WebSocket connection to OpenAI for voice interaction.

use super::{RealtimeClientEvent, RealtimeSessionConfig};
use crate::{
    audio_utils::{self, StreamResampler},
    state::AppState,
    ws::{SocketSink, protocol::ServerMessage, session::send_msg},
};
use anyhow::{Context, Result};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{error, info, warn};

const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Maps a configured voice name onto an OpenAI voice, falling back to Alloy
/// for names OpenAI does not know (such as Gemini voices).
fn realtime_voice(name: &str) -> oai_realtime::RealtimeVoice {
    serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
        .unwrap_or(oai_realtime::RealtimeVoice::Alloy)
}

fn session_update(session: &RealtimeSessionConfig) -> OAIClientEvent {
    let session_config = oai_realtime::SessionResource {
        model: Some(session.model.clone()),
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: Some(session.instructions.clone()),
        voice: Some(realtime_voice(&session.voice)),
        temperature: Some(session.temperature),
        input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        output_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        input_audio_transcription: Some(oai_realtime::AudioTranscription {
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }),
        turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
            threshold: 0.5,
            prefix_padding_ms: 200,
            silence_duration_ms: 700,
            interrupt_response: Some(true),
            create_response: Some(true),
        }),
        ..Default::default()
    };
    OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
        session: session_config,
        event_id: None,
    })
}

/// A steering instruction is added as a system item before the response is requested.
fn reply_events(instructions: Option<String>) -> Vec<OAIClientEvent> {
    let mut events = Vec::with_capacity(2);
    if let Some(text) = instructions {
        let item = oai_realtime::Item {
            r#type: Some(oai_realtime::ItemType::Message),
            role: Some(oai_realtime::ItemRole::System),
            content: Some(vec![oai_realtime::ItemContent {
                r#type: oai_realtime::ItemContentType::InputText,
                text: Some(text),
                audio: None,
                transcript: None,
            }]),
            id: None,
            status: None,
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        };
        events.push(OAIClientEvent::ConversationItemCreate(
            oai_realtime::ConversationItemCreateEvent {
                item,
                event_id: None,
                previous_item_id: None,
            },
        ));
    }
    events.push(OAIClientEvent::ResponseCreate(
        oai_realtime::ResponseCreateEvent {
            response: None,
            event_id: None,
        },
    ));
    events
}

/// Runs the main loop for the OpenAI Realtime API connection.
///
/// This function connects to the OpenAI WebSocket, handles session setup,
/// and then enters a loop to proxy messages between our client and OpenAI.
pub async fn run(
    state: &AppState,
    session: &RealtimeSessionConfig,
    mut rx: mpsc::Receiver<RealtimeClientEvent>,
    socket_tx: SocketSink,
) -> Result<()> {
    let api_key = state
        .config
        .openai_api_key
        .as_ref()
        .context("OpenAI API key not found")?;

    let url = format!("{}?model={}", OPENAI_REALTIME_URL, session.model);
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", api_key).parse()?);
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to OpenAI Realtime WebSocket")?;
    let (mut openai_tx, mut openai_rx) = ws_stream.split();
    info!(model = %session.model, "Connected to OpenAI Realtime API.");

    let mut input_resampler = StreamResampler::new(
        session.input.sample_rate,
        audio_utils::OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        session.input.resampler_chunk_size,
    )?;
    let mut output_resampler = StreamResampler::new(
        audio_utils::OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        session.input.sample_rate,
        session.input.resampler_chunk_size,
    )?;

    openai_tx
        .send(WsMessage::Text(
            serde_json::to_string(&session_update(session))?.into(),
        ))
        .await?;

    let mut speaking = false;

    // Main event loop for the OpenAI connection.
    loop {
        tokio::select! {
            biased;
            // Handle events from the session (audio to send, replies to request).
            event = rx.recv() => {
                let Some(event) = event else {
                    info!("Session closed the provider channel.");
                    break;
                };
                match event {
                    RealtimeClientEvent::Audio(data) => {
                        let samples = audio_utils::pcm16_le_to_f32(&data);
                        let resampled = input_resampler.push(&samples);
                        if resampled.is_empty() {
                            continue;
                        }
                        let append_event = oai_realtime::InputAudioBufferAppendEvent {
                            audio: audio_utils::encode_f32_to_base64_i16(&resampled),
                            event_id: None,
                        };
                        openai_tx.send(WsMessage::Text(serde_json::to_string(&OAIClientEvent::InputAudioBufferAppend(append_event))?.into())).await?;
                    }
                    RealtimeClientEvent::GenerateReply(instructions) => {
                        info!(steered = instructions.is_some(), "Requesting a reply from OpenAI.");
                        for event in reply_events(instructions) {
                            openai_tx.send(WsMessage::Text(serde_json::to_string(&event)?.into())).await?;
                        }
                    }
                }
            },
            // Handle events from the OpenAI server (e.g., audio to play).
            msg_result = openai_rx.next() => {
                let text = match msg_result {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        error!(?close_frame, "OpenAI WebSocket connection closed by server.");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("Error reading from OpenAI WebSocket"),
                    None => break,
                };
                let server_event = match serde_json::from_str::<OAIServerEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unrecognized event from OpenAI.");
                        continue;
                    }
                };

                let mut sink = socket_tx.lock().await;
                match server_event {
                    OAIServerEvent::ConversationItemInputAudioTranscriptionDelta(e) => send_msg(&mut sink, ServerMessage::TranscriptionUpdate { text: e.delta, is_final: false }).await?,
                    OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => send_msg(&mut sink, ServerMessage::TranscriptionUpdate { text: e.transcript, is_final: true }).await?,
                    OAIServerEvent::ResponseAudioDelta(e) => {
                        if !speaking {
                            speaking = true;
                            send_msg(&mut sink, ServerMessage::AiSpeakingStart).await?;
                        }
                        let resampled = output_resampler.push(&audio_utils::decode_f32_from_base64_i16(&e.delta));
                        if !resampled.is_empty() {
                            let data = audio_utils::encode_f32_to_base64_i16(&resampled);
                            send_msg(&mut sink, ServerMessage::AudioChunk { data }).await?;
                        }
                    }
                    OAIServerEvent::InputAudioBufferSpeechStarted(_) if speaking => {
                        speaking = false;
                        send_msg(&mut sink, ServerMessage::AiSpeakingEnd).await?;
                    }
                    OAIServerEvent::ResponseDone(e) => {
                        info!(usage = ?e.response.usage, "Realtime usage metrics");
                        if speaking {
                            speaking = false;
                            send_msg(&mut sink, ServerMessage::AiSpeakingEnd).await?;
                        }
                    }
                    OAIServerEvent::Error(e) => {
                        error!(message = %e.error.message, "OpenAI reported an error.");
                        send_msg(&mut sink, ServerMessage::Error { message: e.error.message }).await?;
                    }
                    _ => {}
                }
            },
        }
    }
    Ok(())
}
