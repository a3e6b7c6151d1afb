//! Manages the WebSocket connection lifecycle for a lesson session.

use super::{
    SocketSink,
    protocol::{ClientMessage, ServerMessage},
    provider::{self, InputAudioOptions, ProviderHandle, RealtimeSessionConfig},
};
use crate::{
    state::AppState,
    telemetry::{SessionAttributes, SessionTrace},
};
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use mike_core::{
    schedule::{ScheduleReport, schedule},
    session::SessionHandle,
    strategy::ResolvedSession,
};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first message from the client must be a `join`. Everything after that
/// is the participant's audio until the client disconnects.
#[instrument(name = "agent_session", skip_all, fields(room, participant))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting join...");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    let join = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_join(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `join` message.")),
        Some(Err(_)) | None => {
            info!("Client disconnected before joining.");
            return;
        }
    };
    let (metadata, room) = match join {
        Ok(join) => join,
        Err(e) => {
            error!(error = ?e, "Session join failed");
            let _ = send_msg(
                &mut *socket_tx.lock().await,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let room = room.unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::Span::current().record("room", room.as_str());

    if let Err(e) = run_agent_session(state, socket_tx.clone(), socket_rx, room, metadata).await {
        error!(error = ?e, "Agent session terminated with error.");
        let _ = send_msg(
            &mut *socket_tx.lock().await,
            ServerMessage::Error {
                message: e.to_string(),
            },
        )
        .await;
    }
    info!("Agent session finished.");
}

/// Parses the `join` message into the participant metadata and room name.
fn parse_join(text: &str) -> Result<(Option<String>, Option<String>)> {
    let ClientMessage::Join { metadata, room } = serde_json::from_str(text)?;
    Ok((metadata, room))
}

/// Runs one lesson: resolve the participant, start the voice session, greet,
/// schedule the timing prompts and relay audio until the participant leaves.
async fn run_agent_session(
    state: Arc<AppState>,
    socket_tx: SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    room: String,
    metadata: Option<String>,
) -> Result<()> {
    let resolved = state.strategy.resolve(metadata.as_deref()).await;
    tracing::Span::current().record("participant", resolved.identity.name.as_str());
    info!(
        source = ?resolved.source,
        voice = %resolved.context.voice,
        lesson_duration_sec = resolved.context.lesson_duration_sec,
        "Participant resolved"
    );

    send_msg(
        &mut *socket_tx.lock().await,
        ServerMessage::Joined {
            room: room.clone(),
            participant: resolved.identity.name.clone(),
            voice: resolved.context.voice.clone(),
        },
    )
    .await?;

    let mut trace = start_trace(&state, &room, &resolved);

    let session_config = RealtimeSessionConfig {
        model: state.config.realtime_model.clone(),
        instructions: resolved.instruction(),
        voice: resolved.context.voice.clone(),
        temperature: state.config.temperature,
        input: InputAudioOptions {
            sample_rate: state.config.client_sample_rate,
            ..Default::default()
        },
    };
    let (handle, mut provider_task) =
        provider::start_realtime_provider(state.clone(), session_config, socket_tx.clone());

    let cancel = CancellationToken::new();
    let mut schedule_task = None;
    let result: Result<()> = async {
        let initial_message = Some(resolved.context.initial_message.clone())
            .filter(|message| !message.trim().is_empty());
        handle.generate_reply(initial_message).await?;

        schedule_task = Some(schedule(
            &resolved.context,
            Arc::new(handle.clone()),
            cancel.clone(),
        ));
        relay_audio(&handle, &mut socket_rx, &mut provider_task).await
    }
    .await;

    // Participant left: nothing scheduled may fire after this point.
    cancel.cancel();
    let report = match schedule_task {
        Some(task) => match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Timing prompt task failed");
                None
            }
        },
        None => None,
    };
    provider_task.abort();

    if let Some(trace) = trace.take() {
        finish_trace(&state, trace, report).await;
    }
    result
}

fn start_trace(state: &AppState, room: &str, resolved: &ResolvedSession) -> Option<SessionTrace> {
    let client = state.tracing.as_ref()?;
    let mut trace = client.start_session(SessionAttributes {
        session_id: room.to_string(),
        user_id: resolved.identity.trace_user_id().to_string(),
        user_email: resolved.identity.email.clone(),
    });
    trace.event(
        "lesson_started",
        vec![
            KeyValue::new("context.source", format!("{:?}", resolved.source)),
            KeyValue::new("voice", resolved.context.voice.clone()),
            KeyValue::new(
                "lesson.duration_sec",
                resolved.context.lesson_duration_sec as i64,
            ),
        ],
    );
    Some(trace)
}

async fn finish_trace(state: &AppState, mut trace: SessionTrace, report: Option<ScheduleReport>) {
    if let Some(report) = report {
        trace.event(
            "lesson_ended",
            vec![
                KeyValue::new("schedule.state", format!("{:?}", report.state)),
                KeyValue::new("prompt.pronunciation", format!("{:?}", report.pronunciation)),
                KeyValue::new("prompt.ending", format!("{:?}", report.ending)),
            ],
        );
    }
    trace.end();

    if let Some(client) = state.tracing.clone() {
        if let Err(e) = tokio::task::spawn_blocking(move || client.flush()).await {
            warn!(error = %e, "Trace flush task failed");
        }
    }
}

/// Forwards participant audio to the provider until either side goes away.
async fn relay_audio(
    handle: &ProviderHandle,
    socket_rx: &mut SplitStream<WebSocket>,
    provider_task: &mut JoinHandle<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            msg_result = socket_rx.next() => match msg_result {
                Some(Ok(Message::Binary(data))) => handle.send_audio(data).await?,
                Some(Ok(Message::Text(_))) => warn!("Ignoring unexpected text message after join."),
                Some(Ok(Message::Close(_))) | None => {
                    info!("Participant disconnected. Shutting down session.");
                    return Ok(());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => return Err(anyhow!("Error receiving from client WebSocket: {}", e)),
            },
            _ = &mut *provider_task => {
                warn!("Realtime provider stopped. Ending session.");
                return Ok(());
            }
        }
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
