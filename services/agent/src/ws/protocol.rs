//! Defines the WebSocket message protocol between the lesson client and the agent.
//!
//! Text frames carry the JSON messages below. Binary frames carry the
//! participant's microphone audio as little-endian PCM16 at the configured
//! client sample rate.

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the agent.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Joins the lesson. This must be the first message.
    Join {
        /// The participant's opaque metadata blob.
        #[serde(default)]
        metadata: Option<String>,
        /// The room the participant joined, used to group traces.
        #[serde(default)]
        room: Option<String>,
    },
}

/// Messages sent from the agent to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the lesson session is live.
    Joined {
        room: String,
        participant: String,
        voice: String,
    },
    /// Reports a fatal error to the client.
    Error { message: String },
    /// An update on the user's speech-to-text transcription.
    TranscriptionUpdate { text: String, is_final: bool },
    /// A chunk of audio data (base64 encoded PCM16) for the agent's voice.
    AudioChunk { data: String },
    /// Signals that the agent has started speaking.
    AiSpeakingStart,
    /// Signals that the agent has finished speaking.
    AiSpeakingEnd,
}
