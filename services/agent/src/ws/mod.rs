//! WebSocket Session Management
//!
//! This module contains the core logic for running a lesson session over a
//! WebSocket. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-agent communication.
//! - `session`: Manages the connection lifecycle, from join to termination.
//! - `provider`: Handles connections to third-party real-time voice APIs (OpenAI, Gemini).

pub mod protocol;
mod provider;
pub mod session;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The client-facing half of the socket, shared between the session and its provider.
pub type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub use session::ws_handler;
