//! Mike Agent Library Crate
//!
//! This library contains the voice agent service: configuration, Langfuse
//! tracing, the realtime provider bridges, the lesson session entrypoint and
//! routing. The `agent` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod ws;
