//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared
//! resources every lesson session needs: configuration, the context strategy
//! and the optional tracing client.

use crate::{config::Config, telemetry::TracingClient};
use mike_core::strategy::ContextStrategy;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub strategy: Arc<dyn ContextStrategy>,
    /// `None` when Langfuse is not configured or could not be reached at startup.
    pub tracing: Option<Arc<TracingClient>>,
}
