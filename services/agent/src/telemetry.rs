//! Langfuse Tracing
//!
//! Sessions are traced to Langfuse through its OTLP/HTTP ingestion endpoint.
//! The client is constructed explicitly once per process and handed to each
//! session through the application state; nothing is written to the process
//! environment. Tracing is best effort: when it cannot be set up the agent
//! keeps running without it.

use base64::Engine;
use opentelemetry::{
    KeyValue,
    trace::{Span as _, TraceError, Tracer as _, TracerProvider as _},
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{self as sdktrace, TracerProvider},
};
use std::collections::HashMap;
use tracing::{info, warn};

const SERVICE_NAME: &str = "mike-agent";

/// Why tracing could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("LANGFUSE_PUBLIC_KEY, LANGFUSE_SECRET_KEY, and LANGFUSE_HOST must be set")]
    MissingCredentials,
    #[error("failed to build the span exporter: {0}")]
    Exporter(#[from] TraceError),
}

/// Connection settings for the Langfuse OTLP endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracingSettings {
    pub host: String,
    pub public_key: String,
    pub secret_key: String,
}

impl TracingSettings {
    /// Reads `LANGFUSE_HOST`, `LANGFUSE_PUBLIC_KEY` and `LANGFUSE_SECRET_KEY`.
    pub fn from_env() -> Result<Self, TracingSetupError> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        match (
            var("LANGFUSE_HOST"),
            var("LANGFUSE_PUBLIC_KEY"),
            var("LANGFUSE_SECRET_KEY"),
        ) {
            (Some(host), Some(public_key), Some(secret_key)) => Ok(Self {
                host,
                public_key,
                secret_key,
            }),
            _ => Err(TracingSetupError::MissingCredentials),
        }
    }

    /// The OTLP base endpoint; the exporter appends the traces path.
    pub fn endpoint(&self) -> String {
        format!("{}/api/public/otel", self.host.trim_end_matches('/'))
    }

    pub fn authorization(&self) -> String {
        let credentials = format!("{}:{}", self.public_key, self.secret_key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }
}

/// An explicitly owned tracer provider exporting to Langfuse.
pub struct TracingClient {
    provider: TracerProvider,
}

impl TracingClient {
    /// Builds the exporter pipeline. Must be called inside the Tokio runtime.
    pub fn new(settings: &TracingSettings) -> Result<Self, TracingSetupError> {
        let headers = HashMap::from([("Authorization".to_string(), settings.authorization())]);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(settings.endpoint())
            .with_headers(headers)
            .build_span_exporter()?;

        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", SERVICE_NAME),
            ])))
            .build();

        info!(endpoint = %settings.endpoint(), "Langfuse tracing initialized");
        Ok(Self { provider })
    }

    /// Opens the root span of one agent session.
    pub fn start_session(&self, attributes: SessionAttributes) -> SessionTrace {
        let tracer = self.provider.tracer(SERVICE_NAME);
        let mut span = tracer.start("agent_session");
        span.set_attributes(attributes.into_key_values());
        SessionTrace { span }
    }

    /// Pushes every buffered span to the exporter.
    ///
    /// Blocks until the exporter answers; call it from a blocking context.
    pub fn flush(&self) {
        for result in self.provider.force_flush() {
            if let Err(e) = result {
                warn!(error = %e, "Failed to flush traces");
            }
        }
    }
}

/// Attributes Langfuse uses to group a session's traces.
#[derive(Clone, Debug)]
pub struct SessionAttributes {
    pub session_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
}

impl SessionAttributes {
    fn into_key_values(self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("langfuse.session.id", self.session_id),
            KeyValue::new("langfuse.user.id", self.user_id),
            KeyValue::new("user.email", self.user_email.unwrap_or_default()),
        ]
    }
}

/// The open root span of a session.
pub struct SessionTrace {
    span: sdktrace::Span,
}

impl SessionTrace {
    /// Records a point-in-time event on the session span.
    pub fn event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.span.add_event(name, attributes);
    }

    pub fn end(mut self) {
        self.span.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TracingSettings {
        TracingSettings {
            host: "https://cloud.langfuse.com/".into(),
            public_key: "pk-lf".into(),
            secret_key: "sk-lf".into(),
        }
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        assert_eq!(
            settings().endpoint(),
            "https://cloud.langfuse.com/api/public/otel"
        );
    }

    #[test]
    fn test_authorization_header() {
        // base64("pk-lf:sk-lf")
        assert_eq!(settings().authorization(), "Basic cGstbGY6c2stbGY=");
    }

    #[test]
    fn test_session_attributes() {
        let attributes = SessionAttributes {
            session_id: "room-1".into(),
            user_id: "u-1".into(),
            user_email: None,
        }
        .into_key_values();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[0].key.as_str(), "langfuse.session.id");
        assert_eq!(attributes[2].value.as_str(), "");
    }
}
