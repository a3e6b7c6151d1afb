use async_trait::async_trait;

/// The side of a live conversational session that the lesson logic can drive.
///
/// Implemented by the realtime provider bridges; the lesson logic only ever
/// issues one-way instructions through it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Asks the model to speak next, optionally steered by `instructions`.
    async fn generate_reply(&self, instructions: Option<String>) -> anyhow::Result<()>;
}
