//! Identity and Context Resolution Strategies
//!
//! Different front-ends hand the agent different metadata. A strategy turns
//! whatever a participant joined with into a resolved identity plus a lesson
//! context, and the session entrypoint is otherwise identical for all of them.

use crate::{
    context::{ContextFetcher, LessonContext},
    instruction::personalize,
    metadata::{self, ParticipantIdentity},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a session's lesson context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Remote,
    Embedded,
    Fallback,
}

/// The outcome of resolving a participant: who they are and what lesson to run.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub identity: ParticipantIdentity,
    pub context: LessonContext,
    pub source: ContextSource,
}

impl ResolvedSession {
    /// The system instruction handed to the realtime model.
    pub fn instruction(&self) -> String {
        personalize(
            &self.context.system_instruction,
            &self.identity,
            self.context.teacher_name.as_deref(),
        )
    }
}

/// Defines how a session's identity and lesson context are resolved.
#[async_trait]
pub trait ContextStrategy: Send + Sync {
    /// Resolves a participant from its raw metadata. Never fails.
    async fn resolve(&self, metadata: Option<&str>) -> ResolvedSession;
}

/// Metadata JSON with lesson parameters; the context comes from the context API.
pub struct RemoteContextStrategy {
    fetcher: Arc<dyn ContextFetcher>,
}

impl RemoteContextStrategy {
    pub fn new(fetcher: Arc<dyn ContextFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ContextStrategy for RemoteContextStrategy {
    async fn resolve(&self, metadata: Option<&str>) -> ResolvedSession {
        let (identity, params) = metadata::resolve(metadata);
        match self.fetcher.fetch(&params).await {
            Some(context) => {
                info!(voice = %context.voice, "Using lesson context from the context API");
                ResolvedSession {
                    identity,
                    context,
                    source: ContextSource::Remote,
                }
            }
            None => {
                warn!("No lesson context available, using fallback instruction");
                let context = LessonContext::fallback(&identity, params.avatar());
                ResolvedSession {
                    identity,
                    context,
                    source: ContextSource::Fallback,
                }
            }
        }
    }
}

/// Identity from a token only; the lesson always uses the local template.
pub struct TokenTemplateStrategy;

#[async_trait]
impl ContextStrategy for TokenTemplateStrategy {
    async fn resolve(&self, metadata: Option<&str>) -> ResolvedSession {
        let (identity, params) = metadata::resolve(metadata);
        let context = LessonContext::fallback(&identity, params.avatar());
        ResolvedSession {
            identity,
            context,
            source: ContextSource::Fallback,
        }
    }
}

/// Metadata that already carries the lesson context built by the front-end.
pub struct EmbeddedContextStrategy;

#[async_trait]
impl ContextStrategy for EmbeddedContextStrategy {
    async fn resolve(&self, metadata: Option<&str>) -> ResolvedSession {
        let (identity, context) = metadata::resolve_embedded(metadata);
        match context {
            Some(context) => {
                info!(
                    voice = %context.voice,
                    instruction_chars = context.system_instruction.len(),
                    "Using embedded lesson context"
                );
                ResolvedSession {
                    identity,
                    context,
                    source: ContextSource::Embedded,
                }
            }
            None => {
                warn!("No embedded lesson context, using fallback instruction");
                let context = LessonContext::fallback(&identity, crate::context::MIKE_AVATAR);
                ResolvedSession {
                    identity,
                    context,
                    source: ContextSource::Fallback,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::HttpContextFetcher, instruction::FALLBACK_INSTRUCTION};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata_for(name: &str, avatar: &str) -> String {
        let jwt = encode(
            &Header::default(),
            &json!({ "name": name, "sub": "42" }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        json!({ "avatar": avatar, "jwt": jwt }).to_string()
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let strategy =
            RemoteContextStrategy::new(Arc::new(HttpContextFetcher::new(server.uri()).unwrap()));

        let resolved = strategy
            .resolve(Some(&metadata_for("Joana", "julia")))
            .await;

        assert_eq!(resolved.source, ContextSource::Fallback);
        assert_eq!(resolved.identity.name, "Joana");
        assert_eq!(resolved.context.lesson_duration_sec, 300);
        assert_eq!(resolved.context.voice, "Aoede");
        assert!(resolved.context.system_instruction.contains("Joana"));
        assert!(resolved.context.system_instruction.contains(FALLBACK_INSTRUCTION));
    }

    #[tokio::test]
    async fn test_remote_success_uses_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "systemInstruction": "Hello {userName}, I am {teacherName}.",
                "voice": "Puck",
                "teacherName": "Mike"
            })))
            .mount(&server)
            .await;
        let strategy =
            RemoteContextStrategy::new(Arc::new(HttpContextFetcher::new(server.uri()).unwrap()));

        let resolved = strategy.resolve(Some(&metadata_for("Kleber", "mike"))).await;

        assert_eq!(resolved.source, ContextSource::Remote);
        assert_eq!(resolved.context.voice, "Puck");
        assert!(resolved.instruction().starts_with("Hello Kleber, I am Mike."));
    }

    #[tokio::test]
    async fn test_token_strategy_never_fetches() {
        let resolved = TokenTemplateStrategy
            .resolve(Some(&metadata_for("Lia", "mike")))
            .await;
        assert_eq!(resolved.source, ContextSource::Fallback);
        assert_eq!(resolved.identity.id.as_deref(), Some("42"));
        assert_eq!(resolved.context.voice, "Charon");

        let resolved = TokenTemplateStrategy.resolve(None).await;
        assert_eq!(resolved.identity.name, "aluno");
        assert!(resolved.instruction().contains("O NOME DO ALUNO É: aluno."));
    }

    #[tokio::test]
    async fn test_embedded_strategy() {
        let metadata = json!({
            "user": { "name": "Marta" },
            "agentContext": { "systemInstruction": "Roleplay a café with {userName}.", "initialMessage": "Start." }
        });
        let resolved = EmbeddedContextStrategy
            .resolve(Some(&metadata.to_string()))
            .await;
        assert_eq!(resolved.source, ContextSource::Embedded);
        assert_eq!(resolved.context.initial_message, "Start.");
        assert!(resolved.instruction().starts_with("Roleplay a café with Marta."));

        let resolved = EmbeddedContextStrategy.resolve(Some("{}")).await;
        assert_eq!(resolved.source, ContextSource::Fallback);
    }
}
