//! Lesson Context
//!
//! The lesson context is everything the realtime session needs to run a
//! lesson: the system instruction, the opening message, the voice, the lesson
//! length and the timing prompts. It is produced either by the external
//! context API or locally from the fallback template, and is read-only once
//! built.

use crate::{
    instruction::{FALLBACK_INSTRUCTION, fallback_instruction},
    metadata::{ParticipantIdentity, SessionParams},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, time::Duration};
use tracing::{info, warn};

pub const DEFAULT_LESSON_DURATION_SEC: u64 = 300;
pub const DEFAULT_PRONUNCIATION_AT_SEC: i64 = 60;
pub const DEFAULT_ENDING_AT_SEC: i64 = 10;

/// Upper bound for a single context API call.
pub const CONTEXT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub const MIKE_AVATAR: &str = "mike";
pub const JULIA_AVATAR: &str = "julia";
pub const MIKE_VOICE: &str = "Charon";
pub const JULIA_VOICE: &str = "Aoede";

/// Maps an avatar to the voice it speaks with. Unknown avatars speak as Mike.
pub fn voice_for_avatar(avatar: &str) -> &'static str {
    if avatar.trim().eq_ignore_ascii_case(JULIA_AVATAR) {
        JULIA_VOICE
    } else {
        MIKE_VOICE
    }
}

/// The two timed follow-ups a lesson can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    PronunciationWarning,
    EndingWarning,
}

impl PromptKind {
    /// Default offset, in seconds before the lesson ends, at which the prompt fires.
    pub fn default_at_sec_remaining(self) -> i64 {
        match self {
            PromptKind::PronunciationWarning => DEFAULT_PRONUNCIATION_AT_SEC,
            PromptKind::EndingWarning => DEFAULT_ENDING_AT_SEC,
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::PronunciationWarning => write!(f, "pronunciationWarning"),
            PromptKind::EndingWarning => write!(f, "endingWarning"),
        }
    }
}

/// Reads a whole-seconds field from any JSON number, truncating fractions.
/// Values that are not numbers read as absent so the rest of the context survives.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
    }))
}

/// Like `lenient_seconds`; negative durations read as zero.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_seconds(deserializer)?.map(|secs| u64::try_from(secs).unwrap_or(0)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingPrompt {
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub at_sec_remaining: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingPrompts {
    #[serde(default)]
    pub pronunciation_warning: Option<TimingPrompt>,
    #[serde(default)]
    pub ending_warning: Option<TimingPrompt>,
}

impl TimingPrompts {
    pub fn get(&self, kind: PromptKind) -> Option<&TimingPrompt> {
        match kind {
            PromptKind::PronunciationWarning => self.pronunciation_warning.as_ref(),
            PromptKind::EndingWarning => self.ending_warning.as_ref(),
        }
    }

    /// Seconds before the end of the lesson at which `kind` fires.
    pub fn at_sec_remaining(&self, kind: PromptKind) -> i64 {
        self.get(kind)
            .and_then(|p| p.at_sec_remaining)
            .unwrap_or_else(|| kind.default_at_sec_remaining())
    }

    /// The configured message for `kind`, if it is non-empty.
    pub fn message(&self, kind: PromptKind) -> Option<&str> {
        self.get(kind)
            .and_then(|p| p.message.as_deref())
            .filter(|m| !m.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonContext {
    pub system_instruction: String,
    pub initial_message: String,
    pub voice: String,
    pub lesson_duration_sec: u64,
    pub timing_prompts: TimingPrompts,
    pub teacher_name: Option<String>,
}

impl LessonContext {
    /// The context used when no lesson context is available for the session.
    pub fn fallback(identity: &ParticipantIdentity, avatar: &str) -> Self {
        Self {
            system_instruction: fallback_instruction(&identity.name),
            initial_message: String::new(),
            voice: voice_for_avatar(avatar).to_string(),
            lesson_duration_sec: DEFAULT_LESSON_DURATION_SEC,
            timing_prompts: TimingPrompts::default(),
            teacher_name: None,
        }
    }
}

/// The lesson context as it travels on the wire. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub timing_prompts: Option<TimingPrompts>,
    #[serde(default, deserialize_with = "lenient_duration")]
    pub lesson_duration_sec: Option<u64>,
    #[serde(default)]
    pub teacher_name: Option<String>,
}

impl ContextPayload {
    /// Fills every missing field with its default.
    pub fn into_context(self, avatar: &str) -> LessonContext {
        LessonContext {
            system_instruction: self
                .system_instruction
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_INSTRUCTION.to_string()),
            initial_message: self.initial_message.unwrap_or_default(),
            voice: self
                .voice
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| voice_for_avatar(avatar).to_string()),
            lesson_duration_sec: self
                .lesson_duration_sec
                .unwrap_or(DEFAULT_LESSON_DURATION_SEC),
            timing_prompts: self.timing_prompts.unwrap_or_default(),
            teacher_name: self.teacher_name.filter(|t| !t.trim().is_empty()),
        }
    }
}

/// Why the context API could not provide a lesson context.
#[derive(Debug, thiserror::Error)]
pub enum ContextFetchError {
    #[error("context API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("context API answered with status {0}")]
    Status(StatusCode),
    #[error("context API returned an unreadable body: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Defines the contract for any source of lesson contexts.
#[async_trait]
pub trait ContextFetcher: Send + Sync {
    /// Fetches the lesson context for `params`.
    ///
    /// Returns `None` when the context is unavailable for any reason; the
    /// caller is expected to fall back to the local template.
    async fn fetch(&self, params: &SessionParams) -> Option<LessonContext>;
}

/// A `ContextFetcher` backed by the external context-generation API.
pub struct HttpContextFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContextFetcher {
    /// Creates a fetcher for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ContextFetchError> {
        let client = reqwest::Client::builder()
            .timeout(CONTEXT_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/agent-context", self.base_url.trim_end_matches('/'))
    }

    async fn try_fetch(&self, params: &SessionParams) -> Result<LessonContext, ContextFetchError> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&params.query_pairs())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ContextFetchError::Status(status));
        }

        let body = response.text().await?;
        let payload: ContextPayload = serde_json::from_str(&body)?;
        Ok(payload.into_context(params.avatar()))
    }
}

#[async_trait]
impl ContextFetcher for HttpContextFetcher {
    async fn fetch(&self, params: &SessionParams) -> Option<LessonContext> {
        match self.try_fetch(params).await {
            Ok(context) => {
                info!(
                    voice = %context.voice,
                    instruction_chars = context.system_instruction.len(),
                    lesson_duration_sec = context.lesson_duration_sec,
                    teacher = ?context.teacher_name,
                    "Lesson context fetched"
                );
                Some(context)
            }
            Err(e) => {
                warn!(error = %e, url = %self.endpoint(), "Context API unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> SessionParams {
        SessionParams {
            topic: Some("travel".into()),
            avatar: Some("julia".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_voice_for_avatar() {
        assert_eq!(voice_for_avatar("mike"), "Charon");
        assert_eq!(voice_for_avatar("Julia"), "Aoede");
        assert_eq!(voice_for_avatar("someone-else"), "Charon");
        assert_eq!(voice_for_avatar(""), "Charon");
    }

    #[test]
    fn test_timing_prompt_defaults() {
        let prompts = TimingPrompts::default();
        assert_eq!(prompts.at_sec_remaining(PromptKind::PronunciationWarning), 60);
        assert_eq!(prompts.at_sec_remaining(PromptKind::EndingWarning), 10);
        assert_eq!(prompts.message(PromptKind::EndingWarning), None);
    }

    #[test]
    fn test_fallback_context() {
        let identity = ParticipantIdentity {
            name: "Gabi".into(),
            ..Default::default()
        };
        let context = LessonContext::fallback(&identity, "julia");
        assert_eq!(context.lesson_duration_sec, 300);
        assert_eq!(context.voice, "Aoede");
        assert!(context.system_instruction.contains("Gabi"));
        assert_eq!(context.timing_prompts, TimingPrompts::default());
    }

    #[tokio::test]
    async fn test_fetch_parses_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agent-context"))
            .and(query_param("topic", "travel"))
            .and(query_param("avatar", "julia"))
            .and(query_param("level", "beginner"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "systemInstruction": "You are {teacherName}, teaching {userName}.",
                "initialMessage": "Greet the student.",
                "timingPrompts": {
                    "pronunciationWarning": { "atSecRemaining": 90, "message": "Focus on pronunciation." }
                },
                "lessonDurationSec": 600,
                "teacherName": "Julia"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpContextFetcher::new(server.uri()).unwrap();
        let context = fetcher.fetch(&params()).await.expect("context");

        assert_eq!(context.initial_message, "Greet the student.");
        assert_eq!(context.voice, "Aoede");
        assert_eq!(context.lesson_duration_sec, 600);
        assert_eq!(context.teacher_name.as_deref(), Some("Julia"));
        assert_eq!(
            context.timing_prompts.at_sec_remaining(PromptKind::PronunciationWarning),
            90
        );
        assert_eq!(
            context.timing_prompts.at_sec_remaining(PromptKind::EndingWarning),
            10
        );
    }

    #[tokio::test]
    async fn test_fetch_applies_defaults_to_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agent-context"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let fetcher = HttpContextFetcher::new(format!("{}/", server.uri())).unwrap();
        let context = fetcher
            .fetch(&SessionParams::default())
            .await
            .expect("context");

        assert_eq!(context.system_instruction, FALLBACK_INSTRUCTION);
        assert_eq!(context.voice, "Charon");
        assert_eq!(context.lesson_duration_sec, 300);
        assert_eq!(context.teacher_name, None);
    }

    #[test]
    fn test_payload_accepts_any_number_for_seconds() {
        let payload: ContextPayload = serde_json::from_value(json!({
            "lessonDurationSec": 450.0,
            "timingPrompts": {
                "pronunciationWarning": { "atSecRemaining": 90.7, "message": "Pronounce." },
                "endingWarning": { "atSecRemaining": "soon", "message": "Bye." }
            },
            "voice": "Puck"
        }))
        .unwrap();
        let context = payload.into_context(MIKE_AVATAR);

        assert_eq!(context.lesson_duration_sec, 450);
        assert_eq!(context.voice, "Puck");
        assert_eq!(
            context.timing_prompts.at_sec_remaining(PromptKind::PronunciationWarning),
            90
        );
        assert_eq!(
            context.timing_prompts.at_sec_remaining(PromptKind::EndingWarning),
            10
        );

        let payload: ContextPayload =
            serde_json::from_value(json!({ "lessonDurationSec": -5, "timingPrompts": null }))
                .unwrap();
        assert_eq!(payload.lesson_duration_sec, Some(0));
    }

    #[tokio::test]
    async fn test_fetch_server_error_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = HttpContextFetcher::new(server.uri()).unwrap();
        assert!(fetcher.fetch(&params()).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_invalid_body_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpContextFetcher::new(server.uri()).unwrap();
        assert!(fetcher.fetch(&params()).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unreachable_yields_none() {
        let fetcher = HttpContextFetcher::new("http://127.0.0.1:9").unwrap();
        assert!(fetcher.fetch(&params()).await.is_none());
    }
}
