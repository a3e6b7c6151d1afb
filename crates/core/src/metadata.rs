//! Participant Metadata Resolution
//!
//! Every participant joins with an opaque metadata blob. Depending on which
//! front-end minted it, the blob is one of:
//!
//! - a JSON object carrying lesson parameters plus a nested `jwt`,
//! - a JSON object carrying `user` and a prebuilt `agentContext`,
//! - a bare identity token (legacy clients).
//!
//! Identity tokens are decoded **without** verifying their signature. The
//! participant was already authenticated by the transport when it joined the
//! room; the claims are only read here to personalize the lesson. Nothing in
//! this module grants access to anything.
//!
//! Resolution never fails: malformed input degrades to the default identity
//! and empty parameters, and the cause is logged.

use crate::context::{ContextPayload, LessonContext, MIKE_AVATAR};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Display name used whenever the participant cannot be identified.
pub const DEFAULT_USER_NAME: &str = "aluno";

/// A failure while reading participant metadata. Never surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("identity token does not have three segments")]
    MalformedToken,
    #[error("identity token payload is not base64url: {0}")]
    InvalidTokenEncoding(#[from] base64::DecodeError),
}

/// Who is on the other side of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    pub name: String,
    pub email: Option<String>,
    pub id: Option<String>,
}

impl Default for ParticipantIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_USER_NAME.to_string(),
            email: None,
            id: None,
        }
    }
}

impl ParticipantIdentity {
    /// The identifier traces are attributed to: the subject if known, else the name.
    pub fn trace_user_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// Lesson parameters carried in the metadata, exactly as the front-end sent them.
///
/// Missing fields stay `None`; defaults are applied when the parameters are
/// turned into context API query fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub topic: Option<String>,
    pub avatar: Option<String>,
    pub lang: Option<String>,
    pub roleplay: Option<String>,
    pub scenario_id: Option<String>,
    pub level: Option<String>,
    pub lesson: Option<String>,
}

impl SessionParams {
    fn from_fields(fields: &Map<String, Value>) -> Self {
        let field = |key: &str| fields.get(key).and_then(scalar_to_string);
        Self {
            topic: field("topic"),
            avatar: field("avatar"),
            lang: field("lang"),
            roleplay: field("roleplay"),
            scenario_id: field("scenarioId"),
            level: field("level"),
            lesson: field("lesson"),
        }
    }

    /// The avatar the lesson runs with, used to pick a default voice.
    pub fn avatar(&self) -> &str {
        self.avatar.as_deref().unwrap_or(MIKE_AVATAR)
    }

    /// Query fields for the context API, with per-field defaults applied.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let or = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        vec![
            ("topic", or(&self.topic, "conversation")),
            ("avatar", self.avatar().to_string()),
            ("lang", or(&self.lang, "pt")),
            ("roleplay", or(&self.roleplay, "false")),
            ("scenarioId", or(&self.scenario_id, "")),
            ("level", or(&self.level, "beginner")),
            ("lesson", or(&self.lesson, "1")),
        ]
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Standard identity claims read from a participant token.
#[derive(Debug, Default, Deserialize)]
struct IdentityClaims {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl From<IdentityClaims> for ParticipantIdentity {
    fn from(claims: IdentityClaims) -> Self {
        let name = [claims.name, claims.given_name, claims.preferred_username]
            .into_iter()
            .find_map(non_empty)
            .unwrap_or_else(|| DEFAULT_USER_NAME.to_string());
        Self {
            name,
            email: non_empty(claims.email),
            id: non_empty(claims.sub),
        }
    }
}

/// Reads the claims of `token` without checking its header, signature or expiry.
///
/// Only the payload segment is decoded, so tokens signed with any algorithm,
/// or not signed at all (`alg: none`), resolve the same way.
fn decode_unverified(token: &str) -> Result<IdentityClaims, MetadataError> {
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(MetadataError::MalformedToken);
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn identity_from_token(token: &str) -> ParticipantIdentity {
    match decode_unverified(token) {
        Ok(claims) => {
            let identity = ParticipantIdentity::from(claims);
            info!(name = %identity.name, id = ?identity.id, "Identity decoded from token");
            identity
        }
        Err(e) => {
            warn!(error = %e, "Could not decode identity token, using default identity");
            ParticipantIdentity::default()
        }
    }
}

fn identity_from_user(user: Option<&Value>) -> ParticipantIdentity {
    let Some(Value::Object(user)) = user else {
        return ParticipantIdentity::default();
    };
    let field = |key: &str| non_empty(user.get(key).and_then(scalar_to_string));
    ParticipantIdentity {
        name: field("name").unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
        email: field("email"),
        id: field("id"),
    }
}

fn parse_metadata(raw: Option<&str>) -> Option<Result<Value, MetadataError>> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    if raw.is_none() {
        warn!("No metadata found on participant");
    }
    raw.map(|raw| serde_json::from_str::<Value>(raw).map_err(MetadataError::from))
}

/// Resolves identity and lesson parameters from a participant's metadata.
pub fn resolve(raw: Option<&str>) -> (ParticipantIdentity, SessionParams) {
    let Some(parsed) = parse_metadata(raw) else {
        return (ParticipantIdentity::default(), SessionParams::default());
    };

    match parsed {
        Ok(Value::Object(fields)) => {
            let keys: Vec<&String> = fields.keys().collect();
            info!(?keys, "Parsed metadata");
            let params = SessionParams::from_fields(&fields);
            let identity = match fields.get("jwt").and_then(Value::as_str) {
                Some(token) => identity_from_token(token),
                None => ParticipantIdentity::default(),
            };
            (identity, params)
        }
        Ok(Value::String(token)) => (identity_from_token(&token), SessionParams::default()),
        Ok(_) => {
            warn!("Metadata JSON is not an object, using default identity");
            (ParticipantIdentity::default(), SessionParams::default())
        }
        Err(e) => {
            // Legacy clients send the bare token as metadata.
            info!(error = %e, "Metadata is not JSON, decoding it as a token");
            let token = raw.unwrap_or_default();
            (identity_from_token(token), SessionParams::default())
        }
    }
}

/// Resolves metadata of the `{"user": {...}, "agentContext": {...}}` shape.
///
/// The embedded context, when present and well-formed, is returned ready to
/// use; a malformed context is logged and treated as absent.
pub fn resolve_embedded(raw: Option<&str>) -> (ParticipantIdentity, Option<LessonContext>) {
    let fields = match parse_metadata(raw) {
        Some(Ok(Value::Object(fields))) => fields,
        Some(Ok(_)) => {
            warn!("Metadata JSON is not an object, using default identity");
            return (ParticipantIdentity::default(), None);
        }
        Some(Err(e)) => {
            warn!(error = %e, "Failed to parse metadata as JSON");
            return (ParticipantIdentity::default(), None);
        }
        None => return (ParticipantIdentity::default(), None),
    };

    let identity = identity_from_user(fields.get("user"));
    info!(name = %identity.name, email = ?identity.email, id = ?identity.id, "Resolved user");

    let context = match fields.get("agentContext") {
        Some(value) if value.is_object() => {
            match serde_json::from_value::<ContextPayload>(value.clone()) {
                Ok(payload) => Some(payload.into_context(MIKE_AVATAR)),
                Err(e) => {
                    warn!(error = %e, "agentContext is malformed, ignoring it");
                    None
                }
            }
        }
        _ => {
            warn!("No agentContext in metadata");
            None
        }
    };

    (identity, context)
}
