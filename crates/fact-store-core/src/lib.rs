//! Domain types shared by the fact store service and its clients.
//!
//! The wire shapes here are the contract between `POST /api/saveFact`,
//! `GET /api/getFacts` and anything that calls them.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const FACT_TEXT_REQUIRED: &str = "Fact text is required";
pub const AUTHENTICATION_FAILED: &str = "Authentication failed";
pub const SAVE_FAILED: &str = "Error saving fact";
pub const FETCH_FAILED: &str = "Error fetching facts";
pub const IDEMPOTENCY_KEY_CONFLICT: &str =
    "Idempotency key was already used for a different fact";

pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FactError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl FactError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::Storage(_) => ErrorKind::StorageError,
        }
    }
}

/// Error taxonomy exposed on the wire as the `kind` field of an error body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    ValidationError,
    AuthenticationError,
    StorageError,
    NetworkError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::AuthenticationError => "AuthenticationError",
            Self::StorageError => "StorageError",
            Self::NetworkError => "NetworkError",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ValidationError" => Some(Self::ValidationError),
            "AuthenticationError" => Some(Self::AuthenticationError),
            "StorageError" => Some(Self::StorageError),
            "NetworkError" => Some(Self::NetworkError),
            _ => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier of an authenticated principal, as issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Principal {
    pub id: PrincipalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: PrincipalId(id.into()),
            email: None,
        }
    }
}

/// A persisted fact row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Fact {
    pub id: i64,
    pub fact_text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub user_id: PrincipalId,
}

/// Client-supplied token used to collapse retried submissions into one row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Fresh request-scoped key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parses a key received from a caller.
    ///
    /// # Errors
    /// Returns [`FactError::Validation`] when the key is empty, too long, or
    /// contains characters outside printable ASCII.
    pub fn parse(raw: &str) -> Result<Self, FactError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FactError::Validation(
                "idempotency key MUST NOT be empty".to_string(),
            ));
        }
        if trimmed.len() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(FactError::Validation(format!(
                "idempotency key MUST be at most {IDEMPOTENCY_KEY_MAX_LEN} bytes"
            )));
        }
        if !trimmed.bytes().all(|byte| byte.is_ascii_graphic()) {
            return Err(FactError::Validation(
                "idempotency key MUST be printable ASCII".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write input after validation; ownership is always attached.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewFact {
    pub user_id: PrincipalId,
    pub fact_text: String,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewFact {
    /// Validates a write before it reaches storage.
    ///
    /// # Errors
    /// Returns [`FactError::Validation`] when the text is empty or the owner is blank.
    pub fn validate(&self) -> Result<(), FactError> {
        if self.fact_text.is_empty() {
            return Err(FactError::Validation(FACT_TEXT_REQUIRED.to_string()));
        }
        if self.user_id.0.trim().is_empty() {
            return Err(FactError::Validation(
                "user_id MUST be provided for every write".to_string(),
            ));
        }
        Ok(())
    }
}

/// Body of `POST /api/saveFact`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SaveFactRequest {
    #[serde(default)]
    pub fact_text: Option<String>,
}

impl SaveFactRequest {
    #[must_use]
    pub fn new(fact_text: impl Into<String>) -> Self {
        Self {
            fact_text: Some(fact_text.into()),
        }
    }

    /// Extracts the required text, treating absent and empty alike.
    ///
    /// # Errors
    /// Returns [`FactError::Validation`] with [`FACT_TEXT_REQUIRED`].
    pub fn into_fact_text(self) -> Result<String, FactError> {
        match self.fact_text {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(FactError::Validation(FACT_TEXT_REQUIRED.to_string())),
        }
    }
}

/// Body of every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`FactError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FactError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FactError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FactError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FactError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FactError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| FactError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn save_request_rejects_missing_and_empty_text() {
        let missing: SaveFactRequest = must_ok(serde_json::from_value(json!({})));
        assert_eq!(
            missing.into_fact_text(),
            Err(FactError::Validation(FACT_TEXT_REQUIRED.to_string()))
        );

        let null: SaveFactRequest = must_ok(serde_json::from_value(json!({"fact_text": null})));
        assert!(null.into_fact_text().is_err());

        let empty = SaveFactRequest::new("");
        assert!(empty.into_fact_text().is_err());
    }

    #[test]
    fn save_request_keeps_text_verbatim() {
        let request = SaveFactRequest::new("  Water covers 71% of Earth's surface.  ");
        assert_eq!(
            must_ok(request.into_fact_text()),
            "  Water covers 71% of Earth's surface.  "
        );
    }

    #[test]
    fn new_fact_requires_owner() {
        let fact = NewFact {
            user_id: PrincipalId(" ".to_string()),
            fact_text: "text".to_string(),
            idempotency_key: None,
        };
        assert!(matches!(fact.validate(), Err(FactError::Validation(_))));
    }

    #[test]
    fn idempotency_key_parse_enforces_shape() {
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("has space").is_err());
        assert!(IdempotencyKey::parse(&"k".repeat(IDEMPOTENCY_KEY_MAX_LEN + 1)).is_err());
        assert_eq!(must_ok(IdempotencyKey::parse(" abc-123 ")).as_str(), "abc-123");

        let generated = IdempotencyKey::generate();
        assert_eq!(
            must_ok(IdempotencyKey::parse(generated.as_str())),
            generated
        );
    }

    #[test]
    fn fact_serializes_with_snake_case_fields_and_rfc3339_timestamp() {
        let fact = Fact {
            id: 7,
            fact_text: "Earth is the third planet from the Sun.".to_string(),
            created_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
            user_id: PrincipalId::from("user-a"),
        };
        let value = must_ok(serde_json::to_value(&fact));
        assert_eq!(
            value,
            json!({
                "id": 7,
                "fact_text": "Earth is the third planet from the Sun.",
                "created_at": "2026-02-07T12:00:00Z",
                "user_id": "user-a"
            })
        );

        let back: Fact = must_ok(serde_json::from_value(value));
        assert_eq!(back, fact);
    }

    #[test]
    fn error_kind_maps_from_fact_error() {
        assert_eq!(
            FactError::Authentication("x".to_string()).kind().as_str(),
            "AuthenticationError"
        );
        assert_eq!(ErrorKind::parse("StorageError"), Some(ErrorKind::StorageError));
        assert_eq!(ErrorKind::parse("Other"), None);
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let formatted = must_ok(format_rfc3339(must_ok(parse_rfc3339_utc(
            "2026-02-07T12:00:00Z"
        ))));
        assert_eq!(formatted, "2026-02-07T12:00:00Z");
    }
}
