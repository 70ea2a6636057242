use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ClientError;

pub const FACT_PROMPT: &str = "Provide me with an interesting fact about planet Earth.";
pub const IMAGE_PROMPT: &str = "A beautiful image of Earth from space.";
pub const STORY_PROMPT: &str = "Write a fascinating short story about Earth in markdown format.";

/// A request to the prompt-execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    ChatRequest { prompt: String },
    GenerateImage { prompt: String },
    TextToSpeech { text: String },
}

impl GenerationEvent {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatRequest { .. } => "chatgpt_request",
            Self::GenerateImage { .. } => "generate_image",
            Self::TextToSpeech { .. } => "text_to_speech",
        }
    }

    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::ChatRequest { prompt } => json!({
                "prompt": prompt,
                "response_type": "text",
            }),
            Self::GenerateImage { prompt } => json!({ "prompt": prompt }),
            Self::TextToSpeech { text } => json!({ "text": text }),
        }
    }
}

#[async_trait]
pub trait PromptExecutor: Send + Sync {
    /// Runs one event and returns its textual result (text, or a URL for media).
    async fn create_event(&self, token: &str, event: &GenerationEvent) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpPromptExecutor {
    events_url: String,
    app_id: Option<String>,
    http: reqwest::Client,
}

impl HttpPromptExecutor {
    #[must_use]
    pub fn new(events_url: impl Into<String>, app_id: Option<String>) -> Self {
        Self {
            events_url: events_url.into(),
            app_id,
            http: reqwest::Client::new(),
        }
    }

    fn body(&self, event: &GenerationEvent) -> Value {
        json!({
            "app_id": self.app_id,
            "event_type": event.event_type(),
            "data": event.data(),
        })
    }
}

/// Accepts either a bare JSON string or `{"result": "..."}`.
fn event_result(value: Value) -> Result<String, ClientError> {
    match value {
        Value::String(result) => Ok(result),
        Value::Object(mut map) => match map.remove("result") {
            Some(Value::String(result)) => Ok(result),
            _ => Err(ClientError::Decode(
                "event response has no string result".to_string(),
            )),
        },
        other => Err(ClientError::Decode(format!(
            "unexpected event response: {other}"
        ))),
    }
}

#[async_trait]
impl PromptExecutor for HttpPromptExecutor {
    async fn create_event(&self, token: &str, event: &GenerationEvent) -> Result<String, ClientError> {
        let response = self
            .http
            .post(&self.events_url)
            .bearer_auth(token)
            .json(&self.body(event))
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: format!("{} failed", event.event_type()),
                kind: None,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(format!("invalid event response: {err}")))?;
        event_result(value)
    }
}
