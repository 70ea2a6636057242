//! Client side of the fact store: HTTP adapters for the fact endpoints and the
//! prompt-execution collaborator, the frontend error reporter, and the
//! [`FactController`] view-model that ties them to UI actions.

mod backend;
mod busy;
mod controller;
mod events;
mod reporting;
mod session;

pub use backend::{FactBackend, HttpFactBackend};
pub use busy::{Action, BusyGuard, BusyRegistry};
pub use controller::{
    ActionOutcome, ClientState, ControllerSnapshot, FactController, FactEntry, View,
};
pub use events::{
    GenerationEvent, HttpPromptExecutor, PromptExecutor, FACT_PROMPT, IMAGE_PROMPT, STORY_PROMPT,
};
pub use reporting::{ErrorReport, ErrorReporter, LogReporter, WebhookReporter};
pub use session::{IdentityProvider, Session, StaticIdentity};

use fact_store_core::ErrorKind;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        kind: Option<ErrorKind>,
    },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error("diagnostic error: {0}")]
    Diagnostic(String),
}

impl ClientError {
    /// Taxonomy bucket used when logging a failed action.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status {
                kind: Some(kind), ..
            } => *kind,
            Self::Status { status: 400, .. } => ErrorKind::ValidationError,
            Self::Status { status: 401, .. } | Self::NotSignedIn => ErrorKind::AuthenticationError,
            Self::Status { status, .. } if *status >= 500 => ErrorKind::StorageError,
            Self::Status { .. } | Self::Network(_) | Self::Decode(_) | Self::Diagnostic(_) => {
                ErrorKind::NetworkError
            }
        }
    }
}
