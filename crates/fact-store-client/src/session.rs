use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fact_store_core::Principal;
use serde::{Deserialize, Serialize};

use crate::ClientError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub principal: Principal,
}

/// The hosted identity provider, reduced to what the controller needs.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_session(&self) -> Result<Option<Session>, ClientError>;

    async fn sign_out(&self) -> Result<(), ClientError>;
}

/// A session obtained out of band, e.g. a token passed on the command line.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    session: Mutex<Option<Session>>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_session(&self) -> Result<Option<Session>, ClientError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn sign_out(&self) -> Result<(), ClientError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
