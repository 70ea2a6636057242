use async_trait::async_trait;
use fact_store_core::{ErrorBody, Fact, IdempotencyKey, SaveFactRequest};

use crate::ClientError;

/// The two backend-for-frontend endpoints, as seen by the client.
#[async_trait]
pub trait FactBackend: Send + Sync {
    async fn list_facts(&self, token: &str) -> Result<Vec<Fact>, ClientError>;

    async fn save_fact(
        &self,
        token: &str,
        fact_text: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Fact, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpFactBackend {
    base_url: String,
    http: reqwest::Client,
}

impl HttpFactBackend {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn status_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let fallback = status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string();
    match response.json::<ErrorBody>().await {
        Ok(body) => ClientError::Status {
            status: status.as_u16(),
            message: body.error,
            kind: Some(body.kind),
        },
        Err(_) => ClientError::Status {
            status: status.as_u16(),
            message: fallback,
            kind: None,
        },
    }
}

#[async_trait]
impl FactBackend for HttpFactBackend {
    async fn list_facts(&self, token: &str) -> Result<Vec<Fact>, ClientError> {
        let response = self
            .http
            .get(self.url("/api/getFacts"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response
            .json::<Vec<Fact>>()
            .await
            .map_err(|err| ClientError::Decode(format!("invalid fact list: {err}")))
    }

    async fn save_fact(
        &self,
        token: &str,
        fact_text: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Fact, ClientError> {
        let response = self
            .http
            .post(self.url("/api/saveFact"))
            .bearer_auth(token)
            .header("idempotency-key", idempotency_key.as_str())
            .json(&SaveFactRequest::new(fact_text))
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response
            .json::<Fact>()
            .await
            .map_err(|err| ClientError::Decode(format!("invalid saved fact: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let backend = HttpFactBackend::new("http://localhost:4020/");
        assert_eq!(
            backend.url("/api/getFacts"),
            "http://localhost:4020/api/getFacts"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let backend = HttpFactBackend::new("http://127.0.0.1:1");
        let result = backend.list_facts("token").await;
        assert!(matches!(result, Err(ClientError::Network(_))));

        let result = backend
            .save_fact("token", "text", &IdempotencyKey::generate())
            .await;
        assert!(matches!(result, Err(ClientError::Network(_))));
    }
}
