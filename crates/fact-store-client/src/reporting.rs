use std::time::Duration;

use async_trait::async_trait;
use fact_store_core::{format_rfc3339, now_utc, ErrorKind};
use serde::Serialize;
use serde_json::{json, Value};

/// A client action failure, as sent to error tracking.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub operation: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn capture(&self, report: &ErrorReport);
}

#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl ErrorReporter for LogReporter {
    async fn capture(&self, report: &ErrorReport) {
        tracing::error!(
            operation = report.operation,
            kind = report.kind.as_str(),
            "{}",
            report.message
        );
    }
}

/// Posts reports tagged `type: frontend` to an error-tracking endpoint.
/// Delivery failures are logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    url: String,
    project_id: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl WebhookReporter {
    #[must_use]
    pub fn new(url: impl Into<String>, project_id: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            project_id,
            timeout,
            http: reqwest::Client::new(),
        }
    }

    fn payload(&self, report: &ErrorReport) -> Value {
        json!({
            "message": report.message,
            "operation": report.operation,
            "kind": report.kind.as_str(),
            "tags": {
                "type": "frontend",
                "project_id": self.project_id,
            },
            "occurred_at": format_rfc3339(now_utc()).ok(),
        })
    }
}

#[async_trait]
impl ErrorReporter for WebhookReporter {
    async fn capture(&self, report: &ErrorReport) {
        LogReporter.capture(report).await;
        let delivered = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&self.payload(report))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        if let Err(err) = delivered {
            tracing::warn!(url = %self.url, "failed to deliver error report: {err}");
        }
    }
}
