use std::time::Duration;

use fact_store_core::{format_rfc3339, now_utc};
use serde::Serialize;
use serde_json::json;

/// One unexpected failure, as sent to the error-tracking collaborator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub operation: &'static str,
    pub message: String,
    pub detail: String,
}

/// Sink for failures that must never be exposed to the caller.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, report: &ErrorReport);
}

/// Reports through the tracing subscriber only.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn capture(&self, report: &ErrorReport) {
        tracing::error!(
            operation = report.operation,
            detail = %report.detail,
            "{}",
            report.message
        );
    }
}

/// Posts each report as JSON to an error-tracking endpoint.
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    url: String,
    project_id: Option<String>,
    agent: ureq::Agent,
}

impl WebhookReporter {
    #[must_use]
    pub fn new(url: impl Into<String>, project_id: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            project_id,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn payload(&self, report: &ErrorReport) -> serde_json::Value {
        let occurred_at = format_rfc3339(now_utc()).ok();
        json!({
            "message": report.message,
            "detail": report.detail,
            "operation": report.operation,
            "tags": {
                "type": "backend",
                "project_id": self.project_id,
            },
            "occurred_at": occurred_at,
        })
    }
}

impl ErrorReporter for WebhookReporter {
    fn capture(&self, report: &ErrorReport) {
        LogReporter.capture(report);
        if let Err(err) = self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_json(self.payload(report))
        {
            tracing::warn!(url = %self.url, "failed to deliver error report: {err}");
        }
    }
}
