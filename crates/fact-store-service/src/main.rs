mod api;
mod auth;
mod reporting;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use fact_store_core::{
    ErrorBody, ErrorKind, Fact, FactError, IdempotencyKey, NewFact, Principal, SaveFactRequest,
    AUTHENTICATION_FAILED, FETCH_FAILED, SAVE_FAILED,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::api::FactStoreApi;
use crate::auth::{bearer_token, AuthError, RemoteTokenVerifier, StaticTokenVerifier, TokenVerifier};
use crate::reporting::{ErrorReport, ErrorReporter, LogReporter, WebhookReporter};

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const IDEMPOTENT_REPLAYED_HEADER: &str = "idempotent-replayed";
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ServiceState {
    api: FactStoreApi,
    verifier: Arc<dyn TokenVerifier>,
    reporter: Arc<dyn ErrorReporter>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Copy)]
enum OnTimeout {
    /// Stop waiting; the operation has no side effects worth observing.
    Abandon,
    AwaitCompletion,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    verifier: &'static str,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    authentication_error_total: AtomicU64,
    storage_error_total: AtomicU64,
    idempotent_replay_total: AtomicU64,
    method_not_allowed_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    authentication_error_total: u64,
    storage_error_total: u64,
    idempotent_replay_total: u64,
    method_not_allowed_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "fact-store-service")]
#[command(about = "HTTP backend for the fact store")]
struct Args {
    #[arg(long, env = "FACT_STORE_DB", default_value = "./fact_store.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "FACT_STORE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "FACT_STORE_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "FACT_STORE_IDEMPOTENCY_WINDOW_SECS", default_value_t = 600)]
    idempotency_window_secs: u32,
    /// Identity provider base URL; tokens are resolved via `{url}/auth/v1/user`.
    #[arg(long, env = "AUTH_URL")]
    auth_url: Option<String>,
    #[arg(long, env = "AUTH_API_KEY")]
    auth_api_key: Option<String>,
    /// Development-only token table, `TOKEN=USER_ID`; ignored when --auth-url is set.
    #[arg(long = "static-token", value_name = "TOKEN=USER_ID")]
    static_tokens: Vec<String>,
    #[arg(long, env = "ERROR_WEBHOOK_URL")]
    error_webhook_url: Option<String>,
    #[arg(long, env = "APP_ID")]
    app_id: Option<String>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: self.message,
            kind: self.kind,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(&self, status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure(kind);
        ServiceFailure {
            status,
            kind,
            message: message.into(),
        }
    }

    fn fact_failure(&self, err: &FactError) -> ServiceFailure {
        match err {
            FactError::Validation(message) => {
                self.failure(StatusCode::BAD_REQUEST, ErrorKind::ValidationError, message.clone())
            }
            FactError::Authentication(_) => self.failure(
                StatusCode::UNAUTHORIZED,
                ErrorKind::AuthenticationError,
                AUTHENTICATION_FAILED,
            ),
            FactError::Storage(message) => self.failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::StorageError,
                message.clone(),
            ),
        }
    }

    async fn report(&self, report: ErrorReport) {
        let reporter = Arc::clone(&self.reporter);
        if let Err(err) = tokio::task::spawn_blocking(move || reporter.capture(&report)).await {
            tracing::error!("error reporter failed: {err}");
        }
    }

    /// Resolves the caller before anything else about the request is looked at.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ServiceFailure> {
        let Some(token) = bearer_token(headers) else {
            tracing::debug!("request without bearer token");
            return Err(self.fact_failure(&FactError::Authentication(
                "missing bearer token".to_string(),
            )));
        };

        let verifier = Arc::clone(&self.verifier);
        let token = token.to_string();
        let verified = tokio::task::spawn_blocking(move || verifier.verify(&token)).await;

        let detail = match verified {
            Ok(Ok(principal)) => return Ok(principal),
            Ok(Err(AuthError::Rejected(reason))) => {
                tracing::debug!(%reason, "bearer token rejected");
                return Err(self.fact_failure(&FactError::Authentication(reason)));
            }
            Ok(Err(AuthError::Unavailable(detail))) => detail,
            Err(err) => format!("token verification join failure: {err}"),
        };

        self.report(ErrorReport {
            operation: "authenticate",
            message: AUTHENTICATION_FAILED.to_string(),
            detail: detail.clone(),
        })
        .await;
        Err(self.fact_failure(&FactError::Authentication(detail)))
    }

    /// Runs a read on the blocking pool under the operation timeout.
    /// Every failure is reported and surfaces as an opaque `StorageError`.
    async fn run_blocking<T, F>(
        &self,
        operation: &'static str,
        public_message: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(FactStoreApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_store_op(operation, public_message, OnTimeout::Abandon, op)
            .await
    }

    /// Runs a write on the blocking pool. A write that outlives the operation
    /// timeout is still awaited, so the response always matches what was committed.
    async fn run_write<T, F>(
        &self,
        operation: &'static str,
        public_message: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(FactStoreApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_store_op(operation, public_message, OnTimeout::AwaitCompletion, op)
            .await
    }

    async fn run_store_op<T, F>(
        &self,
        operation: &'static str,
        public_message: &'static str,
        on_timeout: OnTimeout,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(FactStoreApi) -> anyhow::Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let mut handle = tokio::task::spawn_blocking(move || op(api));

        let joined = match tokio::time::timeout(self.operation_timeout, &mut handle).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                self.telemetry.timeout_total.fetch_add(1, Ordering::Relaxed);
                match on_timeout {
                    OnTimeout::Abandon => None,
                    OnTimeout::AwaitCompletion => {
                        tracing::warn!(
                            operation,
                            timeout_ms = %self.operation_timeout.as_millis(),
                            "write exceeded operation timeout; awaiting completion"
                        );
                        Some(handle.await)
                    }
                }
            }
        };

        let detail = match joined {
            Some(Ok(Ok(value))) => return Ok(value),
            Some(Ok(Err(err))) => {
                let validation = err
                    .downcast_ref::<FactError>()
                    .filter(|fact_err| matches!(fact_err, FactError::Validation(_)));
                if let Some(fact_err) = validation {
                    return Err(self.fact_failure(fact_err));
                }
                format!("{err:#}")
            }
            Some(Err(err)) => format!("{operation} join failure: {err}"),
            None => format!(
                "{operation} timed out after {} ms",
                self.operation_timeout.as_millis()
            ),
        };

        self.report(ErrorReport {
            operation,
            message: public_message.to_string(),
            detail,
        })
        .await;
        Err(self.fact_failure(&FactError::Storage(public_message.to_string())))
    }

    fn method_not_allowed(&self, method: &Method, allow: &'static str) -> Response {
        self.telemetry
            .method_not_allowed_total
            .fetch_add(1, Ordering::Relaxed);
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, allow)],
            format!("Method {method} Not Allowed"),
        )
            .into_response()
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, kind: ErrorKind) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            ErrorKind::ValidationError => &self.validation_error_total,
            ErrorKind::AuthenticationError => &self.authentication_error_total,
            ErrorKind::StorageError => &self.storage_error_total,
            // client-side only; counted in the failure total
            ErrorKind::NetworkError => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            authentication_error_total: self.authentication_error_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
            idempotent_replay_total: self.idempotent_replay_total.load(Ordering::Relaxed),
            method_not_allowed_total: self.method_not_allowed_total.load(Ordering::Relaxed),
        }
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, FactError> {
    let Some(raw) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let raw = raw.to_str().map_err(|_| {
        FactError::Validation("idempotency key MUST be printable ASCII".to_string())
    })?;
    IdempotencyKey::parse(raw).map(Some)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/saveFact",
            post(save_fact).fallback(save_fact_method_not_allowed),
        )
        .route(
            "/api/getFacts",
            get(get_facts)
                .head(get_facts_method_not_allowed)
                .fallback(get_facts_method_not_allowed),
        )
        .with_state(state)
}

fn build_verifier(args: &Args) -> Result<Arc<dyn TokenVerifier>> {
    if let Some(url) = &args.auth_url {
        tracing::info!(auth_url = %url, "resolving bearer tokens through identity provider");
        return Ok(Arc::new(RemoteTokenVerifier::new(
            url,
            args.auth_api_key.clone(),
            OUTBOUND_TIMEOUT,
        )));
    }

    let verifier = StaticTokenVerifier::from_pairs(&args.static_tokens)?;
    if verifier.is_empty() {
        tracing::warn!("no identity provider or static tokens configured; every request will be rejected");
    }
    Ok(Arc::new(verifier))
}

fn build_reporter(args: &Args) -> Arc<dyn ErrorReporter> {
    match &args.error_webhook_url {
        Some(url) => Arc::new(WebhookReporter::new(
            url.clone(),
            args.app_id.clone(),
            OUTBOUND_TIMEOUT,
        )),
        None => Arc::new(LogReporter),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let state = ServiceState {
        api: FactStoreApi::new(
            args.db.clone(),
            time::Duration::seconds(i64::from(args.idempotency_window_secs)),
        ),
        verifier: build_verifier(&args)?,
        reporter: build_reporter(&args),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let schema = state.api.migrate()?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = schema.current_version,
        "fact store schema ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "fact store service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        verifier: state.verifier.verifier_name(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn save_fact(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<SaveFactRequest>, JsonRejection>,
) -> Result<Response, ServiceFailure> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let principal = state.authenticate(&headers).await?;

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            state.telemetry.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%rejection, "unreadable saveFact body");
            SaveFactRequest::default()
        }
    };
    let fact_text = request
        .into_fact_text()
        .map_err(|err| state.fact_failure(&err))?;
    let idempotency_key = idempotency_key(&headers).map_err(|err| state.fact_failure(&err))?;

    let input = NewFact {
        user_id: principal.id,
        fact_text,
        idempotency_key,
    };
    let outcome = state
        .run_write("save_fact", SAVE_FAILED, move |api| api.save_fact(&input))
        .await?;

    state
        .telemetry
        .requests_success_total
        .fetch_add(1, Ordering::Relaxed);
    if outcome.replayed {
        state
            .telemetry
            .idempotent_replay_total
            .fetch_add(1, Ordering::Relaxed);
    }
    tracing::info!(
        fact_id = outcome.fact.id,
        user_id = %outcome.fact.user_id,
        replayed = outcome.replayed,
        "fact saved"
    );

    let mut response = (StatusCode::CREATED, Json(outcome.fact)).into_response();
    if outcome.replayed {
        response
            .headers_mut()
            .insert(
                HeaderName::from_static(IDEMPOTENT_REPLAYED_HEADER),
                HeaderValue::from_static("true"),
            );
    }
    Ok(response)
}

async fn get_facts(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Fact>>, ServiceFailure> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let principal = state.authenticate(&headers).await?;

    let user_id = principal.id;
    let facts = state
        .run_blocking("get_facts", FETCH_FAILED, move |api| api.list_facts(&user_id))
        .await?;

    state
        .telemetry
        .requests_success_total
        .fetch_add(1, Ordering::Relaxed);
    Ok(Json(facts))
}

async fn save_fact_method_not_allowed(State(state): State<ServiceState>, method: Method) -> Response {
    state.method_not_allowed(&method, "POST")
}

async fn get_facts_method_not_allowed(State(state): State<ServiceState>, method: Method) -> Response {
    state.method_not_allowed(&method, "GET")
}
