//! `facts`: drives the client controller from a terminal.
//!
//! Every command signs in with `--token` (which fetches the fact list), runs a
//! single controller action and prints a JSON report with the action outcome
//! and a snapshot of the controller state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use fact_store_client::{
    ActionOutcome, ControllerSnapshot, ErrorReporter, FactController, HttpFactBackend,
    HttpPromptExecutor, LogReporter, Session, StaticIdentity, WebhookReporter,
};
use fact_store_core::Principal;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "facts")]
#[command(about = "Fact store client")]
pub struct Cli {
    #[arg(long, env = "FACT_STORE_API_URL", default_value = "http://127.0.0.1:4020")]
    api_url: String,

    #[arg(long, env = "FACT_STORE_EVENTS_URL")]
    events_url: Option<String>,

    #[arg(long, env = "APP_ID")]
    app_id: Option<String>,

    /// Error-tracking endpoint; failed actions are only logged when unset.
    #[arg(long, env = "ERROR_WEBHOOK_URL")]
    error_webhook_url: Option<String>,

    #[arg(long, env = "FACT_STORE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Principal id shown in the snapshot; the service derives ownership from the token.
    #[arg(long, env = "FACT_STORE_USER_ID", default_value = "me")]
    user_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    List,
    Save { text: String },
    Generate {
        #[arg(value_enum)]
        kind: GenerateKind,
    },
    TriggerError,
}

#[derive(Debug, Clone, Copy, ValueEnum, Eq, PartialEq)]
pub enum GenerateKind {
    Fact,
    Image,
    Speech,
    Markdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Save { .. } => "save",
            Self::Generate { .. } => "generate",
            Self::TriggerError => "trigger-error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandReport {
    pub command: &'static str,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub snapshot: ControllerSnapshot,
}

impl CommandReport {
    #[must_use]
    pub fn new(command: &'static str, outcome: &ActionOutcome, snapshot: ControllerSnapshot) -> Self {
        let error = match outcome {
            ActionOutcome::Failed(err) => Some(err.to_string()),
            ActionOutcome::Completed | ActionOutcome::Skipped | ActionOutcome::Busy => None,
        };
        Self {
            command,
            outcome: outcome.as_str(),
            error,
            snapshot,
        }
    }
}

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

type CliController = FactController<HttpFactBackend, HttpPromptExecutor, StaticIdentity>;

fn build_controller(cli: &Cli) -> CliController {
    let session = cli.token.as_ref().map(|token| Session {
        access_token: token.clone(),
        principal: Principal::new(cli.user_id.as_str()),
    });
    let reporter: Arc<dyn ErrorReporter> = match &cli.error_webhook_url {
        Some(url) => Arc::new(WebhookReporter::new(
            url.as_str(),
            cli.app_id.clone(),
            REPORT_TIMEOUT,
        )),
        None => Arc::new(LogReporter),
    };
    FactController::new(
        HttpFactBackend::new(&cli.api_url),
        HttpPromptExecutor::new(cli.events_url.clone().unwrap_or_default(), cli.app_id.clone()),
        StaticIdentity::new(session),
    )
    .with_reporter(reporter)
}

/// Runs one parsed command and prints its JSON report to stdout.
///
/// # Errors
/// Returns an error when the action fails, when `generate` is used without an
/// events URL, or when the report cannot be serialized.
pub async fn run_cli(cli: Cli) -> Result<()> {
    if matches!(cli.command, Command::Generate { .. }) && cli.events_url.is_none() {
        bail!("--events-url (or FACT_STORE_EVENTS_URL) is required for generate");
    }

    let controller = build_controller(&cli);
    if let Command::TriggerError = cli.command {
        return controller
            .trigger_error()
            .await
            .context("diagnostic error triggered");
    }

    let signed_in = controller.check_signed_in().await;
    let outcome = match &cli.command {
        Command::List if cli.token.is_none() => controller.fetch_facts().await,
        Command::List => signed_in,
        Command::Save { text } => {
            controller.set_draft(text.as_str());
            controller.save_fact().await
        }
        Command::Generate { kind } => match kind {
            GenerateKind::Fact => controller.generate_fact().await,
            GenerateKind::Image => controller.generate_image().await,
            GenerateKind::Speech => controller.text_to_speech().await,
            GenerateKind::Markdown => controller.generate_markdown().await,
        },
        Command::TriggerError => ActionOutcome::Skipped,
    };

    let report = CommandReport::new(cli.command.name(), &outcome, controller.snapshot());
    println!("{}", serde_json::to_string_pretty(&report)?);

    match outcome {
        ActionOutcome::Failed(err) => Err(err).context(format!("{} failed", report.command)),
        ActionOutcome::Completed | ActionOutcome::Skipped | ActionOutcome::Busy => Ok(()),
    }
}
