use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fact_store_core::{Fact, IdempotencyKey, Principal};
use serde::Serialize;

use crate::backend::FactBackend;
use crate::busy::{Action, BusyRegistry};
use crate::events::{GenerationEvent, PromptExecutor, FACT_PROMPT, IMAGE_PROMPT, STORY_PROMPT};
use crate::reporting::{ErrorReport, ErrorReporter, LogReporter};
use crate::session::{IdentityProvider, Session};
use crate::ClientError;

const DIAGNOSTIC_MESSAGE: &str = "This is a test error for error tracking";

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum View {
    #[default]
    Login,
    Home,
}

/// One row of the displayed list. A `Pending` entry exists only while its
/// save request is in flight.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FactEntry {
    Pending {
        key: IdempotencyKey,
        fact_text: String,
    },
    Saved(Fact),
}

impl FactEntry {
    #[must_use]
    pub fn fact_text(&self) -> &str {
        match self {
            Self::Pending { fact_text, .. } => fact_text,
            Self::Saved(fact) => &fact.fact_text,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    fn is_pending_for(&self, key: &IdempotencyKey) -> bool {
        matches!(self, Self::Pending { key: pending, .. } if pending == key)
    }

    fn saved_id(&self) -> Option<i64> {
        match self {
            Self::Saved(fact) => Some(fact.id),
            Self::Pending { .. } => None,
        }
    }
}

/// Key of a failed save, reused while the draft still holds the same text.
#[derive(Debug, Clone, Eq, PartialEq)]
struct RetryKey {
    fact_text: String,
    key: IdempotencyKey,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ClientState {
    pub view: View,
    pub principal: Option<Principal>,
    pub facts: Vec<FactEntry>,
    pub draft: String,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub markdown: Option<String>,
    #[serde(skip)]
    access_token: Option<String>,
    #[serde(skip)]
    retry: Option<RetryKey>,
}

impl ClientState {
    fn submission_key(&self) -> IdempotencyKey {
        match &self.retry {
            Some(retry) if retry.fact_text == self.draft => retry.key.clone(),
            _ => IdempotencyKey::generate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ControllerSnapshot {
    pub state: ClientState,
    pub busy: Vec<Action>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ActionOutcome {
    Completed,
    /// Nothing to submit, e.g. an empty draft.
    Skipped,
    /// The same action is already in flight; no request was sent.
    Busy,
    Failed(ClientError),
}

impl ActionOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Busy => "busy",
            Self::Failed(_) => "failed",
        }
    }
}

/// View-model for the fact screen. All methods take `&self`, so several actions
/// can be in flight at once; the state lock is never held across an await.
pub struct FactController<B, P, I> {
    backend: B,
    prompts: P,
    identity: I,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<ClientState>,
    busy: BusyRegistry,
}

impl<B, P, I> FactController<B, P, I>
where
    B: FactBackend,
    P: PromptExecutor,
    I: IdentityProvider,
{
    pub fn new(backend: B, prompts: P, identity: I) -> Self {
        Self {
            backend,
            prompts,
            identity,
            reporter: Arc::new(LogReporter),
            state: Mutex::new(ClientState::default()),
            busy: BusyRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn prompts(&self) -> &P {
        &self.prompts
    }

    pub fn busy(&self) -> &BusyRegistry {
        &self.busy
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn access_token(&self) -> Option<String> {
        self.state().access_token.clone()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state().clone(),
            busy: self.busy.active(),
        }
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let mut state = self.state();
        state.draft = text.into();
        if state
            .retry
            .as_ref()
            .is_some_and(|retry| retry.fact_text != state.draft)
        {
            state.retry = None;
        }
    }

    pub async fn check_signed_in(&self) -> ActionOutcome {
        match self.identity.current_session().await {
            Ok(session) => self.on_auth_state_change(session).await,
            Err(err) => self.fail("check_signed_in", err).await,
        }
    }

    /// Applies an identity transition. Signing in always refetches the list;
    /// signing out clears it and returns to the login view.
    pub async fn on_auth_state_change(&self, session: Option<Session>) -> ActionOutcome {
        match session {
            Some(session) => {
                {
                    let mut state = self.state();
                    if state.principal.as_ref() != Some(&session.principal) {
                        state.facts.clear();
                        state.retry = None;
                    }
                    state.principal = Some(session.principal);
                    state.access_token = Some(session.access_token);
                    state.view = View::Home;
                }
                self.fetch_facts().await
            }
            None => {
                let mut state = self.state();
                state.principal = None;
                state.access_token = None;
                state.facts.clear();
                state.retry = None;
                state.view = View::Login;
                ActionOutcome::Completed
            }
        }
    }

    pub async fn sign_out(&self) -> ActionOutcome {
        if let Err(err) = self.identity.sign_out().await {
            return self.fail("sign_out", err).await;
        }
        self.on_auth_state_change(None).await
    }

    /// Replaces the saved rows with the server listing. Rows are never deleted,
    /// so saved rows newer than the listing (a save that landed while the list
    /// was in flight) are kept, followed by entries still pending.
    pub async fn fetch_facts(&self) -> ActionOutcome {
        let Some(token) = self.access_token() else {
            return self.fail("fetch_facts", ClientError::NotSignedIn).await;
        };

        match self.backend.list_facts(&token).await {
            Ok(facts) => {
                let mut state = self.state();
                if state.access_token.as_deref() != Some(token.as_str()) {
                    // session changed while the request was in flight
                    return ActionOutcome::Skipped;
                }
                let listed_up_to = facts.iter().map(|fact| fact.id).max();
                let (newer, pending): (Vec<FactEntry>, Vec<FactEntry>) = state
                    .facts
                    .drain(..)
                    .filter(|entry| match entry.saved_id() {
                        Some(id) => listed_up_to.map_or(true, |max| id > max),
                        None => true,
                    })
                    .partition(|entry| !entry.is_pending());
                state.facts = facts.into_iter().map(FactEntry::Saved).collect();
                state.facts.extend(newer);
                state.facts.extend(pending);
                ActionOutcome::Completed
            }
            Err(err) => self.fail("fetch_facts", err).await,
        }
    }

    /// Appends a pending entry for the draft and submits it. A retry of the
    /// same draft after a failure reuses the failed attempt's idempotency key.
    fn begin_save(&self) -> Result<Option<(String, String, IdempotencyKey)>, ClientError> {
        let mut state = self.state();
        let Some(token) = state.access_token.clone() else {
            return Err(ClientError::NotSignedIn);
        };
        if state.draft.is_empty() {
            return Ok(None);
        }
        let fact_text = state.draft.clone();
        let key = state.submission_key();
        state.facts.push(FactEntry::Pending {
            key: key.clone(),
            fact_text: fact_text.clone(),
        });
        Ok(Some((token, fact_text, key)))
    }

    pub async fn save_fact(&self) -> ActionOutcome {
        let Some(_busy) = self.busy.try_begin(Action::SaveFact) else {
            return ActionOutcome::Busy;
        };

        let (token, fact_text, key) = match self.begin_save() {
            Ok(Some(submission)) => submission,
            Ok(None) => return ActionOutcome::Skipped,
            Err(err) => return self.fail(Action::SaveFact.as_str(), err).await,
        };

        match self.backend.save_fact(&token, &fact_text, &key).await {
            Ok(fact) => {
                let mut state = self.state();
                reconcile_saved(&mut state.facts, &key, fact);
                if state.retry.as_ref().is_some_and(|retry| retry.key == key) {
                    state.retry = None;
                }
                if state.draft == fact_text {
                    state.draft.clear();
                }
                ActionOutcome::Completed
            }
            Err(err) => {
                {
                    let mut state = self.state();
                    state.facts.retain(|entry| !entry.is_pending_for(&key));
                    if state.draft == fact_text {
                        state.retry = Some(RetryKey { fact_text, key });
                    }
                }
                self.fail(Action::SaveFact.as_str(), err).await
            }
        }
    }

    pub async fn generate_fact(&self) -> ActionOutcome {
        self.generate(
            Action::GenerateFact,
            |_| {
                Some(GenerationEvent::ChatRequest {
                    prompt: FACT_PROMPT.to_string(),
                })
            },
            |state, result| state.draft = result,
        )
        .await
    }

    pub async fn generate_image(&self) -> ActionOutcome {
        self.generate(
            Action::GenerateImage,
            |_| {
                Some(GenerationEvent::GenerateImage {
                    prompt: IMAGE_PROMPT.to_string(),
                })
            },
            |state, result| state.image_url = Some(result),
        )
        .await
    }

    /// Reads the current draft aloud. An empty draft is skipped.
    pub async fn text_to_speech(&self) -> ActionOutcome {
        self.generate(
            Action::TextToSpeech,
            |state| {
                (!state.draft.is_empty()).then(|| GenerationEvent::TextToSpeech {
                    text: state.draft.clone(),
                })
            },
            |state, result| state.audio_url = Some(result),
        )
        .await
    }

    pub async fn generate_markdown(&self) -> ActionOutcome {
        self.generate(
            Action::GenerateMarkdown,
            |_| {
                Some(GenerationEvent::ChatRequest {
                    prompt: STORY_PROMPT.to_string(),
                })
            },
            |state, result| state.markdown = Some(result),
        )
        .await
    }

    /// Always fails, after sending one report. Lets a host confirm that error
    /// tracking is wired up.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Diagnostic`] unconditionally.
    pub async fn trigger_error(&self) -> Result<(), ClientError> {
        let err = ClientError::Diagnostic(DIAGNOSTIC_MESSAGE.to_string());
        self.report("trigger_error", &err).await;
        Err(err)
    }

    async fn generate(
        &self,
        action: Action,
        build: impl FnOnce(&ClientState) -> Option<GenerationEvent>,
        apply: impl FnOnce(&mut ClientState, String),
    ) -> ActionOutcome {
        let Some(_busy) = self.busy.try_begin(action) else {
            return ActionOutcome::Busy;
        };

        let prepared = {
            let guard = self.state();
            let state: &ClientState = &guard;
            match state.access_token.clone() {
                Some(token) => Ok(build(state).map(|event| (token, event))),
                None => Err(ClientError::NotSignedIn),
            }
        };
        let (token, event) = match prepared {
            Ok(Some(request)) => request,
            Ok(None) => return ActionOutcome::Skipped,
            Err(err) => return self.fail(action.as_str(), err).await,
        };

        match self.prompts.create_event(&token, &event).await {
            Ok(result) => {
                let state: &mut ClientState = &mut self.state();
                apply(state, result);
                ActionOutcome::Completed
            }
            Err(err) => self.fail(action.as_str(), err).await,
        }
    }

    async fn report(&self, operation: &'static str, err: &ClientError) {
        self.reporter
            .capture(&ErrorReport {
                operation,
                kind: err.kind(),
                message: err.to_string(),
            })
            .await;
    }

    /// Logs a failed action and reports it, unless it only failed for lack of a session.
    async fn fail(&self, operation: &'static str, err: ClientError) -> ActionOutcome {
        if err == ClientError::NotSignedIn {
            tracing::warn!(operation, "action needs a signed-in session");
        } else {
            tracing::error!(
                operation,
                kind = err.kind().as_str(),
                error = %err,
                "client action failed"
            );
            self.report(operation, &err).await;
        }
        ActionOutcome::Failed(err)
    }
}

fn reconcile_saved(facts: &mut Vec<FactEntry>, key: &IdempotencyKey, fact: Fact) {
    let Some(position) = facts.iter().position(|entry| entry.is_pending_for(key)) else {
        // list was cleared by a sign-out while the save was in flight
        return;
    };
    if facts.iter().any(|entry| entry.saved_id() == Some(fact.id)) {
        facts.remove(position);
    } else {
        facts[position] = FactEntry::Saved(fact);
    }
}
