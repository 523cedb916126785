//! Per-session turn handler.
//!
//! One `ConversationHandler` drives one session: it streams conversation
//! replies, records traits into the profile, schedules evaluations and walks
//! the confirmation state machine. Output goes to an event channel so the
//! same handler serves the WebSocket endpoint and the terminal chat.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::constants::REQUEST_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::evaluation::{CompletenessBreakdown, Evaluation};
use crate::evaluator::{EvaluationJob, EvaluatorService};
use crate::llm::{ChatMessage, LlmClient, ModelRole};
use crate::locale::{Locale, SystemPrompt};
use crate::session::{MessageKind, Session, SessionMessage, SessionRef, SessionStatus};
use crate::state::{transition, ConversationState, StateEvent};
use crate::store::FileSessionStore;
use crate::traits::TraitSplitter;

/// Messages pushed to the client, serialised as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ConversationEvent {
    SystemMessage {
        message: String,
    },
    AiResponseChunk {
        chunk: String,
    },
    ConfirmationRequest {
        reason: String,
    },
    EvaluationUpdate {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        evaluation_score: Option<f32>,
        is_ready: bool,
        extracted_traits: Vec<String>,
        extracted_keywords: Vec<String>,
        completeness_breakdown: CompletenessBreakdown,
        suggestions: Vec<String>,
    },
    FinalPromptChunk {
        chunk: String,
    },
    SessionEnd {
        message: String,
    },
    Error {
        message: String,
    },
    ApiConfigResult {
        success: bool,
        message: String,
    },
    SessionStarted {
        session_id: String,
        name: String,
        resumed: bool,
    },
}

impl ConversationEvent {
    pub fn system(message: impl Into<String>) -> Self {
        ConversationEvent::SystemMessage {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ConversationEvent::Error {
            message: message.into(),
        }
    }

    fn evaluation(locale: &Locale, evaluation: &Evaluation, threshold: f32) -> Self {
        let message = if evaluation.failed {
            evaluation.critique.clone()
        } else {
            locale.t_with("EVALUATOR_DONE", minijinja::context! { critique => &evaluation.critique })
        };
        ConversationEvent::EvaluationUpdate {
            message,
            evaluation_score: evaluation.score,
            is_ready: evaluation.is_ready(threshold),
            extracted_traits: evaluation.extracted_traits.clone(),
            extracted_keywords: evaluation.extracted_keywords.clone(),
            completeness_breakdown: evaluation.completeness_breakdown.clone(),
            suggestions: evaluation.suggestions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered; `trait_added` is set when the profile grew.
    Replied { trait_added: bool },
    ConfirmationRequested,
    /// The model call failed and the user was told so.
    Failed,
    /// Blank input, nothing happened.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Continue,
    Completed { path: PathBuf, prompt: String },
    WriterFailed,
}

#[derive(Debug, Clone)]
struct Verdict {
    // Submission order; a larger ticket never has a smaller revision
    ticket: u64,
    revision: u64,
    evaluation: Evaluation,
}

pub struct ConversationHandler {
    session: Session,
    store: FileSessionStore,
    client: LlmClient,
    evaluator: Arc<EvaluatorService>,
    locale: Arc<Locale>,
    threshold: f32,
    state: ConversationState,
    history: Vec<ChatMessage>,
    critique: String,
    // Number of traits in the profile; evaluations are ordered by it
    revision: u64,
    declined_at: Option<u64>,
    // Ticket of the last evaluation submitted
    ticket: u64,
    verdicts: Arc<watch::Sender<Option<Verdict>>>,
}

impl ConversationHandler {
    /// Wrap a session that has already been written to the store.
    pub fn new(
        session: Session,
        store: FileSessionStore,
        client: LlmClient,
        evaluator: Arc<EvaluatorService>,
        locale: Arc<Locale>,
        threshold: f32,
    ) -> Self {
        let critique = locale.t("DEFAULT_CRITIQUE");
        let (verdicts, _) = watch::channel(None);
        Self {
            session,
            store,
            client,
            evaluator,
            locale,
            threshold,
            state: ConversationState::Chatting,
            history: Vec::new(),
            critique,
            revision: 0,
            declined_at: None,
            ticket: 0,
            verdicts: Arc::new(verdicts),
        }
    }

    /// Create and persist a fresh session, then wrap it.
    pub async fn create(
        name: Option<String>,
        user_id: Option<String>,
        store: FileSessionStore,
        client: LlmClient,
        evaluator: Arc<EvaluatorService>,
        locale: Arc<Locale>,
        threshold: f32,
    ) -> Result<Self> {
        let session = Session::new(name, user_id, |timestamp| {
            locale.t_with("SESSION_NAME", minijinja::context! { timestamp => timestamp })
        });
        store.create_session(&session).await?;
        info!(session_id = %session.id, name = %session.name, "Session created");
        Ok(Self::new(session, store, client, evaluator, locale, threshold))
    }

    /// Reload a stored session: transcript, profile revision and the last verdict.
    pub async fn resume(
        session_ref: &SessionRef,
        store: FileSessionStore,
        client: LlmClient,
        evaluator: Arc<EvaluatorService>,
        locale: Arc<Locale>,
        threshold: f32,
    ) -> Result<Self> {
        let mut session = store.get_session(session_ref).await?;
        if session.status != SessionStatus::Active {
            session = store.set_status(session_ref, SessionStatus::Active).await?;
        }
        let profile = store.load_profile(session_ref).await?;
        let revision = profile.lines().filter(|l| !l.trim().is_empty()).count() as u64;
        let latest = store.load_evaluation(session_ref).await?;

        // The opening request is not stored, put it back so the history starts with the user
        let mut history = vec![ChatMessage::user(locale.t("INITIAL_USER_PROMPT"))];
        history.extend(session.messages.iter().filter_map(|m| match m.kind {
            MessageKind::User => Some(ChatMessage::user(m.content.clone())),
            MessageKind::Ai => Some(ChatMessage::assistant(m.content.clone())),
            _ => None,
        }));

        let mut handler = Self::new(session, store, client, evaluator, locale, threshold);
        handler.history = history;
        handler.revision = revision;
        let current = latest.as_ref().map_or(false, |e| e.revision == revision);
        if let Some(evaluation) = latest {
            if !evaluation.failed && !evaluation.critique.is_empty() {
                handler.critique = evaluation.critique.clone();
            }
            handler.verdicts.send_replace(Some(Verdict {
                ticket: 0,
                revision: evaluation.revision,
                evaluation,
            }));
        }
        // The stored verdict is missing or was computed for an older profile
        if revision > 0 && !current {
            debug!(session_id = %session_ref.id, revision, "Stored verdict is stale, re-evaluating");
            handler.schedule_evaluation(None).await?;
        }
        info!(session_id = %session_ref.id, revision, "Session resumed");
        Ok(handler)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_ref(&self) -> SessionRef {
        self.session.session_ref()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn critique(&self) -> &str {
        &self.critique
    }

    /// Latest verdict delivered for this session, if any.
    pub fn latest_evaluation(&self) -> Option<Evaluation> {
        self.verdicts.borrow().as_ref().map(|v| v.evaluation.clone())
    }

    /// Open the conversation: the model greets the user without a readiness check.
    pub async fn greet(&mut self, events: &mpsc::Sender<ConversationEvent>) -> Result<TurnOutcome> {
        let opening = self.locale.t("INITIAL_USER_PROMPT");
        self.run_turn(&opening, events).await
    }

    #[instrument(skip(self, text, events), fields(session_id = %self.session.id, revision = self.revision))]
    pub async fn handle_message(
        &mut self,
        text: &str,
        events: &mpsc::Sender<ConversationEvent>,
    ) -> Result<TurnOutcome> {
        if self.state != ConversationState::Chatting {
            return Err(Error::InvalidTransition {
                state: self.state.to_string(),
                action: "send a message".to_string(),
            });
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(TurnOutcome::Ignored);
        }
        self.record(MessageKind::User, text).await;

        if self.revision > 0 {
            let mut verdict = self.await_verdict().await;
            match verdict.as_ref().map(|e| e.failed) {
                Some(true) => {
                    info!("Evaluation of the current profile failed, retrying");
                    self.schedule_evaluation(Some(events)).await?;
                    verdict = self.await_verdict().await;
                }
                Some(false) => {}
                // Still pending; queue a fresh job so the next turn has one to wait for
                None => self.schedule_evaluation(Some(events)).await?,
            }
            if let Some(evaluation) = verdict {
                if !evaluation.failed && !evaluation.critique.is_empty() {
                    self.critique = evaluation.critique.clone();
                }
                if evaluation.is_ready(self.threshold) && self.declined_at != Some(self.revision) {
                    self.state = transition(self.state, StateEvent::ReadyForWriting)?;
                    let reason = if evaluation.critique.is_empty() {
                        self.locale.t("READY_DEFAULT_REASON")
                    } else {
                        evaluation.critique
                    };
                    info!(score = ?evaluation.score, "Profile ready, asking for confirmation");
                    emit(events, ConversationEvent::ConfirmationRequest { reason }).await;
                    return Ok(TurnOutcome::ConfirmationRequested);
                }
            }
        }

        self.run_turn(text, events).await
    }

    /// Answer a confirmation request.
    #[instrument(skip(self, events), fields(session_id = %self.session.id))]
    pub async fn confirm(&mut self, accepted: bool, events: &mpsc::Sender<ConversationEvent>) -> Result<ConfirmOutcome> {
        if !accepted {
            self.state = transition(self.state, StateEvent::Declined)?;
            self.declined_at = Some(self.revision);
            let text = self.locale.t("CONTINUE_PROMPT");
            self.record(MessageKind::Ai, &text).await;
            emit(events, ConversationEvent::AiResponseChunk { chunk: text }).await;
            return Ok(ConfirmOutcome::Continue);
        }

        self.state = transition(self.state, StateEvent::Confirmed)?;
        let header = self.locale.t("FINAL_PROMPT_HEADER");
        emit(events, ConversationEvent::FinalPromptChunk {
            chunk: format!("\n{header}\n"),
        })
        .await;

        let profile = self.store.load_profile(&self.session_ref()).await?;
        let system = self.locale.system_prompt(SystemPrompt::Writer, self.client.nsfw_mode())?;
        let request = [ChatMessage::user(profile)];

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let client = self.client.clone();
        let writer = async move { client.stream_chat(ModelRole::Writer, &system, &request, &delta_tx).await };
        let forward = async {
            while let Some(delta) = delta_rx.recv().await {
                emit(events, ConversationEvent::FinalPromptChunk { chunk: delta }).await;
            }
        };
        let (result, ()) = tokio::join!(writer, forward);

        match result {
            Ok(prompt) => {
                let session_ref = self.session_ref();
                let path = self.store.save_final_prompt(&session_ref, &prompt).await?;
                self.record(MessageKind::FinalPrompt, &prompt).await;
                self.session = self.store.set_status(&session_ref, SessionStatus::Completed).await?;
                self.state = transition(self.state, StateEvent::FinalPromptWritten)?;
                info!(path = %path.display(), "Final prompt written");
                emit(events, ConversationEvent::SessionEnd {
                    message: self.locale.t("APP_SHUTDOWN"),
                })
                .await;
                Ok(ConfirmOutcome::Completed { path, prompt })
            }
            Err(e) => {
                warn!(error = %e, "Writer call failed");
                let message = self.locale.t_with("ERROR_WRITER_LLM", minijinja::context! { error => e.to_string() });
                self.record(MessageKind::Error, &message).await;
                self.state = transition(self.state, StateEvent::WritingFailed)?;
                emit(events, ConversationEvent::error(message)).await;
                emit(events, ConversationEvent::ConfirmationRequest {
                    reason: self.locale.t("READY_DEFAULT_REASON"),
                })
                .await;
                Ok(ConfirmOutcome::WriterFailed)
            }
        }
    }

    /// Release evaluator bookkeeping for this session.
    pub fn close(&self) {
        self.evaluator.forget(&self.session_ref());
    }

    async fn run_turn(&mut self, text: &str, events: &mpsc::Sender<ConversationEvent>) -> Result<TurnOutcome> {
        let system = self.locale.system_prompt(SystemPrompt::Conversation, self.client.nsfw_mode())?;
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(self.locale.turn_envelope(&self.critique, text)));

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let client = self.client.clone();
        let reply = async move { client.stream_chat(ModelRole::Conversation, &system, &messages, &delta_tx).await };
        let forward = async {
            let mut splitter = TraitSplitter::new();
            while let Some(delta) = delta_rx.recv().await {
                let visible = splitter.push(&delta);
                if !visible.is_empty() {
                    emit(events, ConversationEvent::AiResponseChunk { chunk: visible }).await;
                }
            }
            splitter
        };
        let (result, splitter) = tokio::join!(reply, forward);
        let (tail, reply, trait_text) = splitter.finish();

        if let Err(e) = result {
            warn!(error = %e, "Conversation call failed");
            let message = self.locale.t_with("ERROR_CONVERSATION_LLM", minijinja::context! { error => e.to_string() });
            self.record(MessageKind::Error, &message).await;
            emit(events, ConversationEvent::error(message)).await;
            return Ok(TurnOutcome::Failed);
        }
        if !tail.is_empty() {
            emit(events, ConversationEvent::AiResponseChunk { chunk: tail }).await;
        }

        self.history.push(ChatMessage::user(text));
        self.history.push(ChatMessage::assistant(reply.clone()));
        self.record(MessageKind::Ai, &reply).await;

        let Some(trait_text) = trait_text else {
            return Ok(TurnOutcome::Replied { trait_added: false });
        };
        let session_ref = self.session_ref();
        self.store.append_trait(&session_ref, &trait_text).await?;
        self.revision += 1;
        debug!(revision = self.revision, %trait_text, "Trait recorded");
        self.schedule_evaluation(Some(events)).await?;
        Ok(TurnOutcome::Replied { trait_added: true })
    }

    async fn schedule_evaluation(&mut self, events: Option<&mpsc::Sender<ConversationEvent>>) -> Result<()> {
        let session = self.session_ref();
        let profile = self.store.load_profile(&session).await?;
        let revision = self.revision;
        self.ticket += 1;
        let ticket = self.ticket;
        let verdict_rx = self
            .evaluator
            .submit(EvaluationJob {
                session,
                profile,
                revision,
                client: self.client.clone(),
            })
            .await;
        if let Some(events) = events {
            emit(events, ConversationEvent::system(self.locale.t("EVALUATOR_EVALUATING"))).await;
        }

        let verdicts = self.verdicts.clone();
        let events = events.cloned();
        let locale = self.locale.clone();
        let threshold = self.threshold;
        tokio::spawn(async move {
            // An error here means the job was superseded or the service stopped
            let Ok(evaluation) = verdict_rx.await else { return };
            let update = ConversationEvent::evaluation(&locale, &evaluation, threshold);
            verdicts.send_if_modified(|current| {
                if current.as_ref().map_or(true, |v| v.ticket < ticket) {
                    *current = Some(Verdict {
                        ticket,
                        revision,
                        evaluation,
                    });
                    true
                } else {
                    false
                }
            });
            if let Some(events) = events {
                emit(&events, update).await;
            }
        });
        Ok(())
    }

    /// Wait for the verdict of the last submitted evaluation. Returns `None`
    /// when it does not arrive in time or was computed for another revision;
    /// an older verdict never decides readiness.
    async fn await_verdict(&self) -> Option<Evaluation> {
        let wanted = self.ticket;
        let mut rx = self.verdicts.subscribe();
        let wait = Duration::from_secs(*REQUEST_TIMEOUT_SECS + 5);
        let found = tokio::time::timeout(wait, async {
            match rx.wait_for(|v| v.as_ref().map_or(false, |v| v.ticket >= wanted)).await {
                Ok(verdict) => (*verdict).clone(),
                Err(_) => None,
            }
        })
        .await;
        match found {
            Ok(Some(verdict)) if verdict.revision == self.revision => Some(verdict.evaluation),
            Ok(_) => None,
            Err(_) => {
                warn!(revision = self.revision, "No verdict for the current profile in time");
                None
            }
        }
    }

    async fn record(&mut self, kind: MessageKind, content: &str) {
        match self
            .store
            .add_message(&self.session.session_ref(), SessionMessage::new(kind, content))
            .await
        {
            Ok(session) => self.session = session,
            Err(e) => warn!(session_id = %self.session.id, error = %e, "Failed to record message"),
        }
    }
}

async fn emit(events: &mpsc::Sender<ConversationEvent>, event: ConversationEvent) {
    if events.send(event).await.is_err() {
        debug!("Event receiver dropped");
    }
}
