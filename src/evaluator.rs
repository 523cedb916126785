//! Background evaluator.
//!
//! Conversation handlers submit the full profile text after every update.
//! A worker task runs the evaluator model for each job (bounded by a
//! semaphore), persists the verdict and answers the submitter through a
//! oneshot channel. Jobs are tagged with the profile revision: a job that
//! has been overtaken by a newer revision of the same session is dropped
//! before the model call, and its verdict is never written over a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::evaluation::Evaluation;
use crate::llm::{ChatMessage, LlmClient, ModelRole};
use crate::locale::{Locale, SystemPrompt};
use crate::session::SessionRef;
use crate::store::FileSessionStore;

const QUEUE_CAPACITY: usize = 256;

pub struct EvaluationJob {
    pub session: SessionRef,
    pub profile: String,
    pub revision: u64,
    pub client: LlmClient,
}

struct Queued {
    job: EvaluationJob,
    reply: oneshot::Sender<Evaluation>,
}

type Revisions = Arc<Mutex<HashMap<SessionRef, u64>>>;

pub struct EvaluatorService {
    tx: mpsc::Sender<Queued>,
    latest: Revisions,
    shutdown: Arc<Notify>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    concurrency: usize,
}

impl EvaluatorService {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(store: FileSessionStore, locale: Arc<Locale>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let latest: Revisions = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let worker = tokio::spawn(run_worker(
            rx,
            store,
            locale.clone(),
            latest.clone(),
            shutdown.clone(),
            concurrency,
        ));
        info!("{}", locale.t_with("EVALUATOR_SERVICE_START", minijinja::context! { concurrency => concurrency }));

        Self {
            tx,
            latest,
            shutdown,
            worker: tokio::sync::Mutex::new(Some(worker)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue a job. The receiver yields the verdict, or errors if the job was
    /// superseded by a newer revision or the service stopped.
    pub async fn submit(&self, job: EvaluationJob) -> oneshot::Receiver<Evaluation> {
        let (reply, rx) = oneshot::channel();
        {
            let mut latest = lock(&self.latest);
            let entry = latest.entry(job.session.clone()).or_insert(job.revision);
            *entry = (*entry).max(job.revision);
        }
        debug!(session_id = %job.session.id, revision = job.revision, "Queueing evaluation");
        if self.tx.send(Queued { job, reply }).await.is_err() {
            warn!("Evaluator is stopped, dropping job");
        }
        rx
    }

    /// Drop revision bookkeeping for a session that is no longer active.
    pub fn forget(&self, session: &SessionRef) {
        lock(&self.latest).remove(session);
    }

    /// Signal shutdown and wait for in-flight evaluations to finish.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Evaluator worker panicked: {:?}", e);
            }
        }
    }
}

fn lock(revisions: &Revisions) -> std::sync::MutexGuard<'_, HashMap<SessionRef, u64>> {
    // The map holds plain integers, a poisoned lock still has usable data
    revisions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_stale(latest: &Revisions, session: &SessionRef, revision: u64) -> bool {
    lock(latest).get(session).map_or(false, |newest| *newest > revision)
}

async fn run_worker(
    mut rx: mpsc::Receiver<Queued>,
    store: FileSessionStore,
    locale: Arc<Locale>,
    latest: Revisions,
    shutdown: Arc<Notify>,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            queued = rx.recv() => {
                let Some(queued) = queued else { break };
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let store = store.clone();
                let locale = locale.clone();
                let latest = latest.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    evaluate(queued, &store, &locale, &latest).await;
                });
            }
            // Reap finished tasks so the set does not grow unbounded
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}
    info!("{}", locale.t("EVALUATOR_SERVICE_STOP"));
}

async fn evaluate(queued: Queued, store: &FileSessionStore, locale: &Locale, latest: &Revisions) {
    let Queued { job, reply } = queued;

    if job.profile.trim().is_empty() {
        let _ = reply.send(Evaluation::failed(locale.t("EVALUATOR_EMPTY_PROFILE")));
        return;
    }
    if is_stale(latest, &job.session, job.revision) {
        debug!(session_id = %job.session.id, revision = job.revision, "Skipping superseded evaluation");
        return;
    }

    let mut evaluation = match run_model(&job, locale).await {
        Ok(mut evaluation) => {
            evaluation.revision = job.revision;
            if is_stale(latest, &job.session, job.revision) {
                debug!(session_id = %job.session.id, revision = job.revision, "Verdict overtaken, not persisting");
            } else if let Err(e) = store.record_evaluation(&job.session, &evaluation).await {
                error!(session_id = %job.session.id, error = %e, "Failed to persist evaluation");
            }
            info!(session_id = %job.session.id, revision = job.revision, score = ?evaluation.score, ready = evaluation.is_ready_for_writing, "Profile evaluated");
            evaluation
        }
        Err(e) => {
            warn!(session_id = %job.session.id, error = %e, "Evaluator call failed");
            Evaluation::failed(locale.t_with("ERROR_EVALUATOR_LLM", minijinja::context! { error => e.to_string() }))
        }
    };
    evaluation.revision = job.revision;
    let _ = reply.send(evaluation);
}

async fn run_model(job: &EvaluationJob, locale: &Locale) -> crate::error::Result<Evaluation> {
    let system = locale.system_prompt(SystemPrompt::Evaluator, job.client.nsfw_mode())?;
    let text = job
        .client
        .complete(ModelRole::Evaluator, &system, &[ChatMessage::user(job.profile.clone())])
        .await?;
    Evaluation::parse(&text)
}
