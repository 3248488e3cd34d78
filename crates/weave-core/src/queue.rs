//! The episode queue: per-group serial FIFO lanes with cross-group
//! parallelism, provider-aware gating, and jittered retry.
//!
//! All mutating work enters the graph through here. A lane exists per
//! `group_id`; at most one job per lane runs at a time, at most
//! `max_inflight` jobs run across all lanes, and every job sees a
//! cancellation token plus a status board entry that outlives it.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{RetryClass, Result, WeaveError};

/// Scheduler poll granularity. Dispatch normally happens on notify;
/// the tick only covers spacing windows and cancellations.
const SCHEDULER_TICK: Duration = Duration::from_millis(20);

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeState {
    Queued,
    Dispatched,
    Extracting,
    Resolving,
    Persisting,
    Retrying,
    Done,
    Failed,
    Cancelled,
}

impl EpisodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EpisodeState::Done | EpisodeState::Failed | EpisodeState::Cancelled
        )
    }
}

/// Observable status of a job, kept after the job finishes.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: EpisodeState,
    /// Completed dispatch attempts (0 while the first one runs).
    pub attempts: u32,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Shared registry of job statuses, keyed by job id (the episode id
/// for ingest jobs).
#[derive(Clone, Default)]
pub struct StatusBoard {
    entries: Arc<Mutex<HashMap<Uuid, JobStatus>>>,
}

impl StatusBoard {
    pub fn get(&self, id: Uuid) -> Option<JobStatus> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    fn set(&self, id: Uuid, state: EpisodeState, attempts: u32, error: Option<String>) {
        self.entries.lock().unwrap().insert(
            id,
            JobStatus {
                state,
                attempts,
                error,
                updated_at: Utc::now(),
            },
        );
    }

    fn update_state(&self, id: Uuid, state: EpisodeState) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(status) = entries.get_mut(&id) {
            status.state = state;
            status.updated_at = Utc::now();
        }
    }
}

/// Handed to running jobs: cancellation signal plus progress
/// reporting into the status board.
#[derive(Clone)]
pub struct JobContext {
    id: Uuid,
    cancel: CancellationToken,
    board: StatusBoard,
}

impl JobContext {
    pub fn job_id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with `Cancelled` at a safe phase boundary.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(WeaveError::Cancelled);
        }
        Ok(())
    }

    pub fn progress(&self, state: EpisodeState) {
        self.board.update_state(self.id, state);
    }

    /// A detached context for callers outside the queue (tests,
    /// mutations executed inline).
    pub fn detached() -> Self {
        JobContext {
            id: Uuid::now_v7(),
            cancel: CancellationToken::new(),
            board: StatusBoard::default(),
        }
    }
}

/// Re-runnable unit of work. Called once per dispatch attempt.
pub type JobWork<R> =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static>;

/// Invoked once when a job lands in `Failed`, with the final error
/// rendered. Lets the service flag the stored episode.
pub type FailureHook = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

struct Job<R> {
    id: Uuid,
    group_id: String,
    work: JobWork<R>,
    done: oneshot::Sender<Result<R>>,
    cancel: CancellationToken,
    on_failure: Option<FailureHook>,
}

struct Lane<R> {
    queue: VecDeque<Job<R>>,
    busy: bool,
    not_before: Option<Instant>,
}

impl<R> Default for Lane<R> {
    fn default() -> Self {
        Lane {
            queue: VecDeque::new(),
            busy: false,
            not_before: None,
        }
    }
}

/// Queue tuning, lifted from the service configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_inflight: usize,
    pub spacing: Duration,
    pub provider_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

struct QueueInner<R> {
    lanes: Mutex<HashMap<String, Lane<R>>>,
    board: StatusBoard,
    inflight: Arc<Semaphore>,
    notify: Notify,
    shutdown: CancellationToken,
    config: QueueConfig,
}

/// Awaitable handle returned from submission. Dropping it detaches
/// the job; it keeps running.
#[derive(Debug)]
pub struct JobHandle<R> {
    pub id: Uuid,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<R>>,
}

impl<R> JobHandle<R> {
    /// Signal cancellation. Work checks the token at phase boundaries;
    /// a job that has entered its persistence phase completes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<R> {
        self.done
            .await
            .unwrap_or_else(|_| Err(WeaveError::Internal("job runner vanished".to_string())))
    }
}

pub struct EpisodeQueue<R: Send + 'static> {
    inner: Arc<QueueInner<R>>,
}

impl<R: Send + 'static> EpisodeQueue<R> {
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(QueueInner {
            lanes: Mutex::new(HashMap::new()),
            board: StatusBoard::default(),
            inflight: Arc::new(Semaphore::new(config.max_inflight)),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            config,
        });
        tokio::spawn(Self::scheduler(inner.clone()));
        EpisodeQueue { inner }
    }

    pub fn board(&self) -> StatusBoard {
        self.inner.board.clone()
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.inner.board.get(id)
    }

    /// Enqueue work on a group lane. Returns immediately; processing
    /// is asynchronous and the queue itself is in-memory only.
    pub fn submit(
        &self,
        id: Uuid,
        group_id: &str,
        work: JobWork<R>,
        on_failure: Option<FailureHook>,
    ) -> JobHandle<R> {
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let job = Job {
            id,
            group_id: group_id.to_string(),
            work,
            done: done_tx,
            cancel: cancel.clone(),
            on_failure,
        };
        self.inner.board.set(id, EpisodeState::Queued, 0, None);
        {
            let mut lanes = self.inner.lanes.lock().unwrap();
            lanes.entry(group_id.to_string()).or_default().queue.push_back(job);
        }
        self.inner.notify.notify_one();
        JobHandle {
            id,
            cancel,
            done: done_rx,
        }
    }

    /// Stop dispatching. Running jobs finish; queued jobs stay queued.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_one();
    }

    async fn scheduler(inner: Arc<QueueInner<R>>) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            }
            Self::dispatch_ready(&inner);
        }
    }

    /// Pop every lane that is idle, past its spacing window, and has
    /// work, as long as inflight permits remain.
    fn dispatch_ready(inner: &Arc<QueueInner<R>>) {
        let now = Instant::now();
        let mut lanes = inner.lanes.lock().unwrap();
        for (group_id, lane) in lanes.iter_mut() {
            if lane.busy || lane.queue.is_empty() {
                continue;
            }
            if lane.not_before.map(|t| now < t).unwrap_or(false) {
                continue;
            }

            // Cancelled-before-dispatch jobs resolve without taking
            // the lane or a permit.
            while let Some(job) = lane.queue.front() {
                if !job.cancel.is_cancelled() {
                    break;
                }
                let job = lane.queue.pop_front().unwrap();
                inner.board.set(job.id, EpisodeState::Cancelled, 0, None);
                let _ = job.done.send(Err(WeaveError::Cancelled));
            }

            let Ok(permit) = inner.inflight.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = lane.queue.pop_front() else {
                continue;
            };
            lane.busy = true;
            lane.not_before = Some(now + inner.config.spacing);
            tokio::spawn(Self::run_job(inner.clone(), group_id.clone(), job, permit));
        }
    }

    async fn run_job(
        inner: Arc<QueueInner<R>>,
        group_id: String,
        job: Job<R>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let board = inner.board.clone();
        let mut attempts: u32 = 0;

        let result = loop {
            board.set(job.id, EpisodeState::Dispatched, attempts, None);
            let ctx = JobContext {
                id: job.id,
                cancel: job.cancel.clone(),
                board: board.clone(),
            };
            match (job.work)(ctx).await {
                Ok(value) => {
                    board.set(job.id, EpisodeState::Done, attempts + 1, None);
                    break Ok(value);
                }
                Err(WeaveError::Cancelled) => {
                    board.set(job.id, EpisodeState::Cancelled, attempts + 1, None);
                    break Err(WeaveError::Cancelled);
                }
                Err(err) => {
                    let Some(class) = err.retry_class() else {
                        let reason = err.to_string();
                        board.set(
                            job.id,
                            EpisodeState::Failed,
                            attempts + 1,
                            Some(reason.clone()),
                        );
                        if let Some(hook) = &job.on_failure {
                            hook(reason).await;
                        }
                        break Err(err);
                    };
                    let policy = match class {
                        RetryClass::Provider => inner.config.provider_retry,
                        RetryClass::Store => inner.config.store_retry,
                    };
                    if attempts + 1 >= policy.max_attempts {
                        let reason = err.to_string();
                        board.set(
                            job.id,
                            EpisodeState::Failed,
                            attempts + 1,
                            Some(reason.clone()),
                        );
                        if let Some(hook) = &job.on_failure {
                            hook(reason.clone()).await;
                        }
                        break Err(WeaveError::Exhausted {
                            attempts: attempts + 1,
                            reason,
                        });
                    }

                    board.set(
                        job.id,
                        EpisodeState::Retrying,
                        attempts + 1,
                        Some(err.to_string()),
                    );
                    let delay = jittered(policy.delay(attempts));
                    log::debug!(
                        "job {} retrying in {:?} after attempt {}: {}",
                        job.id,
                        delay,
                        attempts + 1,
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = job.cancel.cancelled() => {
                            board.set(job.id, EpisodeState::Cancelled, attempts + 1, None);
                            break Err(WeaveError::Cancelled);
                        }
                    }
                    attempts += 1;
                }
            }
        };

        let _ = job.done.send(result);

        {
            let mut lanes = inner.lanes.lock().unwrap();
            if let Some(lane) = lanes.get_mut(&group_id) {
                // Spacing runs dispatch-to-dispatch; it was stamped
                // when this job left the lane.
                lane.busy = false;
            }
        }
        drop(permit);
        inner.notify.notify_one();
    }
}

impl<R: Send + 'static> Drop for EpisodeQueue<R> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Half-to-full jitter keeps synchronized retries from re-stampeding
/// the provider.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
}
