//! Conversion job lifecycle: submit, poll until a terminal status, cancel.
//!
//! ```text
//!   submit()  ──► Submitting ──create──► (first status) ──► InProgress* ──► Completed
//!                                                                     ├──► Failed
//!   cancel()  ─────────────────────────────────────────────────────────┴──► Cancelled
//! ```
//!
//! The controller owns the single live [`ConversionJob`].  A background
//! driver task does the remote calls; it only ever mutates the job through
//! [`Shared::transition`] and only while it still owns the current
//! generation and has not been cancelled.  Anything it learns after that is
//! dropped on the floor.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{RemoteConversionClient, RemoteStatus};
use crate::error::{ClientError, SubmitError};
use crate::progress::{self, ProgressTracker};
use crate::types::{ConversionJob, ConversionRequest, FailureKind, JobId, JobState, SourceRef};

// ── policy ────────────────────────────────────────────────────────────────────

/// Timing and retry limits for talking to the remote service.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay between successful status fetches.
    pub poll_interval: Duration,
    /// Upper bound for one remote call; exceeding it counts as a failure.
    pub poll_timeout: Duration,
    /// Consecutive failures tolerated before giving up.
    pub retry_budget: u32,
    /// First retry delay; doubles on each consecutive failure.
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(10),
            retry_budget: 5,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

// ── shared state ──────────────────────────────────────────────────────────────

struct Shared {
    job: ConversionJob,
    /// Bumped on every submit; a driver only acts while it matches.
    generation: u64,
    token: CancellationToken,
    subscribers: Vec<mpsc::UnboundedSender<JobState>>,
}

impl Shared {
    /// The only place the job state changes.  Publishes to every subscriber
    /// in order and closes all subscriptions on a terminal state.
    fn transition(&mut self, next: JobState) {
        debug!("job: {:?} -> {:?}", self.job.state, next);
        self.job.state = next.clone();
        self.job.updated_at = chrono::Utc::now();
        self.subscribers.retain(|tx| tx.send(next.clone()).is_ok());
        if next.is_terminal() {
            self.subscribers.clear();
        }
    }
}

// ── public API ────────────────────────────────────────────────────────────────

/// Owns at most one conversion job at a time.  Cheap to clone; clones share
/// the same job.
pub struct JobController<C: RemoteConversionClient> {
    client: Arc<C>,
    policy: PollPolicy,
    shared: Arc<Mutex<Shared>>,
}

impl<C: RemoteConversionClient> Clone for JobController<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            policy: self.policy.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: RemoteConversionClient> JobController<C> {
    pub fn new(client: C) -> Self {
        Self::with_policy(client, PollPolicy::default())
    }

    pub fn with_policy(client: C, policy: PollPolicy) -> Self {
        Self {
            client: Arc::new(client),
            policy,
            shared: Arc::new(Mutex::new(Shared {
                job: ConversionJob::new(),
                generation: 0,
                token: CancellationToken::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Start a new job.  The controller is in `Submitting` by the time this
    /// returns; the remote calls happen on a background task.
    pub async fn submit(&self, request: ConversionRequest) -> Result<JobHandle, SubmitError> {
        let mut shared = self.shared.lock().await;
        if shared.job.state.is_in_flight() {
            debug!("job: submit rejected, {:?} still running", shared.job.state);
            return Err(SubmitError::AlreadyRunning);
        }
        if !self.client.has_credentials() {
            return Err(SubmitError::MissingCredentials);
        }
        check_source(request.source()).await?;

        shared.generation += 1;
        shared.token = CancellationToken::new();
        shared.job = ConversionJob::new();
        shared.transition(JobState::Submitting);

        let generation = shared.generation;
        info!(
            "job: submitting #{} source={} style={}",
            generation,
            request.source(),
            request.style()
        );

        let driver = Driver {
            client: Arc::clone(&self.client),
            policy: self.policy.clone(),
            shared: Arc::clone(&self.shared),
            generation,
            token: shared.token.clone(),
        };
        tokio::spawn(driver.run(request));

        Ok(JobHandle {
            generation,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Subscribe to state transitions from now on.  The stream ends after
    /// the next terminal state; taken between jobs, it follows the next
    /// submitted job.
    pub async fn observe_state(&self) -> JobStateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().await.subscribers.push(tx);
        JobStateStream { rx }
    }

    pub async fn state(&self) -> JobState {
        self.shared.lock().await.job.state.clone()
    }

    pub async fn job(&self) -> ConversionJob {
        self.shared.lock().await.job.clone()
    }

    /// Cancel the running job.  Returns `false` (and does nothing) when no
    /// job is in flight.
    ///
    /// The local transition to `Cancelled` happens first; the remote cancel
    /// is best effort and its failure is only logged.
    pub async fn cancel(&self) -> bool {
        let id = {
            let mut shared = self.shared.lock().await;
            if !shared.job.state.is_in_flight() {
                debug!("job: cancel ignored in {:?}", shared.job.state);
                return false;
            }
            shared.token.cancel();
            shared.job.cancelled = true;
            shared.transition(JobState::Cancelled);
            shared.job.id.clone()
        };
        info!("job: cancelled by user");

        if let Some(id) = id {
            cancel_remote(self.client.as_ref(), &id, self.policy.poll_timeout).await;
        }
        true
    }
}

/// Returned by `submit`; identifies one job on its controller.
#[derive(Clone)]
pub struct JobHandle {
    generation: u64,
    shared: Arc<Mutex<Shared>>,
}

impl JobHandle {
    /// Local sequence number of this job on its controller.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remote id, once assigned.  `None` after a newer job replaced this one.
    pub async fn job_id(&self) -> Option<JobId> {
        let shared = self.shared.lock().await;
        if shared.generation != self.generation {
            return None;
        }
        shared.job.id.clone()
    }

    /// Current state of this job, or `None` once it was superseded.
    pub async fn state(&self) -> Option<JobState> {
        let shared = self.shared.lock().await;
        (shared.generation == self.generation).then(|| shared.job.state.clone())
    }
}

/// Ordered job state transitions.  Ends after a terminal state.
pub struct JobStateStream {
    rx: mpsc::UnboundedReceiver<JobState>,
}

impl JobStateStream {
    pub async fn recv(&mut self) -> Option<JobState> {
        self.rx.recv().await
    }
}

impl Stream for JobStateStream {
    type Item = JobState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobState>> {
        self.rx.poll_recv(cx)
    }
}

// ── source validation ─────────────────────────────────────────────────────────

async fn check_source(source: &SourceRef) -> Result<(), SubmitError> {
    match source {
        SourceRef::Url(raw) => {
            let url = url::Url::parse(raw)
                .map_err(|e| SubmitError::InvalidSource(format!("{}: {}", raw, e)))?;
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(SubmitError::InvalidSource(format!(
                    "{}: only http(s) URLs can be fetched",
                    raw
                )));
            }
            Ok(())
        }
        SourceRef::File(path) => check_file(path).await,
    }
}

async fn check_file(path: &Path) -> Result<(), SubmitError> {
    let invalid = |why: &str| SubmitError::InvalidSource(format!("{}: {}", path.display(), why));
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| invalid(&e.to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file"));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| invalid(&e.to_string()))?;
    Ok(())
}

async fn cancel_remote<C: RemoteConversionClient + ?Sized>(client: &C, id: &JobId, limit: Duration) {
    match tokio::time::timeout(limit, client.cancel(id)).await {
        Ok(Ok(())) => info!("job: remote cancel acknowledged for {}", id),
        Ok(Err(e)) => warn!("job: remote cancel for {} failed: {}", id, e),
        Err(_) => warn!("job: remote cancel for {} timed out", id),
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

enum Attempt<T> {
    Done(T),
    /// The service answered with an error payload.
    Rejected(String),
    /// Retry budget used up; carries the last error.
    Exhausted(String),
    Cancelled,
}

struct Driver<C: RemoteConversionClient> {
    client: Arc<C>,
    policy: PollPolicy,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    token: CancellationToken,
}

impl<C: RemoteConversionClient> Driver<C> {
    async fn run(self, request: ConversionRequest) {
        let client = self.client.as_ref();
        let req = &request;
        let id = match self.attempt("create", move || client.create(req)).await {
            Attempt::Done(id) => id,
            other => return self.finish(other).await,
        };

        {
            let mut shared = self.shared.lock().await;
            if !self.owns(&shared) {
                drop(shared);
                // Cancelled while the create was in flight: the service knows
                // about a job nobody is waiting for any more.
                cancel_remote(client, &id, self.policy.poll_timeout).await;
                return;
            }
            shared.job.id = Some(id.clone());
            shared.job.updated_at = chrono::Utc::now();
        }
        info!("job: #{} accepted as {}", self.generation, id);

        let mut tracker = ProgressTracker::new();
        let job_id = &id;
        loop {
            let status = match self.attempt("status", move || client.status(job_id)).await {
                Attempt::Done(status) => status,
                other => return self.finish(other).await,
            };
            if self.apply_status(&mut tracker, status).await {
                return;
            }
            if !self.wait(self.policy.poll_interval).await {
                return;
            }
        }
    }

    /// True while this driver's result still matters.
    fn owns(&self, shared: &Shared) -> bool {
        shared.generation == self.generation && !self.token.is_cancelled()
    }

    /// Run `call` with per-attempt timeout and exponential backoff.
    async fn attempt<T, F, Fut>(&self, what: &str, mut call: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut failures = 0u32;
        let mut backoff = self.policy.retry_backoff;
        loop {
            if self.token.is_cancelled() {
                return Attempt::Cancelled;
            }
            let err = match tokio::time::timeout(self.policy.poll_timeout, call()).await {
                Ok(Ok(value)) => return Attempt::Done(value),
                Ok(Err(ClientError::Rejected(msg))) => return Attempt::Rejected(msg),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("{} timed out after {:?}", what, self.policy.poll_timeout),
            };
            failures += 1;
            if failures >= self.policy.retry_budget.max(1) {
                return Attempt::Exhausted(format!(
                    "{} failed {} times in a row, last error: {}",
                    what, failures, err
                ));
            }
            warn!(
                "job: {} attempt {}/{} failed: {} (retrying in {:?})",
                what, failures, self.policy.retry_budget, err, backoff
            );
            if !self.wait(backoff).await {
                return Attempt::Cancelled;
            }
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }

    /// Sleep unless cancelled first.  Returns `false` when cancelled.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Fold one status fetch into the job.  Returns `true` when the driver
    /// should stop (terminal state reached, or the result is stale).
    async fn apply_status(&self, tracker: &mut ProgressTracker, status: RemoteStatus) -> bool {
        let mut shared = self.shared.lock().await;
        if !self.owns(&shared) {
            debug!("job: dropping late status {:?}", status.raw_status);
            return true;
        }
        debug!("job: status {:?}", status.raw_status);
        shared.job.last_raw_status = Some(status.raw_status.clone());

        if progress::is_failure(&status.raw_status) {
            error!("job: service reported failure: {}", status.raw_status);
            shared.transition(JobState::Failed {
                kind: FailureKind::Remote,
                message: status.raw_status,
            });
            return true;
        }

        let reading = tracker.observe(&status.raw_status);
        if reading.is_complete() {
            let next = match status.audio_url {
                Some(audio_url) => {
                    info!("job: completed, audio at {}", audio_url);
                    JobState::Completed { audio_url }
                }
                None => {
                    error!("job: completion reported without an audio URL");
                    JobState::Failed {
                        kind: FailureKind::MalformedResponse,
                        message: "the service reported completion without an audio URL"
                            .to_string(),
                    }
                }
            };
            shared.transition(next);
            return true;
        }

        let next = JobState::InProgress {
            phase: reading.phase,
            progress: reading.progress,
            eta: reading.eta,
        };
        if shared.job.state != next {
            shared.transition(next);
        }
        false
    }

    async fn finish<T>(&self, outcome: Attempt<T>) {
        let next = match outcome {
            Attempt::Done(_) | Attempt::Cancelled => return,
            Attempt::Rejected(message) => {
                error!("job: rejected by service: {}", message);
                JobState::Failed {
                    kind: FailureKind::Remote,
                    message,
                }
            }
            Attempt::Exhausted(message) => {
                error!("job: giving up: {}", message);
                JobState::Failed {
                    kind: FailureKind::Unreachable,
                    message,
                }
            }
        };
        let mut shared = self.shared.lock().await;
        if self.owns(&shared) {
            shared.transition(next);
        }
    }
}
