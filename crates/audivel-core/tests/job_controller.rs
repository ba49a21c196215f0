//! Job controller behaviour against a scripted in-memory conversion service.
//!
//! All tests run on a paused clock, so poll intervals, backoff and timeouts
//! elapse instantly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use audivel_core::{
    ClientError, ConversionRequest, FailureKind, JobController, JobId, JobState, Phase,
    PollPolicy, RemoteConversionClient, RemoteStatus, SourceRef, SubmitError, SynthesisStyle,
    VoiceId,
};
use futures_util::StreamExt;
use tokio::sync::Notify;

const AUDIO_URL: &str = "https://cdn.example.com/narration.wav";

#[derive(Default)]
struct Calls {
    create: AtomicUsize,
    status: AtomicUsize,
    cancel: AtomicUsize,
}

/// Replays queued responses; once the queue is empty it keeps answering
/// "generating".
struct FakeClient {
    create: Mutex<VecDeque<Result<JobId, ClientError>>>,
    statuses: Mutex<VecDeque<Result<RemoteStatus, ClientError>>>,
    /// When set, every status call waits for a permit first.
    gate: Option<Arc<Notify>>,
    credentials: bool,
    calls: Arc<Calls>,
}

impl FakeClient {
    fn new(statuses: Vec<Result<RemoteStatus, ClientError>>) -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let client = Self {
            create: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(statuses.into()),
            gate: None,
            credentials: true,
            calls: Arc::clone(&calls),
        };
        (client, calls)
    }

    fn with_create(self, responses: Vec<Result<JobId, ClientError>>) -> Self {
        *self.create.lock().unwrap() = responses.into();
        self
    }

    fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl RemoteConversionClient for FakeClient {
    async fn create(&self, _request: &ConversionRequest) -> Result<JobId, ClientError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        let next = self.create.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(JobId("job-1".into())))
    }

    async fn status(&self, _id: &JobId) -> Result<RemoteStatus, ClientError> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.statuses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(RemoteStatus::new("generating")))
    }

    async fn cancel(&self, _id: &JobId) -> Result<(), ClientError> {
        self.calls.cancel.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::Transport("connection reset".into()))
    }

    fn has_credentials(&self) -> bool {
        self.credentials
    }
}

fn ok(raw: &str) -> Result<RemoteStatus, ClientError> {
    Ok(RemoteStatus::new(raw))
}

fn request() -> ConversionRequest {
    ConversionRequest::new(
        SourceRef::Url("https://example.com/paper.pdf".into()),
        VoiceId::angelo(),
        VoiceId::nia(),
        SynthesisStyle::Podcast,
    )
}

fn policy() -> PollPolicy {
    PollPolicy {
        poll_interval: Duration::from_secs(5),
        poll_timeout: Duration::from_secs(10),
        retry_budget: 5,
        retry_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(4),
    }
}

fn in_progress(state: &JobState) -> Option<(Phase, f64)> {
    match state {
        JobState::InProgress {
            phase, progress, ..
        } => Some((*phase, *progress)),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_state_sequence() {
    let (client, calls) = FakeClient::new(vec![
        ok("processing"),
        ok("generating"),
        ok("finalizing"),
        Ok(RemoteStatus::new("complete").with_audio_url(AUDIO_URL)),
    ]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;

    controller.submit(request()).await.unwrap();
    let states: Vec<JobState> = stream.collect().await;

    assert_eq!(states.len(), 5, "states: {:?}", states);
    assert_eq!(states[0], JobState::Submitting);
    assert_eq!(
        states[1],
        JobState::InProgress {
            phase: Phase::Processing,
            progress: 0.30,
            eta: Some(Duration::from_secs(240)),
        }
    );
    assert_eq!(in_progress(&states[2]), Some((Phase::Generating, 0.60)));
    assert_eq!(in_progress(&states[3]), Some((Phase::Finalizing, 0.90)));
    assert_eq!(
        states[4],
        JobState::Completed {
            audio_url: AUDIO_URL.into()
        }
    );
    assert_eq!(calls.status.load(Ordering::SeqCst), 4);

    let job = controller.job().await;
    assert_eq!(job.id, Some(JobId("job-1".into())));
    assert_eq!(job.last_raw_status.as_deref(), Some("complete"));
}

#[tokio::test(start_paused = true)]
async fn test_progress_never_regresses_and_repeats_are_not_reemitted() {
    let (client, _) = FakeClient::new(vec![
        ok("processing"),
        ok("processing"),
        ok("generating"),
        ok("processing"),
        ok("queue hiccup"),
        ok("finalizing"),
        Ok(RemoteStatus::new("completed").with_audio_url(AUDIO_URL)),
    ]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let progress: Vec<f64> = stream
        .filter_map(|s| async move { in_progress(&s).map(|(_, p)| p) })
        .collect()
        .await;
    assert_eq!(progress, vec![0.30, 0.60, 0.90]);
}

#[tokio::test(start_paused = true)]
async fn test_submit_while_running_is_rejected() {
    let (client, calls) = FakeClient::new(vec![ok("processing")]);
    let controller = JobController::with_policy(client, policy());
    let mut stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    assert_eq!(stream.recv().await, Some(JobState::Submitting));
    let running = stream.recv().await.unwrap();
    assert_eq!(in_progress(&running), Some((Phase::Processing, 0.30)));

    let err = controller.submit(request()).await.err();
    assert_eq!(err, Some(SubmitError::AlreadyRunning));
    assert_eq!(controller.state().await, running);
    assert_eq!(calls.create.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent() {
    let (client, calls) = FakeClient::new(vec![ok("processing")]);
    let controller = JobController::with_policy(client, policy());
    let mut stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();
    stream.recv().await;
    stream.recv().await;

    // Remote cancel fails in this fake; the local transition still happens.
    assert!(controller.cancel().await);
    assert_eq!(controller.state().await, JobState::Cancelled);
    assert!(!controller.cancel().await);
    assert_eq!(controller.state().await, JobState::Cancelled);
    assert_eq!(calls.cancel.load(Ordering::SeqCst), 1);

    assert_eq!(stream.recv().await, Some(JobState::Cancelled));
    assert_eq!(stream.recv().await, None);
    assert!(controller.job().await.cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_job_is_noop() {
    let (client, calls) = FakeClient::new(vec![]);
    let controller = JobController::with_policy(client, policy());
    assert!(!controller.cancel().await);
    assert_eq!(controller.state().await, JobState::Idle);
    assert_eq!(calls.cancel.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_status_after_cancel_is_discarded() {
    let gate = Arc::new(Notify::new());
    let (client, calls) = FakeClient::new(vec![ok("generating")]);
    let client = client.with_gate(Arc::clone(&gate));
    let controller = JobController::with_policy(client, policy());
    let mut stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();
    assert_eq!(stream.recv().await, Some(JobState::Submitting));

    // Wait until the first status call is parked on the gate.
    while calls.status.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(controller.cancel().await);

    // Release the in-flight response; it must not resurrect InProgress.
    gate.notify_one();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(controller.state().await, JobState::Cancelled);
    assert_eq!(stream.recv().await, Some(JobState::Cancelled));
    assert_eq!(stream.recv().await, None);
    assert_eq!(calls.status.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_fails_unreachable() {
    let failures = (0..10)
        .map(|_| Err(ClientError::Transport("503 Service Unavailable".into())))
        .collect();
    let (client, calls) = FakeClient::new(failures);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let states: Vec<JobState> = stream.collect().await;
    assert_eq!(states.len(), 2);
    assert_eq!(states[0], JobState::Submitting);
    match &states[1] {
        JobState::Failed { kind, message } => {
            assert_eq!(*kind, FailureKind::Unreachable);
            assert!(message.contains("503"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(calls.status.load(Ordering::SeqCst), 5);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(calls.status.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let (client, calls) = FakeClient::new(vec![
        Err(ClientError::Transport("timeout".into())),
        Err(ClientError::Transport("timeout".into())),
        ok("processing"),
        Err(ClientError::Transport("reset".into())),
        Err(ClientError::Transport("reset".into())),
        Err(ClientError::Transport("reset".into())),
        Err(ClientError::Transport("reset".into())),
        Ok(RemoteStatus::new("complete").with_audio_url(AUDIO_URL)),
    ]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let last = stream.collect::<Vec<_>>().await.pop();
    assert_eq!(
        last,
        Some(JobState::Completed {
            audio_url: AUDIO_URL.into()
        })
    );
    assert_eq!(calls.status.load(Ordering::SeqCst), 8);
}

#[tokio::test(start_paused = true)]
async fn test_status_timeouts_count_against_budget() {
    // The gate is never opened, so every status call hangs until it times out.
    let gate = Arc::new(Notify::new());
    let (client, calls) = FakeClient::new(vec![]);
    let controller = JobController::with_policy(client.with_gate(gate), policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let last = stream.collect::<Vec<_>>().await.pop();
    assert!(matches!(
        last,
        Some(JobState::Failed {
            kind: FailureKind::Unreachable,
            ..
        })
    ));
    assert_eq!(calls.status.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_completion_without_audio_url_is_malformed() {
    let (client, _) = FakeClient::new(vec![ok("generating"), ok("complete")]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let last = stream.collect::<Vec<_>>().await.pop();
    assert!(matches!(
        last,
        Some(JobState::Failed {
            kind: FailureKind::MalformedResponse,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_status() {
    let (client, _) = FakeClient::new(vec![ok("processing"), ok("failed")]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let last = stream.collect::<Vec<_>>().await.pop();
    assert_eq!(
        last,
        Some(JobState::Failed {
            kind: FailureKind::Remote,
            message: "failed".into()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_create_rejected_by_service() {
    let (client, calls) = FakeClient::new(vec![]);
    let client = client.with_create(vec![Err(ClientError::Rejected(
        "source file is not a PDF".into(),
    ))]);
    let controller = JobController::with_policy(client, policy());
    let stream = controller.observe_state().await;
    controller.submit(request()).await.unwrap();

    let states: Vec<JobState> = stream.collect().await;
    assert_eq!(
        states,
        vec![
            JobState::Submitting,
            JobState::Failed {
                kind: FailureKind::Remote,
                message: "source file is not a PDF".into()
            }
        ]
    );
    assert_eq!(calls.status.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_validates_source_and_credentials() {
    let (client, calls) = FakeClient::new(vec![]);
    let controller = JobController::with_policy(client, policy());

    for bad in [
        SourceRef::Url("ftp://example.com/a.pdf".into()),
        SourceRef::Url("not a url".into()),
        SourceRef::File("/definitely/not/here.pdf".into()),
    ] {
        let req = ConversionRequest::new(bad, VoiceId::angelo(), VoiceId::nia(), SynthesisStyle::Debate);
        assert!(matches!(
            controller.submit(req).await,
            Err(SubmitError::InvalidSource(_))
        ));
    }
    assert_eq!(controller.state().await, JobState::Idle);

    let (mut client, _) = FakeClient::new(vec![]);
    client.credentials = false;
    let locked = JobController::with_policy(client, policy());
    assert_eq!(
        locked.submit(request()).await.err(),
        Some(SubmitError::MissingCredentials)
    );
    assert_eq!(calls.create.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_local_file_source_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paper.pdf");
    std::fs::write(&path, b"%PDF-1.7").unwrap();

    let (client, _) = FakeClient::new(vec![Ok(
        RemoteStatus::new("complete").with_audio_url(AUDIO_URL)
    )]);
    let controller = JobController::with_policy(client, policy());
    let req = ConversionRequest::new(
        SourceRef::File(path),
        VoiceId::angelo(),
        VoiceId::nia(),
        SynthesisStyle::ChildrensStory,
    );
    let stream = controller.observe_state().await;
    controller.submit(req).await.unwrap();
    assert_eq!(stream.collect::<Vec<_>>().await.len(), 2);

    // A directory is not a readable document.
    let req = ConversionRequest::new(
        SourceRef::File(dir.path().to_path_buf()),
        VoiceId::angelo(),
        VoiceId::nia(),
        SynthesisStyle::Podcast,
    );
    assert!(matches!(
        controller.submit(req).await,
        Err(SubmitError::InvalidSource(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_new_submit_replaces_finished_job() {
    let (client, calls) = FakeClient::new(vec![
        Ok(RemoteStatus::new("complete").with_audio_url(AUDIO_URL)),
        ok("processing"),
    ]);
    let client = client.with_create(vec![Ok(JobId("first".into())), Ok(JobId("second".into()))]);
    let controller = JobController::with_policy(client, policy());

    let stream = controller.observe_state().await;
    let first = controller.submit(request()).await.unwrap();
    stream.collect::<Vec<_>>().await;
    assert_eq!(first.job_id().await, Some(JobId("first".into())));

    // Taken between jobs, the subscription follows the next one.
    let mut stream = controller.observe_state().await;
    let second = controller.submit(request()).await.unwrap();
    assert_eq!(stream.recv().await, Some(JobState::Submitting));
    assert_eq!(in_progress(&stream.recv().await.unwrap()), Some((Phase::Processing, 0.30)));

    assert!(second.generation() > first.generation());
    assert_eq!(first.state().await, None);
    assert_eq!(second.job_id().await, Some(JobId("second".into())));
    assert_eq!(calls.create.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_between_jobs_sees_next_job_to_the_end() {
    let (client, _calls) = FakeClient::new(vec![
        Ok(RemoteStatus::new("complete").with_audio_url(AUDIO_URL)),
        Ok(RemoteStatus::new("complete").with_audio_url(AUDIO_URL)),
    ]);
    let client = client.with_create(vec![Ok(JobId("first".into())), Ok(JobId("second".into()))]);
    let controller = JobController::with_policy(client, policy());

    let first = controller.observe_state().await;
    controller.submit(request()).await.unwrap();
    let states = first.collect::<Vec<_>>().await;
    assert!(states.last().unwrap().is_terminal());

    let next = controller.observe_state().await;
    controller.submit(request()).await.unwrap();
    let states = next.collect::<Vec<_>>().await;
    assert_eq!(states.first(), Some(&JobState::Submitting));
    assert_eq!(
        states.last(),
        Some(&JobState::Completed {
            audio_url: AUDIO_URL.into()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_submit_cancels_remote_job() {
    let (client, calls) = FakeClient::new(vec![]);
    let controller = JobController::with_policy(client, policy());
    controller.submit(request()).await.unwrap();

    // Cancel before the driver task has had a chance to run.
    assert!(controller.cancel().await);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(controller.state().await, JobState::Cancelled);
    assert_eq!(calls.status.load(Ordering::SeqCst), 0);
    assert!(calls.cancel.load(Ordering::SeqCst) <= 1);
}
