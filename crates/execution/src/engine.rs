//! The execution engine - drives each envelope to exactly one result.
//!
//! ```text
//! Queued → SlotAcquired → Running → {Succeeded, Failed, TimedOut, Cancelled}
//! ```
//!
//! Every analyzer attempt runs in its own tokio task, so a panic surfaces as
//! a `JoinError` instead of taking the engine down. The run deadline is
//! enforced from outside the analyzer: the token is signalled first, then the
//! task is aborted once the grace period is over.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use triage_analyzers::{
    AnalysisInput, AnalyzerError, AnalyzerOutput, AnalyzerRegistry, PreparedAnalyzer, Progress,
    ProgressReceiver, RegistryError,
};
use triage_core::{
    AnalyzerResult, ArtifactRef, ErrorKind, PendingArtifact, ResultStatus, TaskEnvelope, TaskId,
    TaskState, Time,
};
use triage_storage::{ArtifactStore, ResultStore, StorageError};

use crate::aggregator::{Aggregator, TaskReport};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchError, EnvelopeSource, ReportSink};
use crate::governor::{ResourceGovernor, SlotGuard};

/// Why an envelope was refused.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Unknown analyzer or invalid options
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Nothing to analyze
    #[error("envelope has no input artifacts")]
    NoInputs,

    /// The result store could not be checked for an earlier result
    #[error("cannot look up earlier result: {0}")]
    Store(#[from] StorageError),
}

impl AdmissionError {
    /// Error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::Store(_) => ErrorKind::Internal,
            AdmissionError::Registry(_) | AdmissionError::NoInputs => ErrorKind::Input,
        }
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The task ended without publishing a result
    #[error("task {0} ended without a result")]
    Lost(TaskId),

    /// Source or sink failure in the dispatch loop
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Handle to a submitted envelope.
///
/// Clones observe the same execution.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    state: watch::Receiver<TaskState>,
    outcome: watch::Receiver<Option<AnalyzerResult>>,
    progress: ProgressReceiver,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Handle for a result committed earlier.
    fn completed(result: AnalyzerResult) -> Self {
        let (_, state) = watch::channel(result.status.terminal_state());
        let id = result.task_id;
        let (_, outcome) = watch::channel(Some(result));
        let (_, progress) = Progress::channel();
        Self {
            id,
            state,
            outcome,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Latest progress report of the running analyzer.
    pub fn progress(&self) -> Option<serde_json::Value> {
        self.progress.borrow().clone()
    }

    /// Receiver for progress reports.
    pub fn subscribe_progress(&self) -> ProgressReceiver {
        self.progress.clone()
    }

    /// Request cancellation. No effect once the task is terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the committed result.
    pub async fn wait(&self) -> Result<AnalyzerResult, EngineError> {
        let mut outcome = self.outcome.clone();
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Lost(self.id))?
            .clone();
        result.ok_or(EngineError::Lost(self.id))
    }
}

/// Counters of one dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Envelopes read from the source
    pub received: u64,
    /// Envelopes refused at admission
    pub rejected: u64,
    /// Lines the source could not decode
    pub malformed: u64,
    /// Reports delivered for executed envelopes
    pub completed: u64,
    /// Tasks that ended without a result
    pub lost: u64,
}

struct Inner {
    registry: AnalyzerRegistry,
    artifacts: Arc<dyn ArtifactStore>,
    results: Arc<dyn ResultStore>,
    governor: ResourceGovernor,
    aggregator: Aggregator,
    config: EngineConfig,
    inflight: Mutex<HashMap<TaskId, TaskHandle>>,
}

impl Inner {
    fn inflight(&self) -> MutexGuard<'_, HashMap<TaskId, TaskHandle>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The execution engine.
///
/// Cheap to clone; clones share registry, stores and slot pools.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine.
    pub fn new(
        registry: AnalyzerRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        results: Arc<dyn ResultStore>,
        config: EngineConfig,
    ) -> Self {
        let governor = ResourceGovernor::new(config.governor.clone());
        let aggregator = Aggregator::new(config.summary.clone());
        Self {
            inner: Arc::new(Inner {
                registry,
                artifacts,
                results,
                governor,
                aggregator,
                config,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the analyzer registry.
    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.inner.registry
    }

    /// Get the slot governor.
    pub fn governor(&self) -> &ResourceGovernor {
        &self.inner.governor
    }

    /// Get the aggregator.
    pub fn aggregator(&self) -> &Aggregator {
        &self.inner.aggregator
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Check an envelope against the registry without running it.
    pub fn admit(&self, envelope: &TaskEnvelope) -> Result<PreparedAnalyzer, AdmissionError> {
        if envelope.inputs().is_empty() {
            return Err(AdmissionError::NoInputs);
        }
        Ok(self
            .inner
            .registry
            .prepare(envelope.analyzer(), envelope.options())?)
    }

    /// Admit an envelope and start executing it.
    ///
    /// Delivering the same envelope id again never runs it twice: a task
    /// still in flight returns its existing handle, a finished one a handle
    /// resolving to the stored result.
    pub async fn submit(&self, envelope: TaskEnvelope) -> Result<TaskHandle, AdmissionError> {
        let id = envelope.id();

        if let Some(handle) = self.handle(id) {
            info!(task_id = %id, "duplicate envelope joins running task");
            return Ok(handle);
        }
        if let Some(result) = self.inner.results.get(id).await? {
            info!(task_id = %id, status = %result.status, "duplicate envelope, returning stored result");
            return Ok(TaskHandle::completed(result));
        }

        let prepared = self.admit(&envelope)?;

        let (state_tx, state_rx) = watch::channel(TaskState::Queued);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (progress, progress_rx) = Progress::channel();
        let cancel = CancellationToken::new();
        let handle = TaskHandle {
            id,
            state: state_rx,
            outcome: outcome_rx,
            progress: progress_rx,
            cancel: cancel.clone(),
        };

        {
            let mut inflight = self.inner.inflight();
            if let Some(existing) = inflight.get(&id) {
                return Ok(existing.clone());
            }
            inflight.insert(id, handle.clone());
        }

        let span = info_span!(
            "task",
            task_id = %id,
            analyzer = %envelope.analyzer(),
            class = %prepared.descriptor.class,
        );
        let run = TaskRun {
            inner: self.inner.clone(),
            envelope,
            prepared,
            state: state_tx,
            progress,
            cancel,
            attempts: 0,
            started_at: None,
        };
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let result = run.execute().await;
                outcome_tx.send_replace(Some(result));
                inner.inflight().remove(&id);
            }
            .instrument(span),
        );

        Ok(handle)
    }

    /// Handle of a task still in flight.
    pub fn handle(&self, id: TaskId) -> Option<TaskHandle> {
        self.inner.inflight().get(&id).cloned()
    }

    /// Request cancellation of a task in flight. Returns whether it was found.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.handle(id) {
            Some(handle) => {
                info!(task_id = %id, "cancellation requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Summarise a terminal result.
    pub fn report(&self, result: AnalyzerResult) -> TaskReport {
        self.inner.aggregator.report(result)
    }

    /// Submit one envelope and wait for its report. Admission failures come
    /// back as rejected reports.
    pub async fn process(&self, envelope: TaskEnvelope) -> Result<TaskReport, EngineError> {
        let id = envelope.id();
        let analyzer = envelope.analyzer().to_string();
        match self.submit(envelope).await {
            Ok(handle) => Ok(self.report(handle.wait().await?)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "envelope rejected");
                Ok(self.inner.aggregator.rejected(id, &analyzer, e.kind(), &e))
            }
        }
    }

    /// Dispatch loop: execute envelopes from `source` concurrently and send
    /// each report to `sink` as soon as it is ready.
    ///
    /// Returns once the source is exhausted and every task has reported.
    pub async fn run<S, K>(&self, mut source: S, sink: &mut K) -> Result<RunStats, EngineError>
    where
        S: EnvelopeSource,
        K: ReportSink + ?Sized,
    {
        let mut running: JoinSet<Result<AnalyzerResult, EngineError>> = JoinSet::new();
        let mut stats = RunStats::default();
        let mut open = true;

        loop {
            tokio::select! {
                next = source.next(), if open => match next {
                    Ok(Some(envelope)) => {
                        stats.received += 1;
                        let id = envelope.id();
                        let analyzer = envelope.analyzer().to_string();
                        match self.submit(envelope).await {
                            Ok(handle) => {
                                running.spawn(async move { handle.wait().await });
                            }
                            Err(e) => {
                                warn!(task_id = %id, error = %e, "envelope rejected");
                                stats.rejected += 1;
                                sink.send(self.inner.aggregator.rejected(id, &analyzer, e.kind(), &e))
                                    .await?;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("envelope source exhausted");
                        open = false;
                    }
                    Err(DispatchError::Malformed { line, message }) => {
                        warn!(line, %message, "skipping malformed envelope");
                        stats.malformed += 1;
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                    Ok(Ok(result)) => {
                        stats.completed += 1;
                        sink.send(self.report(result)).await?;
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "task lost");
                        stats.lost += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "report waiter failed");
                        stats.lost += 1;
                    }
                },
                else => break,
            }
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            rejected = stats.rejected,
            malformed = stats.malformed,
            "dispatch loop finished"
        );
        Ok(stats)
    }
}

enum Attempt {
    /// Terminal outcome
    Finished(AnalyzerResult),
    /// Analyzer error, possibly retryable
    Failed(AnalyzerError),
}

/// One envelope's way through the state machine.
struct TaskRun {
    inner: Arc<Inner>,
    envelope: TaskEnvelope,
    prepared: PreparedAnalyzer,
    state: watch::Sender<TaskState>,
    progress: Progress,
    cancel: CancellationToken,
    attempts: u32,
    started_at: Option<Time>,
}

impl TaskRun {
    async fn execute(mut self) -> AnalyzerResult {
        info!(priority = self.envelope.priority(), "task queued");
        let result = self.drive().await;
        self.commit(result).await
    }

    async fn drive(&mut self) -> AnalyzerResult {
        let class = self.prepared.descriptor.class.clone();
        let guard = match self.acquire_slot(&class).await {
            Ok(guard) => guard,
            Err(result) => return result,
        };
        self.advance(TaskState::SlotAcquired);

        if self.cancel.is_cancelled() {
            return self.errored(ErrorKind::Cancelled, "cancelled before the analyzer started");
        }

        let inputs = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return self.errored(ErrorKind::Cancelled, "cancelled while resolving inputs");
            }
            resolved = self.resolve_inputs() => match resolved {
                Ok(inputs) => inputs,
                Err(result) => return result,
            },
        };
        if self.cancel.is_cancelled() {
            return self.errored(ErrorKind::Cancelled, "cancelled before the analyzer started");
        }

        self.advance(TaskState::Running);
        self.started_at = Some(Utc::now());
        let deadline = self
            .envelope
            .deadline()
            .unwrap_or_else(|| self.inner.config.deadline_for(&class));
        let result = self.run_with_retries(inputs, deadline).await;

        drop(guard);
        result
    }

    async fn acquire_slot(&self, class: &str) -> Result<SlotGuard, AnalyzerResult> {
        let acquire = self.inner.governor.acquire(class, self.envelope.priority());
        let limit = self.inner.config.queue_timeout();
        let waited = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| limit),
                None => Ok(acquire.await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(self.errored(ErrorKind::Cancelled, "cancelled while waiting for a slot"))
            }
            waited = waited => match waited {
                Ok(Ok(guard)) => Ok(guard),
                Ok(Err(e)) => {
                    error!(error = %e, "slot acquisition failed");
                    Err(self.errored(ErrorKind::Internal, e))
                }
                Err(limit) => {
                    warn!(?limit, "gave up waiting for slot");
                    Err(self.errored(
                        ErrorKind::Timeout,
                        format!("waiting for slot exceeded {:?}", limit),
                    ))
                }
            },
        }
    }

    async fn resolve_inputs(&self) -> Result<Vec<ArtifactRef>, AnalyzerResult> {
        let mut resolved = Vec::with_capacity(self.envelope.inputs().len());
        for artifact in self.envelope.inputs() {
            match self.inner.artifacts.resolve(artifact).await {
                Ok(artifact) => resolved.push(artifact),
                Err(e) => {
                    warn!(artifact = %artifact.name(), error = %e, "cannot resolve input");
                    return Err(self.errored(
                        ErrorKind::Input,
                        format!("cannot resolve input {}: {}", artifact.name(), e),
                    ));
                }
            }
        }
        Ok(resolved)
    }

    async fn run_with_retries(&mut self, inputs: Vec<ArtifactRef>, deadline: Duration) -> AnalyzerResult {
        let deadline_at = Instant::now()
            .checked_add(deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        let policy = self.inner.config.retry;

        loop {
            self.attempts += 1;
            let attempt = self.attempts;
            debug!(attempt, "invoking analyzer");

            let input = AnalysisInput {
                task_id: self.envelope.id(),
                artifacts: inputs.clone(),
                options: self.prepared.options.clone(),
                attempt,
                progress: self.progress.clone(),
            };
            let error = match self.attempt(input, deadline_at, deadline).await {
                Attempt::Finished(result) => return result,
                Attempt::Failed(error) => error,
            };

            let kind = error.kind();
            if !policy.should_retry(kind, attempt) {
                return self.exhausted(&error);
            }

            let delay = policy.backoff(attempt - 1);
            warn!(attempt, error = %error, ?delay, "transient failure, retrying");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.errored(ErrorKind::Cancelled, "cancelled while waiting to retry");
                }
                _ = tokio::time::sleep_until(deadline_at) => {
                    return self.errored(
                        ErrorKind::Timeout,
                        format!("deadline of {:?} exceeded while waiting to retry ({})", deadline, error),
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, input: AnalysisInput, deadline_at: Instant, deadline: Duration) -> Attempt {
        let analyzer = self.prepared.analyzer.clone();
        let token = self.cancel.child_token();
        let run_token = token.clone();
        let mut task = tokio::spawn(
            async move { analyzer.run(&input, &run_token).await }.in_current_span(),
        );
        let grace = self.inner.config.grace_period();

        tokio::select! {
            joined = &mut task => self.settle(joined).await,
            _ = tokio::time::sleep_until(deadline_at) => {
                token.cancel();
                let observed = stop(task, grace).await;
                warn!(?deadline, observed, "deadline exceeded");
                let message = if observed {
                    format!("exceeded deadline of {:?}", deadline)
                } else {
                    format!(
                        "exceeded deadline of {:?}; terminated after {:?} grace period",
                        deadline, grace
                    )
                };
                Attempt::Finished(self.errored(ErrorKind::Timeout, message))
            }
            _ = self.cancel.cancelled() => {
                if stop(task, grace).await {
                    Attempt::Finished(self.errored(ErrorKind::Cancelled, "cancelled while running"))
                } else {
                    error!(?grace, "analyzer did not observe cancellation");
                    Attempt::Finished(
                        self.errored(
                            ErrorKind::Cancelled,
                            format!("analyzer did not observe cancellation within {:?}; terminated", grace),
                        )
                        .with_status(ResultStatus::Failure),
                    )
                }
            }
        }
    }

    async fn settle(&self, joined: Result<Result<AnalyzerOutput, AnalyzerError>, JoinError>) -> Attempt {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e);
                error!(panic = %message, "analyzer panicked");
                return Attempt::Finished(
                    self.errored(ErrorKind::Internal, format!("analyzer panicked: {}", message)),
                );
            }
            Err(e) => {
                return Attempt::Finished(
                    self.errored(ErrorKind::Internal, format!("analyzer task failed: {}", e)),
                );
            }
        };

        if self.cancel.is_cancelled() {
            return Attempt::Finished(self.errored(ErrorKind::Cancelled, "cancelled while running"));
        }

        match outcome {
            Ok(output) => {
                let artifacts = match self.commit_outputs(&output.artifacts).await {
                    Ok(artifacts) => artifacts,
                    Err(message) => return Attempt::Failed(AnalyzerError::Transient(message)),
                };
                Attempt::Finished(AnalyzerResult::completed(
                    self.envelope.id(),
                    self.envelope.analyzer(),
                    output.findings,
                    artifacts,
                    &output.warnings,
                ))
            }
            Err(AnalyzerError::Cancelled) => {
                error!("analyzer reported cancellation nobody requested");
                Attempt::Finished(self.errored(
                    ErrorKind::Internal,
                    "analyzer reported cancellation nobody requested",
                ))
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    /// Store all output artifacts or none of them.
    async fn commit_outputs(&self, pending: &[PendingArtifact]) -> Result<Vec<ArtifactRef>, String> {
        let mut stored = Vec::with_capacity(pending.len());
        for artifact in pending {
            match self.inner.artifacts.store(self.envelope.id(), artifact).await {
                Ok(stored_ref) => stored.push(stored_ref),
                Err(e) => {
                    warn!(artifact = %artifact.name, error = %e, "output commit failed, rolling back");
                    self.discard(&stored).await;
                    return Err(format!("cannot commit output artifact {}: {}", artifact.name, e));
                }
            }
        }
        Ok(stored)
    }

    async fn discard(&self, artifacts: &[ArtifactRef]) {
        for artifact in artifacts {
            if let Err(e) = self.inner.artifacts.discard(artifact).await {
                error!(artifact = %artifact.name(), error = %e, "cannot discard output artifact");
            }
        }
    }

    async fn commit(&self, result: AnalyzerResult) -> AnalyzerResult {
        let result = result
            .with_attempts(self.attempts)
            .with_started_at(self.started_at);

        let result = match self.inner.results.commit(result.clone()).await {
            Ok(outcome) => {
                if !outcome.is_new() {
                    info!("result was already committed, keeping the stored one");
                    let stored = outcome.into_result();
                    let orphaned: Vec<_> = result
                        .artifacts
                        .iter()
                        .filter(|a| !stored.artifacts.contains(a))
                        .cloned()
                        .collect();
                    self.discard(&orphaned).await;
                    stored
                } else {
                    outcome.into_result()
                }
            }
            Err(e) => {
                error!(error = %e, "cannot store result");
                self.discard(&result.artifacts).await;
                self.errored(ErrorKind::Internal, format!("cannot store result: {}", e))
                    .with_attempts(self.attempts)
                    .with_started_at(self.started_at)
            }
        };

        self.advance(result.status.terminal_state());
        info!(
            status = %result.status,
            attempts = result.attempts,
            findings = result.findings.len(),
            "task finished"
        );
        result
    }

    fn advance(&self, next: TaskState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            error!(from = %current, to = %next, "illegal state transition ignored");
            return;
        }
        self.state.send_replace(next);
        debug!(state = %next, "state changed");
    }

    fn errored(&self, kind: ErrorKind, message: impl std::fmt::Display) -> AnalyzerResult {
        AnalyzerResult::errored(self.envelope.id(), self.envelope.analyzer(), kind, message)
    }

    /// Result for an error that will not be retried.
    fn exhausted(&self, error: &AnalyzerError) -> AnalyzerResult {
        let kind = error.kind();
        let mut result = self.errored(kind, error);
        if kind == ErrorKind::Transient {
            result.diagnostic = format!("{} (after {} attempts): {}", kind.label(), self.attempts, error);
        }
        result
    }
}

/// Wait up to `grace` for a signalled task, then abort it. Returns whether
/// it stopped on its own.
async fn stop<T>(mut task: JoinHandle<T>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(_) => true,
        Err(_) => {
            task.abort();
            false
        }
    }
}

fn panic_message(e: JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use triage_analyzers::{Analyzer, AnalyzerDescriptor};
    use triage_storage::{FsArtifactStore, MemoryResultStore};

    /// Fails transiently a fixed number of times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn descriptor(&self) -> AnalyzerDescriptor {
            AnalyzerDescriptor {
                name: "flaky".into(),
                class: "test".into(),
                description: String::new(),
                options: Vec::new(),
                deterministic: true,
            }
        }

        async fn run(
            &self,
            input: &AnalysisInput,
            _cancel: &CancellationToken,
        ) -> Result<AnalyzerOutput, AnalyzerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call, input.attempt);
            if call <= self.failures {
                Err(AnalyzerError::Transient(format!("flake {}", call)))
            } else {
                Ok(AnalyzerOutput {
                    artifacts: vec![PendingArtifact::new("out.txt", b"done".to_vec())],
                    ..Default::default()
                })
            }
        }
    }

    async fn engine_with(analyzer: Arc<dyn Analyzer>, dir: &tempfile::TempDir) -> Engine {
        let mut registry = AnalyzerRegistry::new();
        registry.register(analyzer).unwrap();
        let artifacts = FsArtifactStore::new(dir.path().join("out")).await.unwrap();
        let config = EngineConfig::default().with_retry(
            crate::retry::RetryPolicy::default()
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        );
        Engine::new(registry, Arc::new(artifacts), Arc::new(MemoryResultStore::new()), config)
    }

    fn envelope(dir: &tempfile::TempDir, analyzer: &str) -> TaskEnvelope {
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"payload").unwrap();
        TaskEnvelope::builder(analyzer)
            .input(ArtifactRef::from_path(&path).unwrap())
            .build()
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky { failures: 2, calls: AtomicU32::new(0) });
        let engine = engine_with(flaky.clone(), &dir).await;

        let handle = engine.submit(envelope(&dir, "flaky")).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.started_at.is_some());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state(), TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky { failures: 10, calls: AtomicU32::new(0) });
        let engine = engine_with(flaky.clone(), &dir).await;

        let result = engine.submit(envelope(&dir, "flaky")).await.unwrap().wait().await.unwrap();

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.error_kind, Some(ErrorKind::Transient));
        assert_eq!(result.attempts, 4);
        assert_eq!(result.diagnostic, "transient error (after 4 attempts): flake 4");
    }

    #[tokio::test]
    async fn test_admission_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) }), &dir).await;

        let unknown = engine.submit(envelope(&dir, "nope")).await.err().unwrap();
        assert!(matches!(unknown, AdmissionError::Registry(RegistryError::UnknownAnalyzer(_))));
        assert_eq!(unknown.kind(), ErrorKind::Input);

        let bad_option = TaskEnvelope::builder("flaky")
            .inputs(envelope(&dir, "flaky").inputs().to_vec())
            .option("colour", "blue")
            .build();
        let err = engine.submit(bad_option).await.err().unwrap();
        assert!(matches!(err, AdmissionError::Registry(RegistryError::InvalidOptions(_))));

        let empty = TaskEnvelope::builder("flaky").build();
        assert!(matches!(engine.submit(empty).await.err().unwrap(), AdmissionError::NoInputs));
    }

    #[tokio::test]
    async fn test_missing_input_is_input_failure() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let engine = engine_with(flaky.clone(), &dir).await;

        let envelope = TaskEnvelope::builder("flaky")
            .input(ArtifactRef::new("gone", dir.path().join("gone"), 3, ""))
            .build();
        let result = engine.submit(envelope).await.unwrap().wait().await.unwrap();

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.error_kind, Some(ErrorKind::Input));
        assert!(result.diagnostic.starts_with("input error: cannot resolve input gone"));
        assert_eq!(result.attempts, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_reports_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) }), &dir).await;

        let report = engine.process(envelope(&dir, "nope")).await.unwrap();
        assert!(report.rejected);
        assert_eq!(report.result.diagnostic, "input error: unknown analyzer 'nope'");
    }

    #[tokio::test]
    async fn test_panic_message() {
        let err = tokio::spawn(async { panic!("boom {}", 7) }).await.unwrap_err();
        assert_eq!(panic_message(err), "boom 7");

        let err = tokio::spawn(async { panic!("static") }).await.unwrap_err();
        assert_eq!(panic_message(err), "static");
    }
}
