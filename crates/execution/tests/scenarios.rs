//! End-to-end engine scenarios: slots, deadlines, cancellation, crashes,
//! duplicate delivery and the dispatch loop.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use triage_analyzers::{
    AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput, AnalyzerRegistry,
};
use triage_core::{
    AnalyzerResult, ArtifactRef, ErrorKind, Location, PendingArtifact, ResultStatus, TaskEnvelope,
    TaskId, TaskState,
};
use triage_execution::{
    ChannelSource, CollectingSink, Engine, EngineConfig, GovernorConfig, JsonLinesSink,
    JsonLinesSource, RetryPolicy,
};
use triage_storage::{
    ArtifactStore, CommitOutcome, FsArtifactStore, MemoryResultStore, ResultStore, StorageError,
};

#[derive(Clone)]
enum Behavior {
    /// Sleep, but stop when cancelled
    Sleep(Duration),
    /// Sleep without looking at the token, then produce an artifact
    Stubborn(Duration),
    /// Block until cancelled
    WaitForCancel,
    Panic,
    Fail(AnalyzerError),
    Produce(Vec<PendingArtifact>),
}

struct Scripted {
    name: String,
    class: String,
    behavior: Behavior,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Scripted {
    fn new(name: &str, class: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            class: class.to_string(),
            behavior,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Analyzer for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> AnalyzerDescriptor {
        AnalyzerDescriptor {
            name: self.name.clone(),
            class: self.class.clone(),
            description: "scripted test analyzer".to_string(),
            options: Vec::new(),
            deterministic: true,
        }
    }

    async fn run(
        &self,
        _input: &AnalysisInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        match &self.behavior {
            Behavior::Sleep(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(*d) => Ok(AnalyzerOutput::default()),
                    _ = cancel.cancelled() => Err(AnalyzerError::Cancelled),
                }
            }
            Behavior::Stubborn(d) => {
                tokio::time::sleep(*d).await;
                Ok(AnalyzerOutput {
                    artifacts: vec![PendingArtifact::new("late.bin", b"late".to_vec())],
                    ..Default::default()
                })
            }
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                Err(AnalyzerError::Cancelled)
            }
            Behavior::Panic => panic!("analyzer exploded"),
            Behavior::Fail(e) => Err(e.clone()),
            Behavior::Produce(artifacts) => Ok(AnalyzerOutput {
                artifacts: artifacts.clone(),
                ..Default::default()
            }),
        }
    }
}

/// Result store counting commit calls.
#[derive(Default)]
struct CountingStore {
    inner: MemoryResultStore,
    commits: AtomicU32,
}

#[async_trait]
impl ResultStore for CountingStore {
    async fn commit(&self, result: AnalyzerResult) -> triage_storage::Result<CommitOutcome> {
        let outcome = self.inner.commit(result).await?;
        if outcome.is_new() {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn get(&self, id: TaskId) -> triage_storage::Result<Option<AnalyzerResult>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> triage_storage::Result<Vec<AnalyzerResult>> {
        self.inner.list().await
    }
}

/// Artifact store that refuses to store one artifact name.
struct RefusingStore {
    inner: FsArtifactStore,
    refuse: String,
    discarded: AtomicU32,
}

#[async_trait]
impl ArtifactStore for RefusingStore {
    async fn resolve(&self, artifact: &ArtifactRef) -> triage_storage::Result<ArtifactRef> {
        self.inner.resolve(artifact).await
    }

    async fn store(&self, task: TaskId, artifact: &PendingArtifact) -> triage_storage::Result<ArtifactRef> {
        if artifact.name == self.refuse {
            return Err(StorageError::Other("disk full".to_string()));
        }
        self.inner.store(task, artifact).await
    }

    async fn discard(&self, artifact: &ArtifactRef) -> triage_storage::Result<()> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        self.inner.discard(artifact).await
    }
}

/// Artifact store whose input resolution is slow.
struct SlowResolveStore {
    inner: FsArtifactStore,
    delay: Duration,
    resolved: AtomicU32,
}

#[async_trait]
impl ArtifactStore for SlowResolveStore {
    async fn resolve(&self, artifact: &ArtifactRef) -> triage_storage::Result<ArtifactRef> {
        tokio::time::sleep(self.delay).await;
        self.resolved.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(artifact).await
    }

    async fn store(&self, task: TaskId, artifact: &PendingArtifact) -> triage_storage::Result<ArtifactRef> {
        self.inner.store(task, artifact).await
    }

    async fn discard(&self, artifact: &ArtifactRef) -> triage_storage::Result<()> {
        self.inner.discard(artifact).await
    }
}

/// Result store where another writer always commits first.
#[derive(Default)]
struct PreemptedStore {
    inner: MemoryResultStore,
}

#[async_trait]
impl ResultStore for PreemptedStore {
    async fn commit(&self, result: AnalyzerResult) -> triage_storage::Result<CommitOutcome> {
        let other = AnalyzerResult::completed(result.task_id, "other-worker", Vec::new(), Vec::new(), &[]);
        self.inner.commit(other).await?;
        self.inner.commit(result).await
    }

    async fn get(&self, id: TaskId) -> triage_storage::Result<Option<AnalyzerResult>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> triage_storage::Result<Vec<AnalyzerResult>> {
        self.inner.list().await
    }
}

fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x2545_F491_4F6C_DD1D;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

struct Harness {
    engine: Engine,
    results: Arc<CountingStore>,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new(analyzers: Vec<Arc<dyn Analyzer>>, config: EngineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = FsArtifactStore::new(dir.path().join("out")).await.unwrap();
        Self::with_store(analyzers, config, dir, Arc::new(artifacts))
    }

    fn with_store(
        analyzers: Vec<Arc<dyn Analyzer>>,
        config: EngineConfig,
        dir: tempfile::TempDir,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let mut registry = AnalyzerRegistry::new();
        for analyzer in analyzers {
            registry.register(analyzer).unwrap();
        }
        let results = Arc::new(CountingStore::default());
        let engine = Engine::new(registry, artifacts, results.clone(), config);
        Self { engine, results, dir }
    }

    /// Write an input file once; later calls reuse it, so running tasks
    /// never see it rewritten.
    fn input(&self, name: &str, data: &[u8]) -> ArtifactRef {
        let path = self.dir.path().join(name);
        if !path.exists() {
            std::fs::write(&path, data).unwrap();
        }
        ArtifactRef::from_path(&path).unwrap()
    }

    fn envelope(&self, analyzer: &str) -> TaskEnvelope {
        TaskEnvelope::builder(analyzer)
            .input(self.input("input.bin", b"some bytes"))
            .build()
    }

    fn commits(&self) -> u32 {
        self.results.commits.load(Ordering::SeqCst)
    }

    fn output_dir(&self, task: TaskId) -> std::path::PathBuf {
        self.dir.path().join("out").join(task.to_string())
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(RetryPolicy::default().with_delays(Duration::from_millis(1), Duration::from_millis(10)))
        .with_grace_period(Duration::from_millis(100))
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn capacity_bounds_concurrent_runs() {
    let worker = Scripted::new("worker", "carving", Behavior::Sleep(Duration::from_millis(30)));
    let config = fast_config().with_governor(GovernorConfig::new().with_class_limit("carving", 2));
    let h = Harness::new(vec![worker.clone()], config).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        handles.push(h.engine.submit(h.envelope("worker")).await.unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().status, ResultStatus::Success);
    }

    assert_eq!(worker.calls(), 6);
    assert_eq!(worker.max_running.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.governor().in_use("carving"), 0);
    assert_eq!(h.commits(), 6);
}

#[tokio::test]
async fn cooperative_analyzer_times_out() {
    let sleeper = Scripted::new("sleeper", "slow", Behavior::Sleep(Duration::from_secs(10)));
    let h = Harness::new(vec![sleeper.clone()], fast_config()).await;

    let envelope = TaskEnvelope::builder("sleeper")
        .input(h.input("a.bin", b"a"))
        .deadline(Duration::from_millis(100))
        .build();
    let started = Instant::now();
    let handle = h.engine.submit(envelope).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::TimedOut);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert!(result.diagnostic.starts_with("timed out: exceeded deadline"));
    assert!(result.artifacts.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.state(), TaskState::TimedOut);
    assert_eq!(sleeper.calls(), 1, "timeouts are not retried");
}

#[tokio::test]
async fn stubborn_analyzer_is_terminated_after_grace() {
    let stubborn = Scripted::new("stubborn", "slow", Behavior::Stubborn(Duration::from_secs(10)));
    let h = Harness::new(vec![stubborn.clone()], fast_config()).await;

    let envelope = TaskEnvelope::builder("stubborn")
        .input(h.input("a.bin", b"a"))
        .deadline(Duration::from_millis(150))
        .build();
    let id = envelope.id();
    let started = Instant::now();
    let result = h.engine.submit(envelope).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::TimedOut);
    assert!(result.diagnostic.contains("terminated"));
    // deadline + grace, with room for a slow machine
    assert!(started.elapsed() < Duration::from_millis(150 + 100 + 1_000));
    assert!(result.artifacts.is_empty());
    assert!(!h.output_dir(id).join("late.bin").exists());
    assert_eq!(h.engine.governor().in_use("slow"), 0);
}

#[tokio::test]
async fn cancel_while_queued_never_invokes_analyzer() {
    let blocker = Scripted::new("blocker", "slow", Behavior::WaitForCancel);
    let counted = Scripted::new("counted", "slow", Behavior::Sleep(Duration::ZERO));
    let config = fast_config().with_governor(GovernorConfig::new().with_class_limit("slow", 1));
    let h = Harness::new(vec![blocker.clone(), counted.clone()], config).await;

    let first = h.engine.submit(h.envelope("blocker")).await.unwrap();
    until(|| blocker.calls() == 1).await;

    let second = h.engine.submit(h.envelope("counted")).await.unwrap();
    until(|| h.engine.governor().waiting("slow") == 1).await;
    assert_eq!(second.state(), TaskState::Queued);

    assert!(h.engine.cancel(second.id()));
    let result = second.wait().await.unwrap();
    assert_eq!(result.status, ResultStatus::Cancelled);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.diagnostic, "cancelled: cancelled while waiting for a slot");
    assert_eq!(counted.calls(), 0);
    assert_eq!(h.engine.governor().waiting("slow"), 0);

    first.cancel();
    let result = first.wait().await.unwrap();
    assert_eq!(result.status, ResultStatus::Cancelled);
    assert_eq!(result.attempts, 1);
    assert_eq!(h.engine.governor().in_use("slow"), 0);
}

#[tokio::test]
async fn ignored_cancellation_is_a_failure() {
    let stubborn = Scripted::new("stubborn", "slow", Behavior::Stubborn(Duration::from_secs(10)));
    let h = Harness::new(vec![stubborn.clone()], fast_config()).await;

    let handle = h.engine.submit(h.envelope("stubborn")).await.unwrap();
    until(|| handle.state() == TaskState::Running && stubborn.calls() == 1).await;

    handle.cancel();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, ResultStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert!(result.diagnostic.contains("did not observe cancellation"));
    assert_eq!(handle.state(), TaskState::Failed);
}

#[tokio::test]
async fn queue_timeout_reports_waiting_for_slot() {
    let blocker = Scripted::new("blocker", "slow", Behavior::WaitForCancel);
    let config = fast_config()
        .with_governor(GovernorConfig::new().with_class_limit("slow", 1))
        .with_queue_timeout(Duration::from_millis(50));
    let h = Harness::new(vec![blocker.clone()], config).await;

    let first = h.engine.submit(h.envelope("blocker")).await.unwrap();
    until(|| blocker.calls() == 1).await;

    let result = h.engine.submit(h.envelope("blocker")).await.unwrap().wait().await.unwrap();
    assert_eq!(result.status, ResultStatus::TimedOut);
    assert!(result.diagnostic.starts_with("timed out: waiting for slot"));
    assert_eq!(blocker.calls(), 1);

    first.cancel();
    first.wait().await.unwrap();
}

#[tokio::test]
async fn panic_becomes_failure_and_frees_slot() {
    let bomb = Scripted::new("bomb", "fragile", Behavior::Panic);
    let h = Harness::new(vec![bomb.clone()], fast_config()).await;

    let result = h.engine.submit(h.envelope("bomb")).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Internal));
    assert_eq!(result.diagnostic, "internal error: analyzer panicked: analyzer exploded");
    assert_eq!(bomb.calls(), 1, "panics are not retried");
    assert_eq!(h.engine.governor().in_use("fragile"), 0);

    // The engine keeps working.
    let again = h.engine.submit(h.envelope("bomb")).await.unwrap().wait().await.unwrap();
    assert_eq!(again.status, ResultStatus::Failure);
}

#[tokio::test]
async fn input_errors_are_not_retried() {
    let picky = Scripted::new(
        "picky",
        "search",
        Behavior::Fail(AnalyzerError::Input("not an image".to_string())),
    );
    let h = Harness::new(vec![picky.clone()], fast_config()).await;

    let result = h.engine.submit(h.envelope("picky")).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Input));
    assert_eq!(result.diagnostic, "input error: not an image");
    assert_eq!(result.attempts, 1);
    assert_eq!(picky.calls(), 1);
}

#[tokio::test]
async fn duplicate_delivery_runs_once() {
    let worker = Scripted::new("worker", "search", Behavior::Sleep(Duration::from_millis(50)));
    let h = Harness::new(vec![worker.clone()], fast_config()).await;
    let envelope = h.envelope("worker");

    let first = h.engine.submit(envelope.clone()).await.unwrap();
    let second = h.engine.submit(envelope.clone()).await.unwrap();
    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a, b);

    let late = h.engine.submit(envelope).await.unwrap().wait().await.unwrap();
    assert_eq!(late, a);

    assert_eq!(worker.calls(), 1);
    assert_eq!(h.commits(), 1);
}

#[tokio::test]
async fn retries_commit_exactly_once() {
    let flaky = Scripted::new(
        "flaky",
        "search",
        Behavior::Fail(AnalyzerError::Transient("tool crashed".to_string())),
    );
    let h = Harness::new(vec![flaky.clone()], fast_config()).await;

    let result = h.engine.submit(h.envelope("flaky")).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Failure);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.diagnostic, "transient error (after 4 attempts): tool crashed");
    assert_eq!(flaky.calls(), 4);
    assert_eq!(h.commits(), 1);
    assert_eq!(
        h.results.get(result.task_id).await.unwrap().as_ref(),
        Some(&result)
    );
}

#[tokio::test]
async fn failed_output_commit_is_rolled_back() {
    let producer = Scripted::new(
        "producer",
        "carving",
        Behavior::Produce(vec![
            PendingArtifact::new("a.jpg", b"a".to_vec()),
            PendingArtifact::new("b.jpg", b"b".to_vec()),
        ]),
    );
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RefusingStore {
        inner: FsArtifactStore::new(dir.path().join("out")).await.unwrap(),
        refuse: "b.jpg".to_string(),
        discarded: AtomicU32::new(0),
    });
    let config = fast_config().with_retry(
        RetryPolicy::default()
            .with_max_retries(1)
            .with_delays(Duration::from_millis(1), Duration::from_millis(1)),
    );
    let h = Harness::with_store(vec![producer.clone()], config, dir, store.clone());

    let envelope = h.envelope("producer");
    let id = envelope.id();
    let result = h.engine.submit(envelope).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Transient));
    assert!(result.diagnostic.contains("cannot commit output artifact b.jpg"));
    assert_eq!(result.attempts, 2);
    assert_eq!(store.discarded.load(Ordering::SeqCst), 2);
    assert!(!h.output_dir(id).join("a.jpg").exists());
}

#[tokio::test]
async fn successful_outputs_are_committed() {
    let producer = Scripted::new(
        "producer",
        "carving",
        Behavior::Produce(vec![PendingArtifact::new("f0001.jpg", b"\xff\xd8\xff".to_vec())]),
    );
    let h = Harness::new(vec![producer], fast_config()).await;

    let envelope = h.envelope("producer");
    let id = envelope.id();
    let result = h.engine.submit(envelope).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].name(), "f0001.jpg");
    assert_eq!(std::fs::read(h.output_dir(id).join("f0001.jpg")).unwrap(), b"\xff\xd8\xff");
}

#[tokio::test]
async fn dispatch_loop_over_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::new(dir.path().join("out")).await.unwrap();
    let h = Harness::with_store(
        triage_analyzers::builtin::all(),
        fast_config(),
        dir,
        Arc::new(artifacts),
    );

    let mut data = vec![b'.'; 120];
    data.extend_from_slice(b"malicious-site.com");
    let log = h.input("proxy.log", &data);

    let search = TaskEnvelope::builder("search")
        .input(log.clone())
        .option("pattern", "malicious-site.com")
        .build();
    let search_id = search.id();
    let unknown = TaskEnvelope::builder("yara").input(log.clone()).build();
    let bad_encoding = TaskEnvelope::builder("strings")
        .input(log.clone())
        .option("encoding", "ebcdic")
        .build();
    let entropy = TaskEnvelope::builder("entropy").input(log).build();

    let (sender, source) = ChannelSource::channel(8);
    for envelope in [search, unknown, bad_encoding, entropy] {
        sender.send(envelope).await.unwrap();
    }
    drop(sender);

    let mut sink = CollectingSink::new();
    let stats = h.engine.run(source, &mut sink).await.unwrap();

    assert_eq!(stats.received, 4);
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.completed, 2);

    let reports = sink.into_reports();
    assert_eq!(reports.len(), 4);
    assert_eq!(reports.iter().filter(|r| r.rejected).count(), 2);

    let search_report = reports.iter().find(|r| r.task_id() == search_id).unwrap();
    assert_eq!(search_report.result.status, ResultStatus::Success);
    assert_eq!(search_report.result.findings.len(), 1);
    assert_eq!(
        search_report.result.findings[0].location(),
        &Location::Offset { offset: 120 }
    );
    assert_eq!(search_report.summary.count("match"), 1);
}

#[tokio::test]
async fn dispatch_loop_over_json_lines() {
    let worker = Scripted::new("worker", "search", Behavior::Sleep(Duration::from_millis(1)));
    let h = Harness::new(vec![worker.clone()], fast_config()).await;

    let envelope = h.envelope("worker");
    let input = format!(
        "{}\nnot json\n{}\n",
        serde_json::to_string(&envelope).unwrap(),
        serde_json::to_string(&envelope).unwrap()
    );

    let mut sink = JsonLinesSink::new(Vec::new());
    let stats = h
        .engine
        .run(JsonLinesSource::new(input.as_bytes()), &mut sink)
        .await
        .unwrap();

    assert_eq!(stats.received, 2);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.completed, 2);
    // The second delivery of the same id was not executed again.
    assert_eq!(worker.calls(), 1);
    assert_eq!(h.commits(), 1);

    let written = String::from_utf8(sink.into_inner()).unwrap();
    assert_eq!(written.lines().count(), 2);
}

#[tokio::test]
async fn cancel_while_resolving_inputs_never_invokes_analyzer() {
    let counted = Scripted::new("counted", "search", Behavior::Sleep(Duration::ZERO));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SlowResolveStore {
        inner: FsArtifactStore::new(dir.path().join("out")).await.unwrap(),
        delay: Duration::from_millis(300),
        resolved: AtomicU32::new(0),
    });
    let h = Harness::with_store(vec![counted.clone()], fast_config(), dir, store.clone());

    let handle = h.engine.submit(h.envelope("counted")).await.unwrap();
    until(|| handle.state() == TaskState::SlotAcquired).await;

    let started = Instant::now();
    handle.cancel();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Cancelled);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.diagnostic, "cancelled: cancelled while resolving inputs");
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(counted.calls(), 0);
    assert_eq!(store.resolved.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.governor().in_use("search"), 0);
}

#[tokio::test]
async fn same_named_inputs_get_distinct_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::new(dir.path().join("out")).await.unwrap();
    let h = Harness::with_store(
        triage_analyzers::builtin::all(),
        fast_config(),
        dir,
        Arc::new(artifacts),
    );

    std::fs::create_dir(h.dir.path().join("a")).unwrap();
    std::fs::create_dir(h.dir.path().join("b")).unwrap();
    let first = h.input("a/evidence.bin", b"first host password\0");
    let second = h.input("b/evidence.bin", b"second host secret\0");
    assert_eq!(first.name(), second.name());

    let envelope = TaskEnvelope::builder("strings")
        .input(first)
        .input(second)
        .build();
    let result = h.engine.submit(envelope).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.artifacts.len(), 2);
    assert_ne!(result.artifacts[0].path(), result.artifacts[1].path());

    let mut contents = Vec::new();
    for artifact in &result.artifacts {
        let on_disk = ArtifactRef::from_path(artifact.path()).unwrap();
        assert_eq!(artifact.sha256(), on_disk.sha256());
        assert_eq!(artifact.size(), on_disk.size());
        contents.push(std::fs::read_to_string(artifact.path()).unwrap());
    }
    contents.sort();
    assert_eq!(contents, vec!["0 first host password\n", "0 second host secret\n"]);
}

#[tokio::test]
async fn losing_commit_discards_its_outputs() {
    let producer = Scripted::new(
        "producer",
        "carving",
        Behavior::Produce(vec![PendingArtifact::new("f0001.jpg", b"\xff\xd8\xff".to_vec())]),
    );
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::new(dir.path().join("out")).await.unwrap();
    let mut registry = AnalyzerRegistry::new();
    registry.register(producer.clone()).unwrap();
    let engine = Engine::new(
        registry,
        Arc::new(artifacts),
        Arc::new(PreemptedStore::default()),
        fast_config(),
    );

    let input = dir.path().join("input.bin");
    std::fs::write(&input, b"some bytes").unwrap();
    let envelope = TaskEnvelope::builder("producer")
        .input(ArtifactRef::from_path(&input).unwrap())
        .build();
    let id = envelope.id();
    let result = engine.submit(envelope).await.unwrap().wait().await.unwrap();

    assert_eq!(producer.calls(), 1);
    assert_eq!(result.analyzer, "other-worker");
    assert!(result.artifacts.is_empty());
    assert!(!dir.path().join("out").join(id.to_string()).join("f0001.jpg").exists());
}

#[tokio::test]
async fn handle_exposes_analyzer_progress() {
    let h = Harness::new(triage_analyzers::builtin::all(), fast_config()).await;

    let envelope = TaskEnvelope::builder("strings")
        .input(h.input("memory.raw", b"\0\0hidden command line\0\0"))
        .build();
    let handle = h.engine.submit(envelope).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, ResultStatus::Success);
    let progress = handle.progress().unwrap();
    assert_eq!(progress["extracted_strings"], 1);
    assert_eq!(progress["artifacts_done"], 1);
    assert_eq!(progress["artifacts_total"], 1);
}

#[tokio::test]
async fn high_entropy_input_is_flagged() {
    let h = Harness::new(triage_analyzers::builtin::all(), fast_config()).await;

    let packed = TaskEnvelope::builder("entropy")
        .input(h.input("packed.exe", &pseudo_random(1 << 16)))
        .option("entropy_threshold", 7.0)
        .build();
    let report = h.engine.process(packed).await.unwrap();

    assert_eq!(report.result.status, ResultStatus::Success);
    assert!(report.flagged);
    assert_eq!(report.reasons, vec!["entropy-flag: 1 finding(s)".to_string()]);
    assert_eq!(report.summary.count("entropy-flag"), 1);

    let zeros = TaskEnvelope::builder("entropy")
        .input(h.input("zeros.bin", &vec![0u8; 8192]))
        .option("entropy_threshold", 7.0)
        .build();
    let report = h.engine.process(zeros).await.unwrap();

    assert_eq!(report.result.status, ResultStatus::Success);
    assert!(!report.flagged);
    assert!(report.reasons.is_empty());
}
