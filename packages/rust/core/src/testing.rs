//! Scripted collaborators and a failure-injecting store for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use helpdesk_shared::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, Document, HelpdeskError, Intent, ListFilter,
    Result, RunConfig,
};
use helpdesk_storage::{CacheStore, CheckpointSaver, MemoryStore};

use crate::collaborators::{
    Classification, Classifier, Collaborators, Evaluation, Evaluator, Generation, Generator,
    Retriever, TicketSystem,
};

pub(crate) fn verdict(confidence: f64, sufficient: bool, reason: &str) -> Evaluation {
    Evaluation {
        confidence,
        sufficient,
        reason: reason.to_string(),
    }
}

fn injected(collaborator: &'static str) -> HelpdeskError {
    HelpdeskError::collaborator(collaborator, "injected failure")
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub(crate) struct ScriptedClassifier {
    intent: Option<Intent>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _query: &str) -> Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("classifier"));
        }
        Ok(Classification { intent: self.intent })
    }
}

/// Returns `k` numbered documents and records every `k` it was asked for.
pub(crate) struct ScriptedRetriever {
    fail: AtomicBool,
    fail_wide: AtomicBool,
    ks: Mutex<Vec<usize>>,
}

impl ScriptedRetriever {
    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Fail only calls wider than the default breadth.
    pub(crate) fn fail_wide(&self, fail: bool) {
        self.fail_wide.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn ks(&self) -> Vec<usize> {
        self.ks.lock().map(|ks| ks.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(&self, query: &str, intent: Option<Intent>, k: usize) -> Result<Vec<Document>> {
        if let Ok(mut ks) = self.ks.lock() {
            ks.push(k);
        }
        if self.fail.load(Ordering::SeqCst) || (k > 10 && self.fail_wide.load(Ordering::SeqCst)) {
            return Err(injected("retriever"));
        }
        let label = intent.map_or("none", |i| i.as_str());
        Ok((0..k)
            .map(|i| {
                Document::new(format!("{query} :: passage {i} (k={k})"))
                    .with_meta("intent", label)
                    .with_meta("rank", i)
            })
            .collect())
    }
}

/// Answers with a summary of the context it saw.
pub(crate) struct ScriptedGenerator {
    fail: AtomicBool,
    context_sizes: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn context_sizes(&self) -> Vec<usize> {
        self.context_sizes.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _query: &str, context: &[Document]) -> Result<Generation> {
        if let Ok(mut sizes) = self.context_sizes.lock() {
            sizes.push(context.len());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("generator"));
        }
        let first = context.first().map_or("nothing", |d| d.content.as_str());
        Ok(Generation {
            answer: format!("answer from {} docs, starting with {first}", context.len()),
        })
    }
}

/// Replays scripted verdicts in order, repeating the last one when exhausted.
pub(crate) struct ScriptedEvaluator {
    verdicts: Mutex<Vec<Evaluation>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, _query: &str, _answer: &str) -> Result<Evaluation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("evaluator"));
        }
        let verdicts = self
            .verdicts
            .lock()
            .map_err(|_| HelpdeskError::collaborator("evaluator", "poisoned"))?;
        verdicts
            .get(call)
            .or_else(|| verdicts.last())
            .cloned()
            .ok_or_else(|| HelpdeskError::collaborator("evaluator", "no verdict scripted"))
    }
}

pub(crate) struct ScriptedTickets {
    fail: AtomicBool,
    summaries: Mutex<Vec<String>>,
}

impl ScriptedTickets {
    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn summaries(&self) -> Vec<String> {
        self.summaries.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TicketSystem for ScriptedTickets {
    async fn create_ticket(&self, summary: &str) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HelpdeskError::collaborator("ticket system", "service down"));
        }
        let mut summaries = self
            .summaries
            .lock()
            .map_err(|_| HelpdeskError::collaborator("ticket system", "poisoned"))?;
        summaries.push(summary.to_string());
        Ok(format!("TICKET-{}", 1000 + summaries.len()))
    }
}

/// One scripted instance of every collaborator.
pub(crate) struct Doubles {
    pub classifier: Arc<ScriptedClassifier>,
    pub retriever: Arc<ScriptedRetriever>,
    pub generator: Arc<ScriptedGenerator>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub tickets: Arc<ScriptedTickets>,
}

impl Doubles {
    pub(crate) fn new(intent: Option<Intent>, verdicts: Vec<Evaluation>) -> Self {
        Self {
            classifier: Arc::new(ScriptedClassifier {
                intent,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }),
            retriever: Arc::new(ScriptedRetriever {
                fail: AtomicBool::new(false),
                fail_wide: AtomicBool::new(false),
                ks: Mutex::new(Vec::new()),
            }),
            generator: Arc::new(ScriptedGenerator {
                fail: AtomicBool::new(false),
                context_sizes: Mutex::new(Vec::new()),
            }),
            evaluator: Arc::new(ScriptedEvaluator {
                verdicts: Mutex::new(verdicts),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }),
            tickets: Arc::new(ScriptedTickets {
                fail: AtomicBool::new(false),
                summaries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            classifier: self.classifier.clone(),
            retriever: self.retriever.clone(),
            generator: self.generator.clone(),
            evaluator: self.evaluator.clone(),
            tickets: self.tickets.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A [`MemoryStore`] whose operations can be made to fail as if the backing
/// medium were unreachable.
pub(crate) struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_all: AtomicBool,
    /// Successful `put`s allowed before every further `put` fails.
    puts_allowed: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::over(Arc::new(MemoryStore::new()))
    }

    pub(crate) fn over(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_all: AtomicBool::new(false),
            puts_allowed: AtomicUsize::new(usize::MAX),
        }
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_puts_after(&self, allowed: usize) {
        self.puts_allowed.store(allowed, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(HelpdeskError::StorageUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointSaver for FlakyStore {
    async fn put(
        &self,
        run: &RunConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &BTreeMap<String, u64>,
    ) -> Result<RunConfig> {
        self.check()?;
        let allowed = self
            .puts_allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if allowed.is_err() {
            return Err(HelpdeskError::StorageUnavailable("connection reset".into()));
        }
        self.inner.put(run, checkpoint, metadata, new_versions).await
    }

    async fn put_writes(&self, run: &RunConfig, writes: &[(String, Value)], task_id: &str) -> Result<()> {
        self.check()?;
        self.inner.put_writes(run, writes, task_id).await
    }

    async fn get_tuple(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        self.check()?;
        self.inner.get_tuple(run).await
    }

    async fn get_latest(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        self.check()?;
        self.inner.get_latest(run).await
    }

    async fn list(&self, run: &RunConfig, filter: &ListFilter) -> Result<Vec<CheckpointTuple>> {
        self.check()?;
        self.inner.list(run, filter).await
    }

    async fn prune(&self, run: &RunConfig, keep: usize) -> Result<usize> {
        self.check()?;
        self.inner.prune(run, keep).await
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.cache_get(key).await
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.cache_set(key, value, ttl).await
    }
}
