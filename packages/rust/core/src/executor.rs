//! The checkpointed pipeline state machine.
//!
//! ```text
//! INPUT -> INTENT -> RETRIEVE -> GENERATE -> EVALUATE -> [REFLECT] -> POSTPROCESS -> DONE
//! ```
//!
//! After every stage the executor records the stage's channel writes against
//! the current checkpoint, then commits a new checkpoint naming the next step.
//! A run interrupted between the two is resumed by replaying the recorded
//! writes instead of invoking the stage again.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use helpdesk_shared::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, FinalResponse, HelpdeskError, ListFilter,
    PipelineConfig, PipelineState, Result, RunConfig, RunStatus, Step,
};
use helpdesk_storage::CheckpointSaver;

use crate::cache::ResultCache;
use crate::collaborators::Collaborators;
use crate::stages::{StageRegistry, base_response};

/// What a finished (or failed) run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_response: FinalResponse,
    pub state: PipelineState,
    /// Id shared by every checkpoint of the run.
    pub run_id: String,
    /// Address of the last committed checkpoint (`checkpoint_id` unset when
    /// nothing was committed).
    pub config: RunConfig,
    pub status: RunStatus,
    /// Whether every checkpoint of the run was persisted. A non-durable run
    /// cannot be resumed after a crash.
    pub durable: bool,
    /// Whether the run continued from a stored checkpoint.
    pub resumed: bool,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage runs.
    fn stage_started(&self, step: Step);
    /// Called once the stage's checkpoint is committed.
    fn stage_finished(&self, step: Step);
    /// Called when the evaluation triggers the reflection retry.
    fn reflection(&self, confidence: Option<f64>, sufficient: Option<bool>);
    /// Called when the run completes.
    fn done(&self, outcome: &RunOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _step: Step) {}
    fn stage_finished(&self, _step: Step) {}
    fn reflection(&self, _confidence: Option<f64>, _sufficient: Option<bool>) {}
    fn done(&self, _outcome: &RunOutcome) {}
}

/// Runs the stage registry against a checkpoint store.
pub struct Executor {
    registry: StageRegistry,
    saver: Arc<dyn CheckpointSaver>,
    config: PipelineConfig,
}

impl Executor {
    pub fn new(
        registry: StageRegistry,
        saver: Arc<dyn CheckpointSaver>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            saver,
            config,
        })
    }

    /// Executor over the standard stages. The cache is dropped when
    /// `config.cache_enabled` is false.
    pub fn standard(
        collaborators: &Collaborators,
        saver: Arc<dyn CheckpointSaver>,
        cache: Option<ResultCache>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let cache = cache.filter(|_| config.cache_enabled);
        let registry = StageRegistry::standard(collaborators, cache, &config);
        Self::new(registry, saver, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `query` to completion with no progress reporting.
    pub async fn run_pipeline(&self, query: &str, run: &RunConfig) -> Result<RunOutcome> {
        self.run_pipeline_with_progress(query, run, &SilentProgress)
            .await
    }

    /// Run `query` on the thread `run` addresses.
    ///
    /// When `run.checkpoint_id` names a stored checkpoint, the run it belongs
    /// to is continued from its newest checkpoint instead of starting over.
    /// Otherwise a new run starts, using that id (or a fresh one) as its run id.
    ///
    /// Collaborator and storage failures never surface as `Err`; the caller
    /// always gets a best-effort response. `Err` means the query was missing
    /// or the state machine itself is broken.
    #[instrument(skip_all, fields(thread = %run.thread_id, ns = %run.checkpoint_ns))]
    pub async fn run_pipeline_with_progress(
        &self,
        query: &str,
        run: &RunConfig,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        if query.trim().is_empty() {
            return Err(HelpdeskError::validation("query must not be empty"));
        }

        let base = RunConfig::new(run.thread_id.clone(), run.checkpoint_ns.clone());
        // Replaced by the stored run's id when resuming.
        let fresh_run_id = run
            .checkpoint_id
            .clone()
            .unwrap_or_else(helpdesk_shared::new_checkpoint_id);
        let mut tracker = Tracker {
            saver: self.saver.as_ref(),
            base: base.clone(),
            current: base,
            run_id: fresh_run_id,
            versions: BTreeMap::new(),
            durable: true,
        };

        let resumed = match self.find_resume_point(run).await {
            Ok(found) => found,
            Err(e) => {
                tracker.lose_durability(&e, "resume lookup");
                None
            }
        };

        let (mut state, mut step, was_resumed) = match resumed {
            Some(tuple) => {
                info!(
                    run_id = %tuple.metadata.run_id,
                    checkpoint = %tuple.checkpoint.id,
                    next = %tuple.metadata.next,
                    "resuming run"
                );
                if tuple.checkpoint.state.user_query != query {
                    warn!("query differs from the stored run, continuing with the stored query");
                }
                if tuple.metadata.status.is_terminal() {
                    let outcome = finished_outcome(tuple)?;
                    progress.done(&outcome);
                    return Ok(outcome);
                }
                tracker.run_id = tuple.metadata.run_id.clone();
                tracker.versions = tuple.checkpoint.channel_versions.clone();
                tracker.current = tuple.config.clone();
                let mut state = tuple.checkpoint.state;
                let step = tuple.metadata.next;
                if self.reconcile(&mut state, step, &tuple.pending_writes) {
                    info!(step = %step, "applied recorded writes, stage not re-run");
                    let next = self.next_step(step, &state);
                    tracker.commit(&state, step, next, None).await;
                    (state, next, true)
                } else {
                    (state, step, true)
                }
            }
            None => {
                let run_id = tracker.run_id.clone();
                info!(%run_id, "starting run");
                let state = PipelineState::new(query);
                tracker.commit_input(&state, &run_id).await;
                (state, Step::Intent, false)
            }
        };

        while step != Step::Done {
            if let Err(e) = state.check_ready(step) {
                error!(step = %step, error = %e, "pipeline invariant violated");
                return Err(e);
            }
            progress.stage_started(step);
            let stage = self.registry.get(step)?;

            let before = state.clone();
            state = match stage.run(state).await {
                Ok(state) => state,
                Err(e) if e.is_fatal() => {
                    error!(step = %step, error = %e, "pipeline invariant violated");
                    return Err(e);
                }
                Err(e) => {
                    let outcome = self.fail_run(before, step, &e, &mut tracker, was_resumed).await;
                    progress.done(&outcome);
                    return Ok(outcome);
                }
            };

            tracker.record_writes(step, &state).await;
            let next = self.next_step(step, &state);
            tracker.commit(&state, step, next, None).await;
            progress.stage_finished(step);

            if next == Step::Reflect {
                info!(
                    confidence = ?state.eval_confidence,
                    sufficient = ?state.eval_sufficient,
                    threshold = self.config.reflection_threshold,
                    "evaluation below bar, retrying once"
                );
                progress.reflection(state.eval_confidence, state.eval_sufficient);
            }
            step = next;
        }

        state.check_ready(Step::Done)?;
        let final_response = state
            .final_response
            .clone()
            .ok_or_else(|| HelpdeskError::malformed("run finished without final_response"))?;

        let outcome = RunOutcome {
            final_response,
            state,
            run_id: tracker.run_id.clone(),
            config: tracker.current.clone(),
            status: RunStatus::Completed,
            durable: tracker.durable,
            resumed: was_resumed,
        };
        info!(
            run_id = %outcome.run_id,
            durable = outcome.durable,
            reflected = outcome.state.reflected,
            "run completed"
        );
        progress.done(&outcome);
        Ok(outcome)
    }

    /// The step after `step`, given the state it produced.
    fn next_step(&self, step: Step, state: &PipelineState) -> Step {
        match step {
            Step::Input => Step::Intent,
            Step::Intent => Step::Retrieve,
            Step::Retrieve => Step::Generate,
            Step::Generate => Step::Evaluate,
            Step::Evaluate
                if !state.reflected && state.needs_reflection(self.config.reflection_threshold) =>
            {
                Step::Reflect
            }
            Step::Evaluate | Step::Reflect => Step::Postprocess,
            Step::Postprocess | Step::Done => Step::Done,
        }
    }

    /// The newest checkpoint of the run `run.checkpoint_id` belongs to.
    async fn find_resume_point(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        if run.checkpoint_id.is_none() {
            return Ok(None);
        }
        let Some(anchor) = self.saver.get_tuple(run).await? else {
            return Ok(None);
        };
        let newest = self
            .saver
            .list(run, &ListFilter::for_run(&anchor.metadata.run_id).limit(1))
            .await?
            .into_iter()
            .next();
        Ok(Some(newest.unwrap_or(anchor)))
    }

    /// Apply writes recorded for `step` but never committed. Returns whether
    /// the batch was applied; an unreadable batch is dropped whole and the
    /// stage runs again.
    fn reconcile(
        &self,
        state: &mut PipelineState,
        step: Step,
        pending: &[helpdesk_shared::PendingWrite],
    ) -> bool {
        let mut replayed = state.clone();
        let mut applied = false;
        for write in pending.iter().filter(|w| w.task_id == step.as_str()) {
            debug!(channel = %write.channel, "replaying recorded write");
            if let Err(e) = replayed.apply_write(&write.channel, write.value.clone()) {
                warn!(
                    step = %step,
                    channel = %write.channel,
                    error = %e,
                    "recorded write unreadable, re-running stage"
                );
                return false;
            }
            applied = true;
        }
        if applied {
            *state = replayed;
        }
        applied
    }

    /// Mark the run failed, keeping whatever the state holds.
    async fn fail_run(
        &self,
        mut state: PipelineState,
        step: Step,
        cause: &HelpdeskError,
        tracker: &mut Tracker<'_>,
        resumed: bool,
    ) -> RunOutcome {
        error!(step = %step, error = %cause, "stage failed, run marked failed");
        let final_response = match state.final_response.clone() {
            Some(existing) => existing,
            None => {
                let mut response = base_response(&state);
                response.error = Some(cause.to_string());
                state.final_response = Some(response.clone());
                response
            }
        };
        tracker
            .commit(&state, step, Step::Done, Some(cause.to_string()))
            .await;

        RunOutcome {
            final_response,
            state,
            run_id: tracker.run_id.clone(),
            config: tracker.current.clone(),
            status: RunStatus::Failed,
            durable: tracker.durable,
            resumed,
        }
    }
}

/// Outcome of a run whose newest checkpoint is already terminal.
fn finished_outcome(tuple: CheckpointTuple) -> Result<RunOutcome> {
    let final_response = tuple
        .checkpoint
        .state
        .final_response
        .clone()
        .ok_or_else(|| HelpdeskError::malformed("terminal checkpoint without final_response"))?;
    info!(run_id = %tuple.metadata.run_id, "run already finished, returning stored response");
    Ok(RunOutcome {
        final_response,
        state: tuple.checkpoint.state,
        run_id: tuple.metadata.run_id,
        config: tuple.config,
        status: tuple.metadata.status,
        durable: true,
        resumed: true,
    })
}

// ---------------------------------------------------------------------------
// Checkpoint bookkeeping
// ---------------------------------------------------------------------------

/// Channels a failure commit touches.
const FAILURE_CHANNELS: &[&str] = &["final_response"];

/// Per-run persistence state. Once a write fails, nothing further is
/// persisted for the run.
struct Tracker<'a> {
    saver: &'a dyn CheckpointSaver,
    base: RunConfig,
    /// Last committed checkpoint.
    current: RunConfig,
    run_id: String,
    versions: BTreeMap<String, u64>,
    durable: bool,
}

impl Tracker<'_> {
    fn lose_durability(&mut self, cause: &HelpdeskError, during: &str) {
        if self.durable {
            warn!(
                run_id = %self.run_id,
                error = %cause,
                during,
                "checkpoint store failed, run is not resumable"
            );
        }
        self.durable = false;
    }

    /// Record `step`'s channel values against the current checkpoint.
    async fn record_writes(&mut self, step: Step, state: &PipelineState) {
        if !self.durable {
            return;
        }
        let writes = match step
            .channels()
            .iter()
            .map(|channel| Ok((channel.to_string(), state.channel_value(channel)?)))
            .collect::<Result<Vec<_>>>()
        {
            Ok(writes) => writes,
            Err(e) => {
                self.lose_durability(&e, "encoding writes");
                return;
            }
        };
        if let Err(e) = self
            .saver
            .put_writes(&self.current, &writes, step.as_str())
            .await
        {
            self.lose_durability(&e, "put_writes");
        }
    }

    async fn commit_input(&mut self, state: &PipelineState, run_id: &str) {
        let checkpoint_versions = self.advance(Step::Input.channels());
        let checkpoint = Checkpoint::with_id(run_id, state.clone(), self.versions.clone());
        self.put(checkpoint, Step::Input, Step::Intent, None, checkpoint_versions)
            .await;
    }

    /// Commit a checkpoint for the state `step` produced. `error` marks the
    /// run failed.
    async fn commit(&mut self, state: &PipelineState, step: Step, next: Step, error: Option<String>) {
        let channels: &[&str] = if error.is_some() {
            FAILURE_CHANNELS
        } else {
            step.channels()
        };
        let changed = self.advance(channels);
        let checkpoint = Checkpoint::new(state.clone(), self.versions.clone());
        self.put(checkpoint, step, next, error, changed).await;
    }

    /// Bump the version of every channel in `channels`; returns the bumped set.
    fn advance(&mut self, channels: &[&str]) -> BTreeMap<String, u64> {
        let mut changed = BTreeMap::new();
        for channel in channels {
            let version = self
                .saver
                .next_version(self.versions.get(*channel).copied(), channel);
            self.versions.insert(channel.to_string(), version);
            changed.insert(channel.to_string(), version);
        }
        changed
    }

    async fn put(
        &mut self,
        checkpoint: Checkpoint,
        step: Step,
        next: Step,
        error: Option<String>,
        changed: BTreeMap<String, u64>,
    ) {
        if !self.durable {
            return;
        }
        let status = match (&error, next) {
            (Some(_), _) => RunStatus::Failed,
            (None, Step::Done) => RunStatus::Completed,
            (None, _) => RunStatus::Running,
        };
        let metadata = CheckpointMetadata {
            run_id: self.run_id.clone(),
            parent_id: self.current.checkpoint_id.clone(),
            step,
            next,
            status,
            error,
        };
        match self.saver.put(&self.base, &checkpoint, &metadata, &changed).await {
            Ok(stored) => {
                debug!(checkpoint = ?stored.checkpoint_id, step = %step, next = %next, "checkpoint committed");
                self.current = stored;
            }
            Err(e) => self.lose_durability(&e, "put"),
        }
    }
}
