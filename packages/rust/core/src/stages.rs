//! Pipeline stages and the registry the executor dispatches through.
//!
//! A stage owns the state while it runs and hands it back. Collaborator
//! failures never leave a stage: each one degrades to a fallback value and is
//! logged. Only invariant violations are returned as errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use helpdesk_shared::{
    Document, FinalResponse, HelpdeskError, Intent, PipelineConfig, PipelineState, Result, Step,
};

use crate::cache::ResultCache;
use crate::collaborators::{
    Classifier, Collaborators, Evaluation, Evaluator, Generation, Generator, Retriever,
    TicketSystem,
};

/// Answer given whenever the knowledge base answer is not sufficient.
pub const ESCALATION_ANSWER: &str = "KB answer insufficient. Escalating to human/HR.";

/// Escalation note attached to insufficient answers.
pub const ESCALATION_NOTE: &str = "Human/HR team assigned";

/// One position of the pipeline state machine.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The step this stage executes.
    fn step(&self) -> Step;

    /// Transform `state`. Re-running with the same input yields the same writes.
    async fn run(&self, state: PipelineState) -> Result<PipelineState>;
}

/// Stages keyed by the step they execute.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<Step, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard helpdesk pipeline over `collaborators`.
    ///
    /// `cache` is consulted on the primary retrieval pass only.
    pub fn standard(
        collaborators: &Collaborators,
        cache: Option<ResultCache>,
        config: &PipelineConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(IntentStage::new(collaborators.classifier.clone())))
            .register(Arc::new(RetrieveStage {
                retriever: collaborators.retriever.clone(),
                cache,
                k: config.default_k,
                ttl: config.cache_ttl,
            }))
            .register(Arc::new(GenerateStage {
                generator: collaborators.generator.clone(),
                max_context_docs: config.max_context_docs,
            }))
            .register(Arc::new(EvaluateStage {
                evaluator: collaborators.evaluator.clone(),
            }))
            .register(Arc::new(ReflectStage {
                retriever: collaborators.retriever.clone(),
                generator: collaborators.generator.clone(),
                evaluator: collaborators.evaluator.clone(),
                k: config.reflection_k,
                max_context_docs: config.max_context_docs,
            }))
            .register(Arc::new(PostprocessStage {
                tickets: collaborators.tickets.clone(),
            }));
        registry
    }

    /// Add `stage`, replacing any stage registered for the same step.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.step(), stage);
        self
    }

    pub fn get(&self, step: Step) -> Result<&Arc<dyn Stage>> {
        self.stages
            .get(&step)
            .ok_or_else(|| HelpdeskError::malformed(format!("no stage registered for {step}")))
    }
}

/// The generator's context: the first `max` documents.
fn bounded(docs: &[Document], max: usize) -> &[Document] {
    &docs[..docs.len().min(max)]
}

/// Reject a verdict without a usable confidence; clamp the rest into [0, 1].
fn checked_verdict(mut verdict: Evaluation) -> Result<Evaluation> {
    if !verdict.confidence.is_finite() {
        return Err(HelpdeskError::collaborator(
            "evaluator",
            format!("confidence is not a finite number: {}", verdict.confidence),
        ));
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

pub struct IntentStage {
    classifier: Arc<dyn Classifier>,
}

impl IntentStage {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl Stage for IntentStage {
    fn step(&self) -> Step {
        Step::Intent
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        state.intent = match self.classifier.classify(&state.user_query).await {
            Ok(classification) => classification.intent,
            Err(e) => {
                warn!(error = %e, "classification failed, continuing unclassified");
                None
            }
        };
        debug!(intent = ?state.intent, "intent classified");
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Retrieve
// ---------------------------------------------------------------------------

pub struct RetrieveStage {
    retriever: Arc<dyn Retriever>,
    cache: Option<ResultCache>,
    k: usize,
    ttl: Duration,
}

#[async_trait]
impl Stage for RetrieveStage {
    fn step(&self) -> Step {
        Step::Retrieve
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        if let Some(cache) = &self.cache {
            if let Some(docs) = cache.get(&state.user_query).await {
                info!(docs = docs.len(), cache_hit = true, "retrieval served from cache");
                state.retrieved_docs = Some(docs);
                return Ok(state);
            }
        }

        let docs = match self
            .retriever
            .retrieve(&state.user_query, state.intent, self.k)
            .await
        {
            Ok(docs) => {
                // Empty result sets are not worth pinning for a whole TTL.
                if let Some(cache) = self.cache.as_ref().filter(|_| !docs.is_empty()) {
                    cache.set(&state.user_query, &docs, self.ttl).await;
                }
                docs
            }
            Err(e) => {
                warn!(error = %e, k = self.k, "retrieval failed, continuing without documents");
                Vec::new()
            }
        };
        info!(docs = docs.len(), k = self.k, cache_hit = false, "documents retrieved");
        state.retrieved_docs = Some(docs);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Generate
// ---------------------------------------------------------------------------

pub struct GenerateStage {
    generator: Arc<dyn Generator>,
    max_context_docs: usize,
}

#[async_trait]
impl Stage for GenerateStage {
    fn step(&self) -> Step {
        Step::Generate
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let docs = state.retrieved_docs.as_deref().unwrap_or_default();
        let context = bounded(docs, self.max_context_docs);
        state.kb_answer = match self.generator.generate(&state.user_query, context).await {
            Ok(Generation { answer }) => Some(answer),
            Err(e) => {
                warn!(error = %e, "generation failed, continuing with empty answer");
                Some(String::new())
            }
        };
        debug!(context_docs = context.len(), "answer generated");
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Evaluate
// ---------------------------------------------------------------------------

pub struct EvaluateStage {
    evaluator: Arc<dyn Evaluator>,
}

#[async_trait]
impl Stage for EvaluateStage {
    fn step(&self) -> Step {
        Step::Evaluate
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let answer = state.kb_answer.as_deref().unwrap_or_default();
        let verdict = self
            .evaluator
            .evaluate(&state.user_query, answer)
            .await
            .and_then(checked_verdict);
        match verdict {
            Ok(verdict) => apply_verdict(&mut state, verdict),
            Err(e) => {
                warn!(error = %e, "evaluation failed, treating answer as insufficient");
                state.eval_confidence = None;
                state.eval_sufficient = Some(false);
                state.eval_reason = Some(format!("evaluation unavailable: {e}"));
            }
        }
        info!(
            confidence = ?state.eval_confidence,
            sufficient = ?state.eval_sufficient,
            "answer evaluated"
        );
        Ok(state)
    }
}

fn apply_verdict(state: &mut PipelineState, verdict: Evaluation) {
    state.eval_confidence = Some(verdict.confidence);
    state.eval_sufficient = Some(verdict.sufficient);
    state.eval_reason = Some(verdict.reason);
}

// ---------------------------------------------------------------------------
// Reflect
// ---------------------------------------------------------------------------

/// The single reflection retry: wider retrieval without the cache, then
/// generation and evaluation again.
///
/// The retry's verdict replaces the earlier one whether or not it is better.
/// If any collaborator fails along the way, the pre-retry documents, answer
/// and verdict are restored.
pub struct ReflectStage {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    evaluator: Arc<dyn Evaluator>,
    k: usize,
    max_context_docs: usize,
}

impl ReflectStage {
    async fn attempt(
        &self,
        query: &str,
        intent: Option<Intent>,
    ) -> Result<(Vec<Document>, Generation, Evaluation)> {
        let docs = self.retriever.retrieve(query, intent, self.k).await?;
        let generation = self
            .generator
            .generate(query, bounded(&docs, self.max_context_docs))
            .await?;
        let verdict = checked_verdict(self.evaluator.evaluate(query, &generation.answer).await?)?;
        Ok((docs, generation, verdict))
    }
}

#[async_trait]
impl Stage for ReflectStage {
    fn step(&self) -> Step {
        Step::Reflect
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        state.reflected = true;
        info!(
            k = self.k,
            confidence = ?state.eval_confidence,
            sufficient = ?state.eval_sufficient,
            "reflection retry"
        );

        match self.attempt(&state.user_query, state.intent).await {
            Ok((docs, generation, verdict)) => {
                state.retrieved_docs = Some(docs);
                state.kb_answer = Some(generation.answer);
                apply_verdict(&mut state, verdict);
                info!(
                    confidence = ?state.eval_confidence,
                    sufficient = ?state.eval_sufficient,
                    "reflection verdict"
                );
            }
            Err(e) => {
                // The state is untouched apart from `reflected`.
                warn!(error = %e, "reflection retry failed, keeping original evaluation");
            }
        }
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Postprocess
// ---------------------------------------------------------------------------

pub struct PostprocessStage {
    tickets: Arc<dyn TicketSystem>,
}

/// Answer and escalation fields derived from the evaluation alone.
pub(crate) fn base_response(state: &PipelineState) -> FinalResponse {
    let sufficient = state.eval_sufficient == Some(true);
    let mut response = FinalResponse {
        answer: if sufficient {
            state.kb_answer.clone().unwrap_or_default()
        } else {
            ESCALATION_ANSWER.to_string()
        },
        ..Default::default()
    };
    if !sufficient {
        response.escalation = Some(ESCALATION_NOTE.to_string());
        response.reason = state.eval_reason.clone();
    }
    response
}

/// Ticket summary for the run, if the decision table calls for a ticket.
fn ticket_summary(state: &PipelineState) -> Option<String> {
    let sufficient = state.eval_sufficient == Some(true);
    match state.intent {
        Some(Intent::ItGuidelines) => Some(format!("IT Ticket for user query: {}", state.user_query)),
        Some(Intent::HrPolicy) if !sufficient => {
            Some(format!("HR Ticket for user query: {}", state.user_query))
        }
        Some(Intent::HrPolicy) => None,
        None => {
            info!("unclassified query, no ticket");
            None
        }
    }
}

#[async_trait]
impl Stage for PostprocessStage {
    fn step(&self) -> Step {
        Step::Postprocess
    }

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let mut response = base_response(&state);

        if let Some(summary) = ticket_summary(&state) {
            match self.tickets.create_ticket(&summary).await {
                Ok(ticket_id) => {
                    info!(%ticket_id, "ticket created");
                    response.ticket_id = Some(ticket_id);
                    response.ticket_summary = Some(summary);
                }
                Err(e) => {
                    warn!(error = %e, "ticket creation failed");
                    response.ticket_error = Some(e.to_string());
                }
            }
        }

        state.set_final_response(response)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Doubles, verdict};

    fn evaluated(intent: Option<Intent>, sufficient: Option<bool>) -> PipelineState {
        let mut state = PipelineState::new("How can I reset my Outlook password?");
        state.intent = intent;
        state.retrieved_docs = Some(vec![Document::new("Use the self-service portal.")]);
        state.kb_answer = Some("Use the self-service portal.".into());
        state.eval_confidence = Some(0.9);
        state.eval_sufficient = sufficient;
        state.eval_reason = Some("grounded".into());
        state
    }

    #[tokio::test]
    async fn decision_table_holds_for_all_combinations() {
        let cases = [
            (Some(Intent::ItGuidelines), Some(true), Some("IT")),
            (Some(Intent::ItGuidelines), Some(false), Some("IT")),
            (Some(Intent::ItGuidelines), None, Some("IT")),
            (Some(Intent::HrPolicy), Some(true), None),
            (Some(Intent::HrPolicy), Some(false), Some("HR")),
            (Some(Intent::HrPolicy), None, Some("HR")),
            (None, Some(true), None),
            (None, Some(false), None),
            (None, None, None),
        ];

        for (intent, sufficient, ticket) in cases {
            let doubles = Doubles::new(intent, vec![]);
            let stage = PostprocessStage {
                tickets: doubles.tickets.clone(),
            };
            let state = stage.run(evaluated(intent, sufficient)).await.unwrap();
            let response = state.final_response.expect("final response");
            let label = format!("{intent:?}/{sufficient:?}");

            match ticket {
                Some(prefix) => {
                    let summary = response.ticket_summary.as_deref().expect(&label);
                    assert_eq!(
                        summary,
                        format!("{prefix} Ticket for user query: How can I reset my Outlook password?"),
                        "{label}"
                    );
                    assert!(response.ticket_id.is_some(), "{label}");
                }
                None => {
                    assert!(response.ticket_id.is_none(), "{label}");
                    assert!(doubles.tickets.summaries().is_empty(), "{label}");
                }
            }

            if sufficient == Some(true) {
                assert_eq!(response.answer, "Use the self-service portal.", "{label}");
                assert!(response.escalation.is_none(), "{label}");
                assert!(response.reason.is_none(), "{label}");
            } else {
                assert_eq!(response.answer, ESCALATION_ANSWER, "{label}");
                assert_eq!(response.escalation.as_deref(), Some(ESCALATION_NOTE), "{label}");
                assert_eq!(response.reason.as_deref(), Some("grounded"), "{label}");
            }
        }
    }

    #[tokio::test]
    async fn ticket_failure_is_surfaced_not_raised() {
        let doubles = Doubles::new(Some(Intent::ItGuidelines), vec![]);
        doubles.tickets.fail(true);
        let stage = PostprocessStage {
            tickets: doubles.tickets.clone(),
        };
        let state = stage
            .run(evaluated(Some(Intent::ItGuidelines), Some(true)))
            .await
            .unwrap();
        let response = state.final_response.unwrap();
        assert!(response.ticket_id.is_none());
        assert!(response.ticket_error.unwrap().contains("ticket system failed"));
    }

    #[tokio::test]
    async fn postprocess_refuses_a_second_final_response() {
        let doubles = Doubles::new(None, vec![]);
        let stage = PostprocessStage {
            tickets: doubles.tickets.clone(),
        };
        let mut state = evaluated(None, Some(true));
        state.final_response = Some(FinalResponse::default());
        let err = stage.run(state).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn collaborator_failures_degrade_to_fallbacks() {
        let doubles = Doubles::new(Some(Intent::HrPolicy), vec![]);
        doubles.classifier.fail(true);
        doubles.retriever.fail(true);
        doubles.generator.fail(true);
        doubles.evaluator.fail(true);
        let collaborators = doubles.collaborators();
        let registry = StageRegistry::standard(&collaborators, None, &PipelineConfig::default());

        let mut state = PipelineState::new("What is the leave policy?");
        for step in [Step::Intent, Step::Retrieve, Step::Generate, Step::Evaluate] {
            state = registry.get(step).unwrap().run(state).await.unwrap();
        }

        assert_eq!(state.intent, None);
        assert_eq!(state.retrieved_docs, Some(vec![]));
        assert_eq!(state.kb_answer.as_deref(), Some(""));
        assert_eq!(state.eval_sufficient, Some(false));
        assert_eq!(state.eval_confidence, None);
        assert!(state.eval_reason.unwrap().starts_with("evaluation unavailable:"));
    }

    #[tokio::test]
    async fn generation_context_is_capped() {
        let doubles = Doubles::new(Some(Intent::HrPolicy), vec![]);
        let stage = GenerateStage {
            generator: doubles.generator.clone(),
            max_context_docs: 3,
        };
        let mut state = PipelineState::new("q");
        state.retrieved_docs = Some((0..7).map(|i| Document::new(format!("doc {i}"))).collect());
        stage.run(state).await.unwrap();
        assert_eq!(doubles.generator.context_sizes(), [3]);
    }

    #[tokio::test]
    async fn reflection_failure_restores_pre_retry_state() {
        let doubles = Doubles::new(Some(Intent::HrPolicy), vec![verdict(0.95, true, "better")]);
        doubles.generator.fail(true);
        let stage = ReflectStage {
            retriever: doubles.retriever.clone(),
            generator: doubles.generator.clone(),
            evaluator: doubles.evaluator.clone(),
            k: 20,
            max_context_docs: 3,
        };
        let mut before = evaluated(Some(Intent::HrPolicy), Some(false));
        before.eval_confidence = Some(0.4);

        let after = stage.run(before.clone()).await.unwrap();
        assert!(after.reflected);
        assert_eq!(after.retrieved_docs, before.retrieved_docs);
        assert_eq!(after.kb_answer, before.kb_answer);
        assert_eq!(after.eval_confidence, Some(0.4));
        assert_eq!(after.eval_sufficient, Some(false));
        assert_eq!(doubles.retriever.ks(), [20]);
    }

    #[tokio::test]
    async fn non_finite_confidence_falls_back_like_a_failed_evaluation() {
        for confidence in [f64::NAN, f64::INFINITY] {
            let doubles = Doubles::new(Some(Intent::HrPolicy), vec![verdict(confidence, true, "ok")]);
            let stage = EvaluateStage {
                evaluator: doubles.evaluator.clone(),
            };
            let state = stage
                .run(evaluated(Some(Intent::HrPolicy), None))
                .await
                .unwrap();
            assert_eq!(state.eval_confidence, None, "{confidence}");
            assert_eq!(state.eval_sufficient, Some(false), "{confidence}");
            assert!(
                state.eval_reason.unwrap().starts_with("evaluation unavailable:"),
                "{confidence}"
            );
        }
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_clamped() {
        let doubles = Doubles::new(Some(Intent::HrPolicy), vec![verdict(1.4, true, "sure")]);
        let stage = EvaluateStage {
            evaluator: doubles.evaluator.clone(),
        };
        let state = stage.run(evaluated(Some(Intent::HrPolicy), None)).await.unwrap();
        assert_eq!(state.eval_confidence, Some(1.0));
    }

    #[tokio::test]
    async fn non_finite_retry_verdict_keeps_pre_retry_state() {
        let doubles = Doubles::new(Some(Intent::HrPolicy), vec![verdict(f64::NAN, true, "ok")]);
        let stage = ReflectStage {
            retriever: doubles.retriever.clone(),
            generator: doubles.generator.clone(),
            evaluator: doubles.evaluator.clone(),
            k: 20,
            max_context_docs: 3,
        };
        let mut before = evaluated(Some(Intent::HrPolicy), Some(false));
        before.eval_confidence = Some(0.4);

        let after = stage.run(before.clone()).await.unwrap();
        assert!(after.reflected);
        assert_eq!(after.retrieved_docs, before.retrieved_docs);
        assert_eq!(after.eval_confidence, Some(0.4));
        assert_eq!(after.eval_sufficient, Some(false));
    }

    #[tokio::test]
    async fn missing_stage_is_an_invariant_violation() {
        let registry = StageRegistry::new();
        let err = registry.get(Step::Intent).err().expect("empty registry");
        assert!(err.is_fatal());
    }
}
