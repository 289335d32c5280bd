//! Checkpointed pipeline engine for the helpdesk assistant.
//!
//! A query runs through intent classification, retrieval, generation and
//! evaluation, with at most one reflection retry, and ends in post-processing
//! that decides on escalation and ticketing. The [`Executor`] persists a
//! checkpoint after every stage so an interrupted run can be resumed.

pub mod cache;
pub mod collaborators;
pub mod executor;
pub mod local;
pub mod ollama;
pub mod prompts;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::ResultCache;
pub use collaborators::{
    Classification, Classifier, Collaborators, Evaluation, Evaluator, Generation, Generator,
    Retriever, TicketSystem,
};
pub use executor::{Executor, ProgressReporter, RunOutcome, SilentProgress};
pub use local::{CorpusRetriever, LocalTicketSystem};
pub use ollama::OllamaClient;
pub use stages::{ESCALATION_ANSWER, ESCALATION_NOTE, Stage, StageRegistry};
