//! Narrow interfaces to the external services a run depends on.
//!
//! Each collaborator returns an explicit result type. Failures surface as
//! [`HelpdeskError::Collaborator`](helpdesk_shared::HelpdeskError::Collaborator)
//! and are absorbed by the stage that called it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use helpdesk_shared::{Document, Intent, Result};

/// Outcome of intent classification. `None` means "unclassified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub intent: Option<Intent>,
}

/// A generated answer grounded in retrieved context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Generation {
    pub answer: String,
}

/// Quality verdict on a generated answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// In `[0, 1]`.
    pub confidence: f64,
    pub sufficient: bool,
    pub reason: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<Classification>;
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` documents for `query`, best first, restricted to `intent` when given.
    async fn retrieve(&self, query: &str, intent: Option<Intent>, k: usize) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Answer `query` from `context` only. Callers bound `context` beforehand.
    async fn generate(&self, query: &str, context: &[Document]) -> Result<Generation>;
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, query: &str, answer: &str) -> Result<Evaluation>;
}

#[async_trait]
pub trait TicketSystem: Send + Sync {
    /// Open a ticket and return its id.
    async fn create_ticket(&self, summary: &str) -> Result<String>;
}

/// The full set of collaborators a pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub retriever: Arc<dyn Retriever>,
    pub generator: Arc<dyn Generator>,
    pub evaluator: Arc<dyn Evaluator>,
    pub tickets: Arc<dyn TicketSystem>,
}
