//! Collaborators that run entirely in-process: a JSON document corpus and a
//! mock ticket desk.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use helpdesk_shared::{Document, HelpdeskError, Intent, Result};

use crate::collaborators::{Retriever, TicketSystem};

/// Metadata key carrying a document's intent label.
const INTENT_KEY: &str = "intent";

/// Ranks a fixed corpus by query-term overlap.
///
/// Documents tagged with an `intent` metadata value are only returned for
/// queries classified with that intent; untagged documents always qualify.
#[derive(Debug, Clone, Default)]
pub struct CorpusRetriever {
    documents: Vec<Document>,
}

impl CorpusRetriever {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// Load a JSON array of documents.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| HelpdeskError::io(path, e))?;
        let documents: Vec<Document> = serde_json::from_str(&raw).map_err(|e| {
            HelpdeskError::config(format!("invalid corpus at {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), documents = documents.len(), "corpus loaded");
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn matches_intent(doc: &Document, intent: Option<Intent>) -> bool {
    match (intent, doc.metadata.get(INTENT_KEY).and_then(|v| v.as_str())) {
        (Some(intent), Some(label)) => label == intent.as_str(),
        _ => true,
    }
}

#[async_trait]
impl Retriever for CorpusRetriever {
    async fn retrieve(&self, query: &str, intent: Option<Intent>, k: usize) -> Result<Vec<Document>> {
        let wanted = terms(query);
        let mut scored: Vec<(usize, &Document)> = self
            .documents
            .iter()
            .filter(|doc| matches_intent(doc, intent))
            .map(|doc| (terms(&doc.content).intersection(&wanted).count(), doc))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let docs: Vec<Document> = scored.into_iter().take(k).map(|(_, d)| d.clone()).collect();
        debug!(k, returned = docs.len(), ?intent, "corpus search");
        Ok(docs)
    }
}

/// Ticket desk that only logs. Ids look like `TICKET-4821`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTicketSystem;

#[async_trait]
impl TicketSystem for LocalTicketSystem {
    async fn create_ticket(&self, summary: &str) -> Result<String> {
        let number = 1000 + (Uuid::now_v7().as_u128() % 9000);
        let ticket_id = format!("TICKET-{number}");
        info!(%ticket_id, summary, "ticket created");
        Ok(ticket_id)
    }
}
