//! Core domain types threaded through the helpdesk pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HelpdeskError, Result};

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// Query category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    #[serde(rename = "HR_Policy")]
    HrPolicy,
    #[serde(rename = "IT_guidelines")]
    ItGuidelines,
}

impl Intent {
    /// Wire label, also used as the `intent` metadata filter on documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HrPolicy => "HR_Policy",
            Self::ItGuidelines => "IT_guidelines",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = HelpdeskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "HR_Policy" => Ok(Self::HrPolicy),
            "IT_guidelines" => Ok(Self::ItGuidelines),
            other => Err(HelpdeskError::validation(format!("unknown intent '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A retrieved knowledge-base passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Passage text.
    pub content: String,
    /// Free-form metadata (source, page, intent label, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Document {
    /// Create a document without metadata.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style metadata insertion.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Positions of the pipeline state machine.
///
/// `Input` is the position before any stage ran; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Input,
    Intent,
    Retrieve,
    Generate,
    Evaluate,
    Reflect,
    Postprocess,
    Done,
}

impl Step {
    /// Stable name, used for task ids and checkpoint metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Intent => "intent",
            Self::Retrieve => "retrieve",
            Self::Generate => "generate",
            Self::Evaluate => "evaluate",
            Self::Reflect => "reflect",
            Self::Postprocess => "postprocess",
            Self::Done => "done",
        }
    }

    /// State channels a stage at this step writes.
    pub fn channels(&self) -> &'static [&'static str] {
        match self {
            Self::Input => &["user_query"],
            Self::Intent => &["intent"],
            Self::Retrieve => &["retrieved_docs"],
            Self::Generate => &["kb_answer"],
            Self::Evaluate => &["eval_confidence", "eval_sufficient", "eval_reason"],
            Self::Reflect => &[
                "retrieved_docs",
                "kb_answer",
                "eval_confidence",
                "eval_sufficient",
                "eval_reason",
                "reflected",
            ],
            Self::Postprocess => &["final_response"],
            Self::Done => &[],
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Step {
    type Err = HelpdeskError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "input" => Self::Input,
            "intent" => Self::Intent,
            "retrieve" => Self::Retrieve,
            "generate" => Self::Generate,
            "evaluate" => Self::Evaluate,
            "reflect" => Self::Reflect,
            "postprocess" => Self::Postprocess,
            "done" => Self::Done,
            other => return Err(HelpdeskError::validation(format!("unknown step '{other}'"))),
        })
    }
}

// ---------------------------------------------------------------------------
// FinalResponse
// ---------------------------------------------------------------------------

/// The run's observable outcome. Serializes as a flat JSON object; absent
/// fields are omitted rather than written as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set only when the run failed and this response is best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The record threaded through every stage of one run.
///
/// Stages take it by value and hand it back, so exactly one owner exists at
/// any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub user_query: String,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub retrieved_docs: Option<Vec<Document>>,
    #[serde(default)]
    pub kb_answer: Option<String>,
    #[serde(default)]
    pub eval_confidence: Option<f64>,
    #[serde(default)]
    pub eval_sufficient: Option<bool>,
    #[serde(default)]
    pub eval_reason: Option<String>,
    /// Whether the reflection retry has been attempted in this run.
    #[serde(default)]
    pub reflected: bool,
    #[serde(default)]
    pub final_response: Option<FinalResponse>,
}

impl PipelineState {
    /// Fresh state for a new run.
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            ..Default::default()
        }
    }

    /// Whether the evaluation calls for the single reflection retry.
    ///
    /// An absent sufficiency verdict counts as insufficient.
    pub fn needs_reflection(&self, threshold: f64) -> bool {
        let insufficient = self.eval_sufficient != Some(true);
        let low_confidence = self.eval_confidence.is_some_and(|c| c < threshold);
        insufficient || low_confidence
    }

    /// Record the terminal response. A second write is an invariant violation.
    pub fn set_final_response(&mut self, response: FinalResponse) -> Result<()> {
        if self.final_response.is_some() {
            return Err(HelpdeskError::malformed("final_response written twice"));
        }
        self.final_response = Some(response);
        Ok(())
    }

    /// Check the ordering invariants a stage at `step` strictly depends on.
    pub fn check_ready(&self, step: Step) -> Result<()> {
        let missing = |field: &str| {
            Err(HelpdeskError::malformed(format!(
                "{step} reached without {field}"
            )))
        };
        if step > Step::Retrieve && self.retrieved_docs.is_none() {
            return missing("retrieved_docs");
        }
        if step > Step::Generate && self.kb_answer.is_none() {
            return missing("kb_answer");
        }
        if step == Step::Reflect && self.reflected {
            return Err(HelpdeskError::malformed("reflection already attempted"));
        }
        if step == Step::Postprocess && self.final_response.is_some() {
            return Err(HelpdeskError::malformed("final_response already set"));
        }
        if step == Step::Done && self.final_response.is_none() {
            return missing("final_response");
        }
        Ok(())
    }

    /// Serialize a single channel (field) for a pending write.
    pub fn channel_value(&self, channel: &str) -> Result<Value> {
        let value = match channel {
            "user_query" => serde_json::to_value(&self.user_query)?,
            "intent" => serde_json::to_value(self.intent)?,
            "retrieved_docs" => serde_json::to_value(&self.retrieved_docs)?,
            "kb_answer" => serde_json::to_value(&self.kb_answer)?,
            "eval_confidence" => serde_json::to_value(self.eval_confidence)?,
            "eval_sufficient" => serde_json::to_value(self.eval_sufficient)?,
            "eval_reason" => serde_json::to_value(&self.eval_reason)?,
            "reflected" => serde_json::to_value(self.reflected)?,
            "final_response" => serde_json::to_value(&self.final_response)?,
            other => return Err(HelpdeskError::malformed(format!("unknown channel '{other}'"))),
        };
        Ok(value)
    }

    /// Apply a recorded channel value back onto the state.
    pub fn apply_write(&mut self, channel: &str, value: Value) -> Result<()> {
        match channel {
            "user_query" => self.user_query = serde_json::from_value(value)?,
            "intent" => self.intent = serde_json::from_value(value)?,
            "retrieved_docs" => self.retrieved_docs = serde_json::from_value(value)?,
            "kb_answer" => self.kb_answer = serde_json::from_value(value)?,
            "eval_confidence" => self.eval_confidence = serde_json::from_value(value)?,
            "eval_sufficient" => self.eval_sufficient = serde_json::from_value(value)?,
            "eval_reason" => self.eval_reason = serde_json::from_value(value)?,
            "reflected" => self.reflected = serde_json::from_value(value)?,
            "final_response" => self.final_response = serde_json::from_value(value)?,
            other => return Err(HelpdeskError::malformed(format!("unknown channel '{other}'"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_wire_labels() {
        let json = serde_json::to_string(&Intent::ItGuidelines).unwrap();
        assert_eq!(json, r#""IT_guidelines""#);
        let parsed: Intent = serde_json::from_str(r#""HR_Policy""#).unwrap();
        assert_eq!(parsed, Intent::HrPolicy);
        assert!("Finance".parse::<Intent>().is_err());
    }

    #[test]
    fn reflection_trigger() {
        let mut state = PipelineState::new("q");
        state.eval_sufficient = Some(true);
        state.eval_confidence = Some(0.9);
        assert!(!state.needs_reflection(0.8));

        state.eval_confidence = Some(0.8);
        assert!(!state.needs_reflection(0.8), "threshold itself is sufficient");

        state.eval_confidence = Some(0.79);
        assert!(state.needs_reflection(0.8));

        state.eval_confidence = None;
        assert!(!state.needs_reflection(0.8));

        state.eval_sufficient = Some(false);
        state.eval_confidence = Some(0.95);
        assert!(state.needs_reflection(0.8));

        state.eval_sufficient = None;
        assert!(state.needs_reflection(0.8));
    }

    #[test]
    fn final_response_is_written_once() {
        let mut state = PipelineState::new("q");
        state.set_final_response(FinalResponse::default()).unwrap();
        let err = state.set_final_response(FinalResponse::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn ordering_invariants() {
        let mut state = PipelineState::new("q");
        assert!(state.check_ready(Step::Intent).is_ok());
        assert!(state.check_ready(Step::Retrieve).is_ok());
        assert!(state.check_ready(Step::Generate).unwrap_err().is_fatal());

        state.retrieved_docs = Some(vec![]);
        assert!(state.check_ready(Step::Generate).is_ok());
        assert!(state.check_ready(Step::Evaluate).is_err());

        state.kb_answer = Some(String::new());
        assert!(state.check_ready(Step::Postprocess).is_ok());
        assert!(state.check_ready(Step::Done).is_err());

        state.reflected = true;
        assert!(state.check_ready(Step::Reflect).is_err());
    }

    #[test]
    fn channel_roundtrip_restores_fields() {
        let mut source = PipelineState::new("reset vpn");
        source.intent = Some(Intent::ItGuidelines);
        source.retrieved_docs = Some(vec![Document::new("VPN guide").with_meta("page", 4)]);
        source.eval_confidence = Some(0.4);

        let mut target = PipelineState::new("reset vpn");
        for channel in ["intent", "retrieved_docs", "eval_confidence"] {
            let value = source.channel_value(channel).unwrap();
            target.apply_write(channel, value).unwrap();
        }
        assert_eq!(target, source);
        assert!(target.apply_write("bogus", Value::Null).is_err());
    }

    #[test]
    fn final_response_omits_absent_fields() {
        let response = FinalResponse {
            answer: "Use the self-service portal.".into(),
            ticket_id: Some("TICKET-1234".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&response).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.get("escalation").is_none());
    }

    #[test]
    fn step_names_roundtrip() {
        for step in [Step::Input, Step::Reflect, Step::Done] {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
        }
        assert!(Step::Evaluate < Step::Reflect);
        assert!(Step::Reflect < Step::Postprocess);
    }
}
