//! Ollama-backed classifier, generator and evaluator.
//!
//! Every call goes to `POST /api/chat` with `stream: false` and a JSON schema
//! in `format`, so the model's reply content is a single JSON object.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use helpdesk_shared::{Document, HelpdeskError, Intent, OllamaConfig, Result};

use crate::collaborators::{
    Classification, Classifier, Evaluation, Evaluator, Generation, Generator,
};
use crate::prompts;

/// User-Agent string for model requests.
const USER_AGENT: &str = concat!("helpdesk/", env!("CARGO_PKG_VERSION"));

/// Client for a local or remote Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    chat_url: Url,
    model: String,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct IntentReply {
    #[serde(rename = "Intent")]
    intent: String,
}

#[derive(Debug, Deserialize)]
struct AnswerReply {
    answer: String,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let chat_url = config
            .base_url()?
            .join("api/chat")
            .map_err(|e| HelpdeskError::config(format!("invalid ollama base_url: {e}")))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HelpdeskError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            chat_url,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Send one prompt and decode the structured reply.
    async fn chat<T: DeserializeOwned>(
        &self,
        collaborator: &'static str,
        prompt: String,
        schema: Value,
    ) -> Result<T> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
            "format": schema,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(self.chat_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| HelpdeskError::collaborator(collaborator, format!("{}: {e}", self.chat_url)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(HelpdeskError::collaborator(
                collaborator,
                format!("HTTP {status}: {}", detail.trim()),
            ));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            HelpdeskError::collaborator(collaborator, format!("unreadable chat response: {e}"))
        })?;
        debug!(collaborator, chars = chat.message.content.len(), "model replied");

        serde_json::from_str(&chat.message.content).map_err(|e| {
            HelpdeskError::collaborator(
                collaborator,
                format!("reply does not match the requested schema: {e}"),
            )
        })
    }
}

#[async_trait]
impl Classifier for OllamaClient {
    async fn classify(&self, query: &str) -> Result<Classification> {
        let schema = json!({
            "type": "object",
            "properties": {
                "Intent": { "type": "string", "enum": ["HR_Policy", "IT_guidelines"] }
            },
            "required": ["Intent"]
        });
        let reply: IntentReply = self
            .chat("classifier", prompts::intent_prompt(query), schema)
            .await?;

        let intent = match reply.intent.parse::<Intent>() {
            Ok(intent) => Some(intent),
            Err(_) => {
                info!(label = %reply.intent, "classifier returned an unknown intent");
                None
            }
        };
        Ok(Classification { intent })
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, query: &str, context: &[Document]) -> Result<Generation> {
        let schema = json!({
            "type": "object",
            "properties": { "answer": { "type": "string" } },
            "required": ["answer"]
        });
        let reply: AnswerReply = self
            .chat("generator", prompts::rag_prompt(query, context), schema)
            .await?;
        Ok(Generation {
            answer: reply.answer,
        })
    }
}

#[async_trait]
impl Evaluator for OllamaClient {
    async fn evaluate(&self, query: &str, answer: &str) -> Result<Evaluation> {
        let schema = json!({
            "type": "object",
            "properties": {
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                "sufficient": { "type": "boolean" },
                "reason": { "type": "string" }
            },
            "required": ["confidence", "sufficient", "reason"]
        });
        let mut verdict: Evaluation = self
            .chat("evaluator", prompts::evaluation_prompt(query, answer), schema)
            .await?;
        if !verdict.confidence.is_finite() {
            return Err(HelpdeskError::collaborator("evaluator", "confidence is not a number"));
        }
        verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        let config = OllamaConfig {
            base_url: server.uri(),
            timeout_secs: 5,
            ..Default::default()
        };
        OllamaClient::new(&config).unwrap()
    }

    fn reply(content: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "model": "qwen2.5:latest",
            "message": { "role": "assistant", "content": content.to_string() },
            "done": true
        }))
    }

    #[tokio::test]
    async fn classify_parses_structured_intent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({ "stream": false, "model": "qwen2.5:latest" })))
            .respond_with(reply(json!({ "Intent": "IT_guidelines" })))
            .expect(1)
            .mount(&server)
            .await;

        let classification = client_for(&server)
            .classify("How can I reset my Outlook password?")
            .await
            .unwrap();
        assert_eq!(classification.intent, Some(Intent::ItGuidelines));
    }

    #[tokio::test]
    async fn unknown_intent_label_means_unclassified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(reply(json!({ "Intent": "Finance" })))
            .mount(&server)
            .await;

        let classification = client_for(&server).classify("expense report?").await.unwrap();
        assert_eq!(classification.intent, None);
    }

    #[tokio::test]
    async fn evaluation_confidence_is_clamped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(reply(json!({ "confidence": 1.7, "sufficient": true, "reason": "exact" })))
            .mount(&server)
            .await;

        let verdict = client_for(&server).evaluate("q", "a").await.unwrap();
        assert_eq!(verdict.confidence, 1.0);
        assert!(verdict.sufficient);
        assert_eq!(verdict.reason, "exact");
    }

    #[tokio::test]
    async fn generate_returns_answer_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(reply(json!({ "answer": "Use the self-service portal." })))
            .mount(&server)
            .await;

        let generation = client_for(&server)
            .generate("reset password?", &[Document::new("Self-service portal resets passwords.")])
            .await
            .unwrap();
        assert_eq!(generation.answer, "Use the self-service portal.");
    }

    #[tokio::test]
    async fn http_error_is_a_collaborator_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).generate("q", &[]).await.unwrap_err();
        match err {
            HelpdeskError::Collaborator { collaborator, message } => {
                assert_eq!(collaborator, "generator");
                assert!(message.contains("500"));
                assert!(message.contains("model not loaded"));
            }
            other => panic!("expected collaborator failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn schema_mismatch_is_a_collaborator_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(reply(json!({ "verdict": "fine" })))
            .mount(&server)
            .await;

        let err = client_for(&server).evaluate("q", "a").await.unwrap_err();
        assert!(err.to_string().starts_with("evaluator failed"));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = OllamaConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(OllamaClient::new(&config), Err(HelpdeskError::Config { .. })));
    }
}
