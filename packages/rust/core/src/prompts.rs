//! Prompt templates for the model-backed collaborators.

use helpdesk_shared::Document;

/// Classify a query into exactly one intent label.
pub fn intent_prompt(question: &str) -> String {
    format!(
        r#"Classify the following user query into exactly ONE of the two categories below:

- HR_Policy: office timing, working hours, attendance, leave policy, holidays, maternity/paternity leave, appraisal, salary, HR rules
- IT_guidelines: laptop issues, VPN, email, password reset, software access, system issues, network, hardware

Rules:
- Questions about office timing or working hours MUST be classified as HR_Policy.
- You MUST respond ONLY in valid JSON with the key "Intent".
- Do NOT add any explanation.

Examples:
{{"Intent": "HR_Policy"}}

Question: {question}
"#
    )
}

/// Answer strictly from the supplied context.
pub fn rag_prompt(question: &str, context: &[Document]) -> String {
    let context = context
        .iter()
        .map(|doc| doc.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"You are a strict RAG assistant. Only answer based on the given context.
Do not use any external knowledge or make assumptions.

Context:
{context}

Question:
{question}

Return ONLY a JSON object with field {{answer}}.
"#
    )
}

/// Grade an answer for sufficiency and confidence.
pub fn evaluation_prompt(question: &str, answer: &str) -> String {
    format!(
        r#"Evaluate if the ANSWER fully and correctly matches CONTEXT.
No hallucinations allowed. Return structured fields: confidence (0-1), sufficient (bool), reason (short).
User: {question}
Answer: {answer}
"#
    )
}
