//! Batch classification through an LLM.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClassificationError;
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};

const CLASSIFY_TEMPERATURE: f32 = 0.2;
const CLASSIFY_MAX_TOKENS: u32 = 2048;

/// One message as presented to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyInput {
    pub id: i64,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub excerpt: String,
}

/// Classifier verdict for one input id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub id: i64,
    pub category: String,
    pub urgency: String,
    pub summary: String,
}

/// Classifies a whole batch in one call.
///
/// The result may omit inputs or contain ids that were never asked about.
/// Callers join by id.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        batch: &[ClassifyInput],
    ) -> Result<Vec<Classification>, ClassificationError>;
}

pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        batch: &[ClassifyInput],
    ) -> Result<Vec<Classification>, ClassificationError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(batch)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        if response.finish_reason == FinishReason::Length {
            warn!(
                model = self.llm.model_name(),
                output_tokens = response.output_tokens,
                "Classification output hit the token limit"
            );
        }

        let parsed = parse_classifications(&response.content).map_err(|e| {
            warn!(raw_response = %response.content, error = %e, "Unparseable classification response");
            ClassificationError::Malformed(e)
        })?;
        debug!(
            requested = batch.len(),
            returned = parsed.len(),
            input_tokens = response.input_tokens,
            "Batch classified"
        );
        Ok(parsed)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are an email triage assistant. For each email you are given, assign a category, \
     an urgency and a short action-oriented summary.\n\n\
     Respond with ONLY a JSON array, one object per email:\n\
     [{\"id\": <id>, \"category\": \"Work|Personal|Newsletter|Transactional\", \"urgency\": \"1-5\", \"summary\": \"...\"}]\n\n\
     Rules:\n\
     - Use the id exactly as given\n\
     - urgency is 1 (can wait) to 5 (act now)\n\
     - Summaries focus on the content and the next step, 25 words max\n\
     - Use the Content field, not just the subject"
        .to_string()
}

fn build_user_prompt(batch: &[ClassifyInput]) -> String {
    let mut prompt = format!("Analyze these {} emails.\n\nEMAILS:\n", batch.len());
    for input in batch {
        prompt.push_str(&format!(
            "ID: {}\nSender: {}\nSubject: {}\nContent: {}\n---\n",
            input.id,
            input.sender.as_deref().unwrap_or(""),
            input.subject.as_deref().unwrap_or(""),
            input.excerpt
        ));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawClassification {
    id: Value,
    #[serde(default)]
    category: Value,
    #[serde(default)]
    urgency: Value,
    #[serde(default)]
    summary: Value,
}

/// Parse the model output into classifications.
///
/// The outer shape must be a JSON array. Entries without a usable id are
/// dropped, which leaves their message unclassified for this batch.
fn parse_classifications(raw: &str) -> Result<Vec<Classification>, String> {
    let json_str = extract_json_array(raw);
    let entries: Vec<Value> =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let parsed = match serde_json::from_value::<RawClassification>(entry) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Skipping classification entry");
                continue;
            }
        };
        let Some(id) = value_as_id(&parsed.id) else {
            debug!(id = %parsed.id, "Skipping classification entry with unusable id");
            continue;
        };
        out.push(Classification {
            id,
            category: value_as_text(&parsed.category),
            urgency: value_as_text(&parsed.urgency),
            summary: value_as_text(&parsed.summary),
        });
    }
    Ok(out)
}

/// Ids come back as numbers or numeric strings.
fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Extract a JSON array from text that may wrap it in markdown or prose.
fn extract_json_array(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;
    use std::sync::Mutex;

    struct CannedLlm {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    impl CannedLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn throttled() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.prompts.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    content: text.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(LlmError::RateLimited {
                    provider: "canned".into(),
                    retry_after: None,
                }),
            }
        }
    }

    fn input(id: i64) -> ClassifyInput {
        ClassifyInput {
            id,
            sender: Some("ops@example.com".into()),
            subject: Some("Deploy failed".into()),
            excerpt: "The 14:00 deploy failed on step 3.".into(),
        }
    }

    #[test]
    fn user_prompt_lists_every_email() {
        let prompt = build_user_prompt(&[input(7), input(8)]);
        assert!(prompt.starts_with("Analyze these 2 emails."));
        assert!(prompt.contains("ID: 7\nSender: ops@example.com\nSubject: Deploy failed\nContent: The 14:00 deploy failed on step 3.\n---"));
        assert!(prompt.contains("ID: 8\n"));
    }

    #[test]
    fn parses_plain_array() {
        let raw = r#"[{"id": 7, "category": "Work", "urgency": "4", "summary": "Fix the deploy."}]"#;
        let parsed = parse_classifications(raw).unwrap();
        assert_eq!(
            parsed,
            vec![Classification {
                id: 7,
                category: "Work".into(),
                urgency: "4".into(),
                summary: "Fix the deploy.".into(),
            }]
        );
    }

    #[test]
    fn accepts_string_ids_and_numeric_urgency() {
        let raw = r#"[{"id": "7", "category": "Work", "urgency": 5, "summary": "x"}]"#;
        let parsed = parse_classifications(raw).unwrap();
        assert_eq!(parsed[0].id, 7);
        assert_eq!(parsed[0].urgency, "5");
    }

    #[test]
    fn parses_markdown_wrapped_array() {
        let raw = "Here you go:\n```json\n[{\"id\": 1, \"category\": \"Personal\", \"urgency\": \"1\", \"summary\": \"Hi\"}]\n```";
        assert_eq!(parse_classifications(raw).unwrap().len(), 1);
    }

    #[test]
    fn parses_array_embedded_in_prose() {
        let raw = "Sure! [{\"id\": 2, \"category\": \"Newsletter\", \"urgency\": \"1\", \"summary\": \"s\"}] Hope that helps.";
        assert_eq!(parse_classifications(raw).unwrap()[0].id, 2);
    }

    #[test]
    fn entries_without_usable_id_are_dropped() {
        let raw = r#"[{"id": "abc", "category": "Work"}, {"category": "Work"}, {"id": 3, "category": "Work", "urgency": "2", "summary": "ok"}]"#;
        let parsed = parse_classifications(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, 3);
    }

    #[test]
    fn non_array_is_malformed() {
        assert!(parse_classifications("I cannot help with that.").is_err());
        assert!(parse_classifications(r#"{"id": 1}"#).is_err());
    }

    #[tokio::test]
    async fn classify_sends_one_request_per_batch() {
        let llm = CannedLlm::new(r#"[{"id": 7, "category": "Work", "urgency": "3", "summary": "s"}]"#);
        let classifier = LlmClassifier::new(llm.clone());

        let out = classifier.classify(&[input(7), input(8)]).await.unwrap();
        assert_eq!(out.len(), 1);

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].system_prompt().unwrap().contains("JSON array"));
    }

    #[tokio::test]
    async fn malformed_output_is_classification_error() {
        let classifier = LlmClassifier::new(CannedLlm::new("not json at all"));
        let err = classifier.classify(&[input(1)]).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn quota_errors_stay_transient() {
        let classifier = LlmClassifier::new(CannedLlm::throttled());
        let err = classifier.classify(&[input(1)]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn empty_batch_skips_the_call() {
        let llm = CannedLlm::new("[]");
        let classifier = LlmClassifier::new(llm.clone());
        assert!(classifier.classify(&[]).await.unwrap().is_empty());
        assert!(llm.prompts.lock().unwrap().is_empty());
    }
}
