//! Bridges rig-core's `CompletionModel` onto [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let provider = self.provider;
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let preamble = request.system_prompt();

        let mut history: Vec<Message> = request
            .messages
            .into_iter()
            .filter_map(|m| match m.role {
                Role::System => None,
                Role::User => Some(Message::user(m.content)),
                Role::Assistant => Some(Message::assistant(m.content)),
            })
            .collect();
        let prompt = history.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: "request has no user or assistant message".to_string(),
        })?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .max_tokens(u64::from(max_tokens));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(provider, &e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: provider.to_string(),
                reason: "completion contained no text".to_string(),
            });
        }

        let input_tokens = saturate(response.usage.input_tokens);
        let output_tokens = saturate(response.usage.output_tokens);
        let finish_reason = if output_tokens >= max_tokens {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };

        tracing::debug!(
            model = %self.model_name,
            input_tokens,
            output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
        })
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn map_completion_error(provider: &str, error: &CompletionError) -> LlmError {
    classify_error(provider, &error.to_string())
}

/// rig surfaces provider failures as text; the status code and the
/// provider's error type are the only stable signals in it.
fn classify_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_ascii_lowercase();
    let provider = provider.to_string();

    if ["429", "529", "rate limit", "rate_limit", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return LlmError::RateLimited {
            provider,
            retry_after: None,
        };
    }
    if ["401", "403", "authentication", "invalid x-api-key", "invalid_api_key"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return LlmError::AuthFailed { provider };
    }
    LlmError::RequestFailed {
        provider,
        reason: message.to_string(),
    }
}
