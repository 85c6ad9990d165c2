use crate::errors::{AppError, Result};
use ::llm::builder::{LLMBackend, LLMBuilder};
use ::llm::chat::ChatMessage;
use async_trait::async_trait;
use podlens_core::context::AssistantContext;
use tracing::{debug, error};

const SYSTEM_PROMPT: &str = "You are a Kubernetes operations assistant. \
Each message carries a JSON document describing the workload the operator is \
looking at: downsampled cpu, memory and latency history, the current pod \
status records and the configured requests and limits. Values shown as N/A \
were not reported by the monitoring backend. Answer the operator's question \
from that data, cite the numbers you rely on and say so when the data is not \
enough to answer.";

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn answer(&self, context: &AssistantContext, question: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LLMBackend,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub struct LlmAssistant {
    llm: Box<dyn ::llm::LLMProvider>,
}

impl LlmAssistant {
    pub fn try_new(config: &LlmConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() || config.model.trim().is_empty() {
            return Err(AppError::assistant_disabled());
        }

        let mut builder = LLMBuilder::new()
            .backend(config.backend.clone())
            .model(config.model.clone())
            .timeout_seconds(config.timeout_secs)
            .normalize_response(true)
            .system(SYSTEM_PROMPT)
            .base_url(config.base_url.clone());
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let llm = builder
            .build()
            .map_err(|err| AppError::assistant(format!("cannot build LLM client: {err}")))?;
        Ok(Self { llm })
    }
}

pub fn user_message(context: &AssistantContext, question: &str) -> Result<String> {
    let context = context.to_json()?;
    Ok(format!("Context:\n{context}\n\nQuestion: {}", question.trim()))
}

#[async_trait]
impl Assistant for LlmAssistant {
    async fn answer(&self, context: &AssistantContext, question: &str) -> Result<String> {
        let body = user_message(context, question)?;
        debug!("Assistant prompt: {} bytes", body.len());
        let messages = vec![ChatMessage::user().content(body).build()];
        let response = self.llm.chat(&messages).await.map_err(|err| {
            error!("LLM request failed: {err}");
            AppError::assistant(err.to_string())
        })?;
        let text = response
            .text()
            .ok_or_else(|| AppError::assistant("LLM response missing text"))?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use podlens_core::context::SeriesContext;

    fn series(metric: &str) -> SeriesContext {
        SeriesContext {
            metric: metric.to_string(),
            entity: Some("api-1".to_string()),
            points: vec![],
        }
    }

    fn context() -> AssistantContext {
        AssistantContext {
            entity: Some("api-1".to_string()),
            namespace: Some("default".to_string()),
            cpu_history: series("cpu_usage"),
            memory_history: series("memory_usage"),
            latency_history: series("combined_latency"),
            status: vec![],
            requests_limits: vec![],
        }
    }

    #[test]
    fn user_message_carries_context_and_question() {
        let body = user_message(&context(), "  why is api-1 restarting?\n").unwrap();
        assert!(body.starts_with("Context:\n{"));
        assert!(body.contains("\"entity\": \"api-1\""));
        assert!(body.ends_with("Question: why is api-1 restarting?"));
    }

    #[test]
    fn missing_model_disables_assistant() {
        let config = LlmConfig {
            backend: LLMBackend::OpenAI,
            base_url: "http://localhost:11434".to_string(),
            model: " ".to_string(),
            api_key: None,
            timeout_secs: 5,
        };
        let err = LlmAssistant::try_new(&config).err().expect("disabled");
        assert!(matches!(err.kind(), ErrorKind::AssistantDisabled));
    }
}
