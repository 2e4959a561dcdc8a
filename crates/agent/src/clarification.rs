use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use intake_core::errors::OracleError;
use intake_core::ports::ClarificationGenerator;

use crate::llm::{classify_error, LlmClient};

const CLARIFICATION_TEMPERATURE: f32 = 0.7;

const CLARIFICATION_SYSTEM_PROMPT: &str = "You are a person corresponding with a supplier. \
Some product details are still missing. Write a polite but specific question \
asking for the missing details.";

/// Writes the clarification question with the LLM, bounded by `timeout`.
pub struct LlmClarificationGenerator {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmClarificationGenerator {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

pub fn clarification_prompt(missing_fields: &[String]) -> String {
    format!(
        "I am missing data for the following fields: {}. \
         Write a short, polite request to obtain these details.",
        missing_fields.join(", ")
    )
}

#[async_trait]
impl ClarificationGenerator for LlmClarificationGenerator {
    async fn generate(&self, missing_fields: &[String]) -> Result<String, OracleError> {
        let prompt = clarification_prompt(missing_fields);
        let call =
            self.client.complete(CLARIFICATION_SYSTEM_PROMPT, &prompt, CLARIFICATION_TEMPERATURE);

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) => Ok(text.trim().to_string()),
            Ok(Err(error)) => Err(classify_error(&error, self.timeout)),
            Err(_) => Err(OracleError::Timeout(self.timeout)),
        }
    }
}
