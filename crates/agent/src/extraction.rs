//! LLM-backed extraction oracle.
//!
//! The model is asked for a JSON object keyed by the required fields. Replies
//! are parsed tolerantly: code fences and prose around the first `{...}` are
//! ignored, scalar values are stringified, and `null`, blank or unknown keys
//! become missing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use intake_core::domain::record::FieldRecord;
use intake_core::domain::schema::FieldSchema;
use intake_core::errors::OracleError;
use intake_core::ports::ExtractionOracle;

use crate::llm::{classify_error, LlmClient};

const EXTRACTION_TEMPERATURE: f32 = 0.0;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are an assistant that analyses a supplier's reply. \
Extract the key product fields and return a JSON object. \
If a value is not present in the text, use an empty string.";

pub struct LlmExtractionOracle {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmExtractionOracle {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

pub fn extraction_prompt(text: &str, schema: &FieldSchema) -> String {
    let example = schema
        .fields()
        .iter()
        .map(|field| format!("\"{field}\": \"...\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Required fields: {}.\nSupplier reply:\n---\n{}\n---\n\
         Return ONLY a JSON object. Example: {{{}}}",
        schema.fields().join(", "),
        text,
        example
    )
}

#[async_trait]
impl ExtractionOracle for LlmExtractionOracle {
    async fn extract(&self, text: &str, schema: &FieldSchema) -> Result<FieldRecord, OracleError> {
        let prompt = extraction_prompt(text, schema);
        let reply = self
            .client
            .complete(EXTRACTION_SYSTEM_PROMPT, &prompt, EXTRACTION_TEMPERATURE)
            .await
            .map_err(|error| classify_error(&error, self.timeout))?;

        parse_extraction(&reply, schema)
    }
}

/// Turns a model reply into a partial record for `schema`.
pub fn parse_extraction(reply: &str, schema: &FieldSchema) -> Result<FieldRecord, OracleError> {
    let object_text = json_object_span(reply)
        .ok_or_else(|| OracleError::Malformed("reply contains no JSON object".to_string()))?;
    let value: Value = serde_json::from_str(object_text)
        .map_err(|error| OracleError::Malformed(format!("invalid JSON object: {error}")))?;
    let Value::Object(map) = value else {
        return Err(OracleError::Malformed("reply is not a JSON object".to_string()));
    };

    let pairs = map.into_iter().filter_map(|(key, value)| {
        let field = schema.fields().iter().find(|field| field.eq_ignore_ascii_case(key.trim()))?;
        let text = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        // A blank alias such as `"price": ""` next to `"Price": "12"` must not
        // erase the known value.
        (!text.trim().is_empty()).then(|| (field.clone(), text))
    });

    Ok(FieldRecord::from_extraction(schema, pairs))
}

fn json_object_span(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}
