//! Decides the one outbound action for a processed message.
//!
//! Finalize is edge-triggered: it fires on the transition into completeness
//! and never again for the same conversation. Clarify fires on every message
//! that leaves the record incomplete. The planner itself never fails; a
//! broken clarification writer degrades to a deterministic prompt.

use std::sync::Arc;

use tracing::warn;

use crate::domain::conversation::{Action, ConversationState, OutboundReply};
use crate::domain::record::FieldRecord;
use crate::domain::schema::FieldSchema;
use crate::policy::{is_complete, missing_fields};
use crate::ports::ClarificationGenerator;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyTemplates {
    pub clarify_subject: String,
    pub finalize_subject: String,
    pub finalize_body: String,
}

impl Default for ReplyTemplates {
    fn default() -> Self {
        Self {
            clarify_subject: "Clarification regarding your product".to_string(),
            finalize_subject: "Data received".to_string(),
            finalize_body: "Thank you! All the data has been received. Have a nice day!"
                .to_string(),
        }
    }
}

impl ReplyTemplates {
    /// Used when the clarification writer fails or returns nothing.
    pub fn fallback_question(&self, missing_fields: &[String]) -> String {
        format!(
            "Hello! To complete your product card we still need the following details: {}. \
             Could you please send them?",
            missing_fields.join(", ")
        )
    }
}

pub struct ActionPlanner {
    schema: FieldSchema,
    generator: Arc<dyn ClarificationGenerator>,
    templates: ReplyTemplates,
}

impl ActionPlanner {
    pub fn new(schema: FieldSchema, generator: Arc<dyn ClarificationGenerator>) -> Self {
        Self::with_templates(schema, generator, ReplyTemplates::default())
    }

    pub fn with_templates(
        schema: FieldSchema,
        generator: Arc<dyn ClarificationGenerator>,
        templates: ReplyTemplates,
    ) -> Self {
        Self { schema, generator, templates }
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub async fn plan(&self, old_state: &ConversationState, new_record: &FieldRecord) -> Action {
        let was_complete = is_complete(&self.schema, &old_state.record);

        if is_complete(&self.schema, new_record) {
            if was_complete {
                return Action::None;
            }
            return Action::Finalize {
                record: new_record.clone(),
                reply: OutboundReply {
                    subject: self.templates.finalize_subject.clone(),
                    body: self.templates.finalize_body.clone(),
                },
            };
        }

        let missing = missing_fields(&self.schema, new_record);
        let question = self.question_for(old_state, &missing).await;

        let subject = self.templates.clarify_subject.clone();
        Action::Clarify {
            missing_fields: missing,
            reply: OutboundReply { subject, body: question },
        }
    }

    async fn question_for(&self, old_state: &ConversationState, missing: &[String]) -> String {
        match self.generator.generate(missing).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(
                    event_name = "intake.planner.clarification_fallback",
                    correspondent_id = %old_state.correspondent_id,
                    reason = "empty_text",
                    "clarification writer returned empty text; using fallback prompt"
                );
                self.templates.fallback_question(missing)
            }
            Err(error) => {
                warn!(
                    event_name = "intake.planner.clarification_fallback",
                    correspondent_id = %old_state.correspondent_id,
                    reason = "oracle_error",
                    error = %error,
                    "clarification writer failed; using fallback prompt"
                );
                self.templates.fallback_question(missing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{ActionPlanner, ReplyTemplates};
    use crate::domain::conversation::{Action, ConversationState};
    use crate::domain::correspondent::CorrespondentId;
    use crate::domain::record::FieldRecord;
    use crate::domain::schema::FieldSchema;
    use crate::errors::OracleError;
    use crate::ports::ClarificationGenerator;

    struct FixedGenerator(Result<String, OracleError>);

    #[async_trait]
    impl ClarificationGenerator for FixedGenerator {
        async fn generate(&self, _missing_fields: &[String]) -> Result<String, OracleError> {
            self.0.clone()
        }
    }

    fn schema() -> FieldSchema {
        FieldSchema::new(["name", "price"]).expect("schema")
    }

    fn planner(result: Result<String, OracleError>) -> ActionPlanner {
        ActionPlanner::new(schema(), Arc::new(FixedGenerator(result)))
    }

    fn state_with(pairs: &[(&str, &str)]) -> ConversationState {
        let mut state = ConversationState::new(
            CorrespondentId::parse("supplier@factory.test").expect("id"),
            &schema(),
            Utc::now(),
        );
        state.record = FieldRecord::from_extraction(&schema(), pairs.iter().copied());
        state
    }

    #[tokio::test]
    async fn incomplete_record_yields_clarify_with_generated_text() {
        let planner = planner(Ok("  What is the price?  ".to_string()));
        let record = FieldRecord::from_extraction(&schema(), [("name", "Widget")]);

        let action = planner.plan(&state_with(&[]), &record).await;

        match action {
            Action::Clarify { missing_fields, reply } => {
                assert_eq!(missing_fields, ["price"]);
                assert_eq!(reply.body, "What is the price?");
                assert_eq!(reply.subject, ReplyTemplates::default().clarify_subject);
            }
            other => panic!("expected clarify, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transition_into_completeness_finalizes_once() {
        let planner = planner(Ok("unused".to_string()));
        let complete = FieldRecord::from_extraction(&schema(), [("name", "W"), ("price", "1")]);

        let first = planner.plan(&state_with(&[("name", "W")]), &complete).await;
        assert!(matches!(first, Action::Finalize { ref record, .. } if record == &complete));

        let after = planner.plan(&state_with(&[("name", "W"), ("price", "1")]), &complete).await;
        assert_eq!(after, Action::None);
    }

    #[tokio::test]
    async fn generator_failure_falls_back_to_listing_every_missing_field() {
        let planner = planner(Err(OracleError::Transport("connection refused".to_string())));
        let action = planner.plan(&state_with(&[]), &FieldRecord::empty(&schema())).await;

        let Action::Clarify { missing_fields, reply } = action else {
            panic!("expected clarify");
        };
        assert_eq!(missing_fields, ["name", "price"]);
        assert!(!reply.body.trim().is_empty());
        assert!(reply.body.contains("name"));
        assert!(reply.body.contains("price"));
    }

    #[tokio::test]
    async fn blank_generator_text_falls_back() {
        let planner = planner(Ok("   \n".to_string()));
        let record = FieldRecord::from_extraction(&schema(), [("price", "5")]);

        let action = planner.plan(&state_with(&[]), &record).await;

        let reply = action.reply().expect("clarify has reply");
        assert_eq!(reply.body, ReplyTemplates::default().fallback_question(&["name".to_string()]));
    }
}
