use intake_core::domain::conversation::ConversationState;
use intake_core::domain::correspondent::CorrespondentId;
use intake_core::domain::schema::FieldSchema;
use intake_core::policy::{is_complete, missing_fields};
use intake_db::ConversationStore;
use serde_json::{json, Value};

use crate::commands::{load_config, open_store, runtime, CommandFailure, CommandResult};

pub fn run(correspondent: Option<&str>) -> CommandResult {
    let filter = match correspondent.map(CorrespondentId::parse).transpose() {
        Ok(filter) => filter,
        Err(error) => {
            return CommandResult::failure("status", "domain_validation", error.to_string(), 2)
        }
    };
    let config = match load_config("status") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("status") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let (pool, store) = open_store(&config).await?;
        let states = store
            .list_states()
            .await
            .map_err(|error| ("persistence", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(states)
    });

    let states = match result {
        Ok(states) => states,
        Err(failure) => return CommandResult::from_failure("status", failure),
    };
    let schema = match config.schema() {
        Ok(schema) => schema,
        Err(error) => {
            return CommandResult::failure("status", "config_validation", error.to_string(), 2)
        }
    };

    let rows: Vec<Value> = states
        .iter()
        .filter(|state| filter.as_ref().map_or(true, |id| &state.correspondent_id == id))
        .map(|state| describe(&schema, state))
        .collect();
    let complete = rows.iter().filter(|row| row["complete"] == true).count();

    CommandResult::success_with_data(
        "status",
        format!("{} conversation(s), {complete} complete", rows.len()),
        Some(json!({ "conversations": rows })),
    )
}

fn describe(schema: &FieldSchema, state: &ConversationState) -> Value {
    let known: serde_json::Map<String, Value> = state
        .record
        .iter()
        .filter_map(|(field, value)| value.map(|value| (field.to_string(), Value::from(value))))
        .collect();

    json!({
        "correspondent": state.correspondent_id.as_str(),
        "complete": is_complete(schema, &state.record),
        "known": known,
        "missing": missing_fields(schema, &state.record),
        "last_action": state.last_action_kind.as_str(),
        "last_action_at": state.last_action_at.map(|at| at.to_rfc3339()),
        "messages_processed": state.processed_tokens.len(),
        "updated_at": state.updated_at.to_rfc3339(),
    })
}
