use intake_db::ConversationStore;
use serde_json::json;

use crate::commands::{load_config, open_store, runtime, CommandFailure, CommandResult};

pub fn run() -> CommandResult {
    let config = match load_config("deliveries") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("deliveries") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let (pool, store) = open_store(&config).await?;
        let undelivered = store
            .list_undelivered()
            .await
            .map_err(|error| ("persistence", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(undelivered)
    });

    match result {
        Ok(undelivered) => {
            let items: Vec<_> = undelivered
                .iter()
                .map(|delivery| {
                    json!({
                        "action_id": delivery.action_id.0,
                        "correspondent": delivery.correspondent_id.as_str(),
                        "token": delivery.token.as_str(),
                        "action_kind": delivery.action_kind.as_str(),
                        "status": delivery.status.as_str(),
                        "subject": delivery.reply.subject,
                        "last_error": delivery.last_error,
                        "created_at": delivery.created_at.to_rfc3339(),
                    })
                })
                .collect();
            CommandResult::success_with_data(
                "deliveries",
                format!("{} undelivered reply(ies)", items.len()),
                Some(json!({ "deliveries": items })),
            )
        }
        Err(failure) => CommandResult::from_failure("deliveries", failure),
    }
}
