use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use intake_agent::{IntakeLoop, IntakeStats};
use intake_db::{ping, DbPool};
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    intake: IntakeLoop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub intake: IntakeStats,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, intake: IntakeLoop) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, intake })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    intake: IntakeLoop,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "intake.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, intake)).await {
            error!(
                event_name = "intake.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "intake-server runtime initialized".to_string(),
        },
        database,
        intake: state.intake.stats(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::State,
        http::{Request, StatusCode},
        Json,
    };
    use intake_agent::{IntakeComponents, IntakeLoop, IntakeSettings};
    use intake_core::audit::NoopAuditSink;
    use intake_core::domain::correspondent::CorrespondentId;
    use intake_core::domain::record::FieldRecord;
    use intake_core::domain::schema::FieldSchema;
    use intake_core::errors::{OracleError, SinkError};
    use intake_core::ports::{
        ClarificationGenerator, ExportSink, ExportSnapshot, ExtractionOracle, MessageSink,
        NoopInboundSource,
    };
    use intake_db::{connect_with_settings, InMemoryConversationStore};
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    struct Silent;

    #[async_trait::async_trait]
    impl ExtractionOracle for Silent {
        async fn extract(
            &self,
            _text: &str,
            schema: &FieldSchema,
        ) -> Result<FieldRecord, OracleError> {
            Ok(FieldRecord::empty(schema))
        }
    }

    #[async_trait::async_trait]
    impl ClarificationGenerator for Silent {
        async fn generate(&self, _missing_fields: &[String]) -> Result<String, OracleError> {
            Err(OracleError::Transport("offline".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl MessageSink for Silent {
        async fn send(
            &self,
            _to: &CorrespondentId,
            _subject: &str,
            _body: &str,
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ExportSink for Silent {
        async fn write(
            &self,
            _schema: &FieldSchema,
            _records: &ExportSnapshot,
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn idle_intake() -> IntakeLoop {
        let schema = FieldSchema::default();
        IntakeLoop::new(
            schema.clone(),
            IntakeComponents {
                store: Arc::new(InMemoryConversationStore::new(schema)),
                oracle: Arc::new(Silent),
                generator: Arc::new(Silent),
                source: Arc::new(NoopInboundSource),
                messages: Arc::new(Silent),
                exports: Arc::new(Silent),
                audit: Arc::new(NoopAuditSink),
            },
            IntakeSettings::default(),
        )
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), intake: idle_intake() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.intake.cycles, 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool, intake: idle_intake() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_route_reports_intake_stats_after_a_cycle() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let intake = idle_intake();
        intake.process_batch().await.expect("empty batch");

        let response = router(pool.clone(), intake)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["intake"]["cycles"], 1);
        assert_eq!(payload["intake"]["last_cycle_fetched"], 0);

        pool.close().await;
    }
}
