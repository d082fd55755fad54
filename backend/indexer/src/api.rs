//! Axum REST API handlers — read-only views over the circle read model and
//! the audit log.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::IndexerError;
use crate::store::{AuditRecord, Circle};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CirclesResponse {
    pub count: usize,
    pub circles: Vec<Circle>,
}

#[derive(Serialize)]
pub struct CircleEventsResponse {
    pub circle_id: String,
    pub count: usize,
    pub events: Vec<AuditRecord>,
}

#[derive(Serialize)]
pub struct AllEventsResponse {
    pub count: usize,
    pub events: Vec<AuditRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn internal(e: IndexerError) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /circles`
pub async fn list_circles(State(state): State<Arc<ApiState>>) -> Response {
    match db::list_circles(&state.pool).await {
        Ok(circles) => {
            let count = circles.len();
            (StatusCode::OK, Json(CirclesResponse { count, circles })).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /circles/:id`
///
/// Returns the projected circle, or 404 if no `CircleCreated` was indexed for it.
pub async fn get_circle(
    State(state): State<Arc<ApiState>>,
    Path(circle_id): Path<String>,
) -> Response {
    match db::get_circle(&state.pool, &circle_id).await {
        Ok(Some(circle)) => (StatusCode::OK, Json(circle)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("circle {circle_id} not found")),
        Err(e) => internal(e),
    }
}

/// `GET /circles/:id/events`
///
/// Returns every audit record for the circle, including those indexed while
/// the circle itself was unknown.
pub async fn get_circle_events(
    State(state): State<Arc<ApiState>>,
    Path(circle_id): Path<String>,
) -> Response {
    match db::get_audit_for_circle(&state.pool, &circle_id).await {
        Ok(events) => {
            let count = events.len();
            (
                StatusCode::OK,
                Json(CircleEventsResponse {
                    circle_id,
                    count,
                    events,
                }),
            )
                .into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /events`
///
/// Returns the whole audit log in chain order.
pub async fn get_all_events(State(state): State<Arc<ApiState>>) -> Response {
    match db::get_all_audit(&state.pool).await {
        Ok(events) => {
            let count = events.len();
            (StatusCode::OK, Json(AllEventsResponse { count, events })).into_response()
        }
        Err(e) => internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::events::{ChainEvent, CircleCreated, CircleEvent, EventMeta, SchemaVersion};
    use crate::projector::Projector;

    async fn state_with_circle() -> Arc<ApiState> {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let projector = Projector::new(SqliteStore::new(pool.clone()));
        projector
            .project(&ChainEvent {
                meta: EventMeta {
                    block_number: 1,
                    block_timestamp: 1_700_000_000,
                    tx_hash: "0x01".into(),
                    log_index: 0,
                },
                version: SchemaVersion::V2,
                payload: CircleEvent::CircleCreated(CircleCreated {
                    circle_id: "0x01".into(),
                    creator: "0xC0".into(),
                    is_stablecoin_denominated: false,
                    goal_value_to_raise: "1000".into(),
                    lead_duration: 1,
                    due_duration: 2,
                    originator_score_at_creation: "0".into(),
                }),
            })
            .await
            .unwrap();
        Arc::new(ApiState { pool })
    }

    #[tokio::test]
    async fn known_circle_is_returned() {
        let state = state_with_circle().await;
        let resp = get_circle(State(state.clone()), Path("0x01".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_circle_events(State(state), Path("0x01".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_circle_is_404() {
        let state = state_with_circle().await;
        let resp = get_circle(State(state), Path("0xFF".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
