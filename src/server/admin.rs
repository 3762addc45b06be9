//! The admin HTTP surface.
//!
//! Thin handlers over the hub's connections and the client-config cache:
//! `State<AppState>` extractors, `Json<Value>` bodies, typed `StatusCode`
//! errors.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::AppState;

type AdminResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn not_found(conn_id: Uuid) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("connection '{conn_id}' not found"), "code": "not_found"})),
    )
}

/// GET /admin/connections/:id/usage
pub async fn get_usage(State(state): State<AppState>, Path(id): Path<Uuid>) -> AdminResult {
    let conn = state.hub.get(id).await.ok_or_else(|| not_found(id))?;
    Ok(Json(serde_json::json!({
        "connection_id": id,
        "tokens_used": conn.tokens_used(),
        "ceiling": conn.ceiling(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    pub limit: u64,
}

/// POST /admin/connections/:id/usage/limit
pub async fn set_usage_limit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetLimitRequest>,
) -> AdminResult {
    let conn = state.hub.get(id).await.ok_or_else(|| not_found(id))?;
    conn.set_ceiling(body.limit);
    Ok(Json(serde_json::json!({
        "connection_id": id,
        "ceiling": conn.ceiling(),
    })))
}

/// POST /admin/connections/:id/usage/reset
pub async fn reset_usage(State(state): State<AppState>, Path(id): Path<Uuid>) -> AdminResult {
    let conn = state.hub.get(id).await.ok_or_else(|| not_found(id))?;
    conn.reset_tokens();
    Ok(Json(serde_json::json!({
        "connection_id": id,
        "tokens_used": conn.tokens_used(),
    })))
}

/// POST /admin/tenants/:id/invalidate
pub async fn invalidate_tenant(State(state): State<AppState>, Path(tenant_id): Path<String>) -> AdminResult {
    state.config_cache.invalidate(&tenant_id).await;
    Ok(Json(serde_json::json!({"tenant_id": tenant_id, "invalidated": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Connection;
    use crate::server::app_router;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        crate::server::test_support::build_test_state()
    }

    #[tokio::test]
    async fn usage_roundtrip_via_http() {
        let state = test_state();
        let (conn, _rx) = Connection::new("u1".into(), "t1".into(), 100, 8);
        let id = conn.id;
        state.hub.register(conn).await;
        let app = app_router(state);

        let request = Request::builder()
            .method("POST")
            .uri(format!("/admin/connections/{id}/usage/limit"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&serde_json::json!({"limit": 500})).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri(format!("/admin/connections/{id}/usage"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ceiling"], 500);
    }

    #[tokio::test]
    async fn usage_for_unknown_connection_is_not_found() {
        let state = test_state();
        let app = app_router(state);
        let request = Request::builder()
            .uri(format!("/admin/connections/{}/usage", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalidate_tenant_clears_cache_entry() {
        let state = test_state();
        state.config_cache.get("t1").await.unwrap();
        let app = app_router(state.clone());
        let request = Request::builder()
            .method("POST")
            .uri("/admin/tenants/t1/invalidate")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.config_cache.len().await, 0);
    }
}
