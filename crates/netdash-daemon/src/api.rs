//! REST API handlers

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use netdash_core::DiscoveryResult;
use netdash_discovery::DEFAULT_KICK_WINDOW;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::is_truthy;
use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// Dashboard data must never be served from an intermediate cache
fn no_store(status: StatusCode, body: impl Serialize) -> Response {
    (status, [(header::CACHE_CONTROL, "no-store")], Json(body)).into_response()
}

/// Liveness check
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    no_store(
        StatusCode::OK,
        json!({
            "ok": true,
            "ts": Utc::now().timestamp(),
            "cache_enabled": state.cache_enabled(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Run a forced discovery before answering
    fresh: Option<String>,
    /// Skip discovery entirely
    light: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(is_truthy)
}

/// Dashboard status: discovery result plus host and cache metadata
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let fresh = flag(&query.fresh);
    let light = flag(&query.light);

    let mut discovery_stale = false;
    let discovery = if light {
        None
    } else if fresh {
        match state.service.discover(state.discovery.clone(), true, false).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = %e, "Foreground discovery failed");
                return no_store(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new(format!("discovery failed: {}", e)),
                );
            }
        }
    } else {
        let result = match state.service.cached().await {
            Some(result) => result,
            None => DiscoveryResult::stub(
                state.discovery.mode,
                state.service.known_stub(&state.discovery.known_devices),
            ),
        };
        discovery_stale = !state.service.completed_within(DEFAULT_KICK_WINDOW).await;
        let started = state
            .service
            .kick(state.discovery.clone(), false, true, DEFAULT_KICK_WINDOW)
            .await;
        debug!(started, "Background discovery kick");
        Some(result)
    };

    no_store(
        StatusCode::OK,
        json!({
            "ts": Utc::now().timestamp(),
            "discovery": discovery,
            "meta": {
                "cache_enabled": state.cache_enabled(),
                "neighbor_snapshot_enabled": state.neighbor_snapshot_enabled(),
                "cache_forced": fresh,
                "discovery_stale": discovery_stale,
                "light": light,
                "config_warnings": state.config_warnings,
            },
            "host": {
                "os": std::env::consts::OS,
                "hostname": state.hostname,
            },
        }),
    )
}
