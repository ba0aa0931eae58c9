use std::fmt::Display;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use gleafd_core::IdService;

/// Response envelope shared by every endpoint. Errors keep HTTP status 200
/// and signal failure through `code`/`msg` instead.
#[derive(Debug, Serialize)]
pub struct HttpResponse<T> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T: Serialize> HttpResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            msg: "Ok".to_string(),
            data: Some(data),
        })
    }

    fn fail(err: impl Display) -> Json<Self> {
        Json(Self {
            code: 400,
            msg: err.to_string(),
            data: None,
        })
    }
}

#[derive(Clone)]
struct AppState {
    svc: Arc<IdService>,
    shutdown: CancellationToken,
}

/// Raw `count` query parameter. Kept a string so a malformed value turns
/// into an envelope error instead of a rejection.
#[derive(Debug, Deserialize)]
struct CountParam {
    count: Option<String>,
}

impl CountParam {
    fn parse(&self) -> Result<i64, std::num::ParseIntError> {
        match &self.count {
            Some(raw) => raw.parse(),
            None => Ok(1),
        }
    }
}

/// Builds the API router. Each request runs under a child token of the
/// server's shutdown token, so client disconnects and server shutdown both
/// cancel in-flight pulls.
pub fn router(svc: Arc<IdService>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/api/v1/segments/{biztag}", get(segment_ids))
        .route("/api/v1/snowflakes/{biztag}", get(snowflake_ids))
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { svc, shutdown })
}

async fn segment_ids(
    State(state): State<AppState>,
    Path(biztag): Path<String>,
    Query(params): Query<CountParam>,
) -> Json<HttpResponse<Vec<i64>>> {
    let count = match params.parse() {
        Ok(count) => count,
        Err(err) => return HttpResponse::fail(err),
    };
    let ct = state.shutdown.child_token();
    match state.svc.segment_ids(&ct, &biztag, count).await {
        Ok(ids) => HttpResponse::ok(ids),
        Err(err) => HttpResponse::fail(err),
    }
}

async fn snowflake_ids(
    State(state): State<AppState>,
    Path(biztag): Path<String>,
    Query(params): Query<CountParam>,
) -> Json<HttpResponse<Vec<i64>>> {
    let count = match params.parse() {
        Ok(count) => count,
        Err(err) => return HttpResponse::fail(err),
    };
    let ct = state.shutdown.child_token();
    match state.svc.snowflake_ids(&ct, &biztag, count).await {
        Ok(ids) => HttpResponse::ok(ids),
        Err(err) => HttpResponse::fail(err),
    }
}

async fn health(State(state): State<AppState>) -> Json<HttpResponse<i64>> {
    match state.svc.health_check("").await {
        Ok(status) => HttpResponse::ok(status),
        Err(err) => HttpResponse::fail(err),
    }
}
