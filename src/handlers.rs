use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::counter::{HashtagCounter, RankEntry};
use crate::error::{ApiError, CounterError};
use crate::health::HealthChecker;
use crate::response::ResetResponse;
use crate::validation::{RequestValidator, DEFAULT_RESULT_COUNT};

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state containing the query service and the default bucket
pub struct AppState {
    pub counter: HashtagCounter,
    pub default_filter: String,
    pub started: Instant,
}

impl AppState {
    pub fn new(counter: HashtagCounter, default_filter: &str) -> Self {
        Self {
            counter,
            default_filter: default_filter.to_string(),
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    #[serde(default)]
    pub filter: Option<String>,
}

fn count_query(query: Result<Query<CountQuery>, QueryRejection>) -> Result<CountQuery, ApiError> {
    query
        .map(|Query(query)| query)
        .map_err(|rejection| ApiError::InvalidQuery(rejection.body_text()))
}

/// Top hashtags with the default result count
pub async fn count_default(
    State(state): State<SharedState>,
    query: Result<Query<CountQuery>, QueryRejection>,
) -> Result<Json<Vec<RankEntry>>, ApiError> {
    let query = count_query(query)?;
    ranked(&state, query.filter.as_deref(), DEFAULT_RESULT_COUNT).await
}

/// Top `num_results` hashtags
pub async fn count(
    State(state): State<SharedState>,
    num_results: Result<Path<String>, PathRejection>,
    query: Result<Query<CountQuery>, QueryRejection>,
) -> Result<Json<Vec<RankEntry>>, ApiError> {
    // undecodable segments are just another non-numeric count
    let Path(num_results) =
        num_results.map_err(|rejection| ApiError::InvalidCount(rejection.body_text()))?;
    let n = RequestValidator::parse_result_count(&num_results)?;
    let query = count_query(query)?;
    ranked(&state, query.filter.as_deref(), n).await
}

async fn ranked(
    state: &AppState,
    filter: Option<&str>,
    n: i64,
) -> Result<Json<Vec<RankEntry>>, ApiError> {
    let bucket = RequestValidator::resolve_filter(filter, &state.default_filter);
    let entries = state.counter.top(bucket, n).await?;
    Ok(Json(entries))
}

/// Delete every counter of a bucket
pub async fn reset(
    State(state): State<SharedState>,
    tweet_filter: Result<Path<String>, PathRejection>,
) -> Result<Json<ResetResponse>, ApiError> {
    let Path(tweet_filter) = tweet_filter.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "undecodable reset path");
        ApiError::Counter(CounterError::MissingFilter)
    })?;
    let deleted = state.counter.reset(&tweet_filter).await?;
    Ok(Json(ResetResponse::deleted(deleted)))
}

/// `DELETE /reset` with no bucket at all
pub async fn reset_without_filter() -> ApiError {
    ApiError::Counter(CounterError::MissingFilter)
}

/// Any path no route matches
pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// A known path requested with the wrong method
pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let status = HealthChecker::new(&state.counter, state.started)
        .check_health()
        .await;
    Json(status)
}
