use crate::app::AppState;
use crate::auth::get_verified_user;
use crate::catalog;
use crate::error::{AppError, AppResult};
use crate::extract::ApiJson;
use crate::normalizer::Normalized;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let _user = get_verified_user(&headers, &state.auth)?;
    let data = catalog::list_models(&state.functions, &state.registry, &state.runtime.arena).await?;
    Ok(Json(json!({ "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<Value>,
) -> AppResult<Response> {
    let user = get_verified_user(&headers, &state.auth)?;
    match state.completions.generate(body, &user).await? {
        Normalized::Json(value) => Ok(Json(value).into_response()),
        Normalized::Stream(frames) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(frames))
            .map_err(|err| AppError::internal("response_build_failed", err.to_string())),
    }
}
