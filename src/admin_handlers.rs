use crate::app::AppState;
use crate::auth::{get_admin_user, get_verified_user};
use crate::error::{AppError, AppResult};
use crate::extract::ApiJson;
use crate::functions::{CreateFunctionInput, FunctionRecord, FunctionType};
use crate::latency::{InsertOutcome, LatencyMetricForm};
use crate::models::{ModelOverride, UpsertModelInput};
use crate::pipes::{ValvesSpec, find_entry};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Deserialize)]
pub struct LatencyQuery {
    pub chat_id: Option<String>,
    pub llm_id: Option<String>,
}

pub async fn record_latency(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(form): ApiJson<LatencyMetricForm>,
) -> AppResult<Response> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    let message_id = form.message_id.clone();
    match state.latency.insert_metric(form).await {
        Ok(InsertOutcome::Inserted(metric)) => {
            metrics::counter!("pipegate_latency_metrics_recorded_total").increment(1);
            tracing::debug!(message_id = %metric.message_id, llm_id = %metric.llm_id, "latency metric recorded");
            Ok(Json(json!({ "status": "success" })).into_response())
        }
        Ok(InsertOutcome::AlreadyRecorded) => {
            tracing::warn!(message_id = %message_id, "latency metric already recorded");
            Err(AppError::internal(
                "latency_already_recorded",
                "Failed to record latency metric",
            ))
        }
        Err(err) => {
            tracing::error!(message_id = %message_id, error = %err, "failed to record latency metric");
            Err(AppError::internal("latency_store_error", err.to_string()))
        }
    }
}

pub async fn list_latency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LatencyQuery>,
) -> AppResult<Response> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    let metrics = match (query.chat_id.as_deref(), query.llm_id.as_deref()) {
        (Some(chat_id), llm_id) => {
            let mut metrics = state.latency.list_metrics_by_chat_id(chat_id).await?;
            if let Some(llm_id) = llm_id {
                metrics.retain(|m| m.llm_id == llm_id);
            }
            metrics
        }
        (None, Some(llm_id)) => state.latency.list_metrics_by_model_id(llm_id).await?,
        (None, None) => state.latency.list_metrics().await?,
    };
    Ok(Json(json!({ "metrics": metrics })).into_response())
}

pub async fn delete_latency(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    let deleted = state.latency.delete_all_metrics().await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

pub async fn create_function(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<CreateFunctionInput>,
) -> AppResult<Json<FunctionRecord>> {
    let admin = get_admin_user(&headers, &state.auth)?;
    if !is_valid_id(&input.id) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            "function id may only contain letters, digits and underscores",
        ));
    }
    if input.function_type == FunctionType::Pipe && find_entry(&input.module).is_none() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "unknown_module",
            format!("no pipe module named {}", input.module),
        ));
    }
    let id = input.id.clone();
    let record = state
        .functions
        .insert_function(&admin.id, input)
        .await?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "id_taken",
                format!("function id {id} is already taken"),
            )
        })?;
    state.registry.evict(&record.id);
    tracing::info!(function_id = %record.id, module = %record.module, "function created");
    Ok(Json(record))
}

/// Validates submitted values against a valves shape, returning the
/// canonical form that gets stored.
fn canonical_valves(
    spec: Option<&ValvesSpec>,
    submitted: Map<String, Value>,
) -> AppResult<Map<String, Value>> {
    let spec = spec.ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "valves_not_supported",
            "function does not declare valves",
        )
    })?;
    let valves = spec
        .construct(Some(submitted))
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_valves", err.to_string()))?;
    match valves.as_value() {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_valves",
            "valves must be an object",
        )),
    }
}

async fn existing_function(state: &AppState, id: &str) -> AppResult<FunctionRecord> {
    state.functions.get_function_by_id(id).await?.ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "function_not_found",
            format!("function {id} not found"),
        )
    })
}

pub async fn update_function_valves(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(submitted): ApiJson<Map<String, Value>>,
) -> AppResult<Json<Map<String, Value>>> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    existing_function(&state, &id).await?;
    let module = state.registry.module(&id).await?;
    let valves = canonical_valves(module.module.configuration.valves(), submitted)?;
    state.functions.update_function_valves(&id, &valves).await?;
    Ok(Json(valves))
}

pub async fn update_user_valves(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(submitted): ApiJson<Map<String, Value>>,
) -> AppResult<Json<Map<String, Value>>> {
    let user = get_verified_user(&headers, &state.auth)?;
    existing_function(&state, &id).await?;
    let module = state.registry.module(&id).await?;
    let valves = canonical_valves(module.module.configuration.user_valves(), submitted)?;
    state
        .functions
        .update_user_valves(&id, &user.id, &valves)
        .await?;
    Ok(Json(valves))
}

pub async fn toggle_function(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<FunctionRecord>> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    let record = existing_function(&state, &id).await?;
    let updated = state
        .functions
        .set_active(&id, !record.is_active)
        .await?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "function_not_found",
                format!("function {id} not found"),
            )
        })?;
    tracing::info!(function_id = %id, is_active = updated.is_active, "function toggled");
    Ok(Json(updated))
}

pub async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<UpsertModelInput>,
) -> AppResult<Json<ModelOverride>> {
    let _admin = get_admin_user(&headers, &state.auth)?;
    if input.id.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            "model id is required",
        ));
    }
    let model = state.models.upsert_model(input).await?;
    Ok(Json(model))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
