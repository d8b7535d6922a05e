use crate::auth::SessionUser;
use crate::binder::{ParameterBinder, pipe_id_from_model, user_context};
use crate::error::{AppError, AppResult};
use crate::events::{EventHub, EventTarget};
use crate::models::ModelStore;
use crate::normalizer::{Normalized, invoke};
use crate::payload::{apply_model_params_to_body_openai, apply_model_system_prompt_to_body};
use crate::pipes::{ContextExtras, ContextValue, param};
use crate::registry::PipeRegistry;
use crate::tools::{ToolContext, ToolResolver};
use axum::http::StatusCode;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runs one chat completion through a pipe.
#[derive(Clone)]
pub struct ChatCompletions {
    registry: PipeRegistry,
    binder: ParameterBinder,
    models: ModelStore,
    events: EventHub,
    tools: Arc<dyn ToolResolver>,
}

impl ChatCompletions {
    pub fn new(
        registry: PipeRegistry,
        binder: ParameterBinder,
        models: ModelStore,
        events: EventHub,
        tools: Arc<dyn ToolResolver>,
    ) -> Self {
        Self {
            registry,
            binder,
            models,
            events,
            tools,
        }
    }

    pub async fn generate(&self, body: Value, user: &SessionUser) -> AppResult<Normalized> {
        let Value::Object(mut body) = body else {
            return Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "request body must be a JSON object",
            ));
        };
        let model_id = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "model is required")
            })?;

        let metadata = match body.remove("metadata") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let files = metadata
            .get("files")
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let tool_ids: Vec<String> = metadata
            .get("tool_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut extras = ContextExtras::new();
        let metadata = Value::Object(metadata);
        if let Some(target) = EventTarget::from_metadata(&metadata) {
            extras.insert(
                param::EVENT_EMITTER.to_string(),
                ContextValue::EventEmitter(self.events.emitter(target.clone())),
            );
            extras.insert(
                param::EVENT_CALL.to_string(),
                ContextValue::EventCall(self.events.caller(target)),
            );
        }
        for (key, name) in [("task", param::TASK), ("task_body", param::TASK_BODY)] {
            if let Some(value) = metadata.get(key).filter(|v| !v.is_null()) {
                extras.insert(name.to_string(), ContextValue::Json(value.clone()));
            }
        }
        extras.insert(param::FILES.to_string(), ContextValue::Json(files.clone()));
        extras.insert(param::USER.to_string(), user_context(user));

        let model_override = self.models.get_model_by_id(&model_id).await?;
        let model_info = model_override
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| AppError::internal("serialization_error", err.to_string()))?;
        let messages = body
            .get("messages")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let tools = self
            .tools
            .resolve(
                &tool_ids,
                user,
                ToolContext {
                    model: model_info.as_ref(),
                    messages: &messages,
                    files: &files,
                },
            )
            .await;
        extras.insert(param::TOOLS.to_string(), ContextValue::Tools(tools));
        extras.insert(param::METADATA.to_string(), ContextValue::Json(metadata));

        if let Some(model) = &model_override {
            if let Some(base) = model.base_model_id.as_deref().filter(|b| !b.is_empty()) {
                tracing::debug!(model = %model_id, base_model = %base, "routing model override to base model");
                body.insert("model".to_string(), Value::String(base.to_string()));
            }
            apply_model_params_to_body_openai(&model.params, &mut body);
            apply_model_system_prompt_to_body(&model.params, &mut body, Some(user));
        }

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&model_id)
            .to_string();
        let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let pipe_id = pipe_id_from_model(&model);
        let resolved = self.registry.resolve(pipe_id).await?;
        let args = self.binder.bind(&resolved, Value::Object(body), extras).await;

        tracing::info!(
            model = %model,
            pipe_id = %pipe_id,
            user_id = %user.id,
            streaming,
            "invoking pipe"
        );
        Ok(invoke(resolved.module.module.pipe.as_ref(), args, streaming).await)
    }
}
