//! Manifold pipe proxying to an OpenAI-compatible upstream. Each upstream
//! model becomes a sub-pipe `openai.<model>`; streaming responses are
//! forwarded as the upstream framed them.

use super::{
    Configuration, LoaderContext, PipeArgs, PipeCall, PipeEntry, PipeError, PipeModule,
    PipeOutput, ProviderKind, SubPipe, SubPipeSource, Valves, ValvesSpec,
};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiValves {
    pub base_url: String,
    pub api_key: String,
    /// Fixed model list. When empty the upstream `/models` listing is used.
    pub models: Vec<SubPipe>,
}

impl Default for OpenAiValves {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            models: Vec::new(),
        }
    }
}

pub struct OpenAiPipe {
    http: reqwest::Client,
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn valves_of(valves: Option<&Valves>) -> Result<OpenAiValves, PipeError> {
    match valves {
        Some(valves) => valves.parse(),
        None => Ok(OpenAiValves::default()),
    }
}

/// `openai.gpt-4o` -> `gpt-4o`.
fn upstream_model(model: &str) -> &str {
    model.split_once('.').map(|(_, sub)| sub).unwrap_or(model)
}

#[async_trait]
impl super::Pipe for OpenAiPipe {
    fn params(&self) -> &'static [&'static str] {
        &[]
    }

    fn pipe(&self, args: PipeArgs) -> PipeCall {
        let valves = match valves_of(args.valves.as_ref()) {
            Ok(valves) => valves,
            Err(err) => return PipeCall::Ready(Err(err)),
        };
        let http = self.http.clone();
        let mut body = args.body;
        PipeCall::Pending(Box::pin(async move {
            let Some(obj) = body.as_object_mut() else {
                return Err(PipeError::InvalidBody("expected a JSON object".to_string()));
            };
            let model = obj
                .get("model")
                .and_then(|v| v.as_str())
                .map(|m| upstream_model(m).to_string())
                .unwrap_or_default();
            obj.insert("model".to_string(), Value::String(model.clone()));
            let streaming = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

            tracing::debug!(model = %model, streaming, "forwarding chat completion upstream");
            let resp = http
                .post(join_url(&valves.base_url, "chat/completions"))
                .bearer_auth(&valves.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|err| PipeError::Upstream(err.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(PipeError::Upstream(format!(
                    "upstream status {}: {}",
                    status, text
                )));
            }

            if streaming {
                let stream = resp
                    .bytes_stream()
                    .map_err(|err| PipeError::Upstream(err.to_string()))
                    .boxed();
                Ok(PipeOutput::Stream(stream))
            } else {
                let map = resp
                    .json::<Map<String, Value>>()
                    .await
                    .map_err(|err| PipeError::Upstream(err.to_string()))?;
                Ok(PipeOutput::Object(map))
            }
        }))
    }

    async fn sub_pipes(&self, valves: Option<&Valves>) -> Result<Vec<SubPipe>, PipeError> {
        let valves = valves_of(valves)?;
        if !valves.models.is_empty() {
            return Ok(valves.models);
        }
        if valves.api_key.is_empty() {
            return Err(PipeError::msg("api_key is not configured"));
        }

        let resp = self
            .http
            .get(join_url(&valves.base_url, "models"))
            .bearer_auth(&valves.api_key)
            .send()
            .await
            .map_err(|err| PipeError::Upstream(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipeError::Upstream(format!("upstream status {}", status)));
        }
        let listing: Value = resp
            .json()
            .await
            .map_err(|err| PipeError::Upstream(err.to_string()))?;
        let models = listing
            .get("data")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(|v| v.as_str()))
                    .map(|id| SubPipe {
                        id: id.to_string(),
                        name: id.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

fn factory(ctx: &LoaderContext) -> PipeModule {
    PipeModule {
        pipe: Arc::new(OpenAiPipe {
            http: ctx.http.clone(),
        }),
        kind: ProviderKind::Manifold(SubPipeSource::Provider),
        configuration: Configuration::Configurable {
            valves: Some(ValvesSpec::of::<OpenAiValves>("OpenAiValves")),
            user_valves: None,
        },
        display_name: Some("OpenAI: ".to_string()),
    }
}

inventory::submit! {
    PipeEntry {
        module: "openai",
        factory,
    }
}
