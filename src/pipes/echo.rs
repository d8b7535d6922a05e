//! A local pipe that answers with the last user message. Its `mode` valve
//! selects the output shape, which makes it useful for exercising clients
//! against every response form the gateway can normalize. The `echo_modes`
//! module lists one sub-pipe per mode instead.

use super::{
    Configuration, Line, LoaderContext, PipeArgs, PipeCall, PipeEntry, PipeError, PipeModule,
    PipeOutput, ProviderKind, SubPipe, SubPipeSource, ValvesSpec, last_user_message, param,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoMode {
    #[default]
    Text,
    Lines,
    Stream,
    Object,
    Structured,
    Fail,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoValves {
    pub prefix: String,
    pub mode: EchoMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoUserValves {
    pub uppercase: bool,
}

#[derive(Debug, Serialize)]
struct EchoReply {
    model: String,
    content: String,
}

pub struct EchoPipe;

const PARAMS: &[&str] = &[param::USER, param::METADATA, param::EVENT_EMITTER];

#[async_trait]
impl super::Pipe for EchoPipe {
    fn params(&self) -> &'static [&'static str] {
        PARAMS
    }

    fn pipe(&self, args: PipeArgs) -> PipeCall {
        let valves: EchoValves = match args.valves.as_ref().map(|v| v.parse()) {
            Some(Ok(valves)) => valves,
            Some(Err(err)) => return PipeCall::Ready(Err(err)),
            None => EchoValves::default(),
        };
        let uppercase = args
            .user()
            .and_then(|user| user.valves.as_ref())
            .and_then(|v| v.parse::<EchoUserValves>().ok())
            .map(|v| v.uppercase)
            .unwrap_or(false);

        let mut text = last_user_message(&args.body).unwrap_or_default();
        if uppercase {
            text = text.to_uppercase();
        }
        let text = format!("{}{}", valves.prefix, text);
        let model = args.model().to_string();
        let mode = mode_from_model(&model).unwrap_or(valves.mode);

        match args.event_emitter().cloned() {
            Some(emitter) => PipeCall::Pending(Box::pin(async move {
                emitter
                    .emit(json!({
                        "type": "status",
                        "data": {"description": "echoing", "done": false}
                    }))
                    .await;
                render(mode, model, text)
            })),
            None => PipeCall::Ready(render(mode, model, text)),
        }
    }
}

fn render(mode: EchoMode, model: String, text: String) -> Result<PipeOutput, PipeError> {
    match mode {
        EchoMode::Text => Ok(PipeOutput::Text(text)),
        EchoMode::Lines => Ok(PipeOutput::lines(split_words(&text))),
        EchoMode::Stream => {
            let words = split_words(&text);
            Ok(PipeOutput::AsyncIter(
                futures_util::stream::iter(
                    words
                        .into_iter()
                        .map(|w| Ok::<Line, PipeError>(Line::from(w))),
                )
                .boxed(),
            ))
        }
        EchoMode::Object => {
            let mut map = Map::new();
            map.insert("model".to_string(), Value::String(model));
            map.insert("echo".to_string(), Value::String(text));
            Ok(PipeOutput::Object(map))
        }
        EchoMode::Structured => PipeOutput::structured(&EchoReply {
            model,
            content: text,
        }),
        EchoMode::Fail => Err(PipeError::msg(if text.is_empty() {
            "echo failure".to_string()
        } else {
            text
        })),
    }
}

/// `echo_modes.lines` selects `lines`; a plain pipe id selects nothing.
fn mode_from_model(model: &str) -> Option<EchoMode> {
    let (_, sub) = model.split_once('.')?;
    serde_json::from_value(Value::String(sub.to_string())).ok()
}

/// Splits on spaces, keeping the separator attached so the pieces
/// concatenate back to the input.
fn split_words(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

fn factory(_ctx: &LoaderContext) -> PipeModule {
    PipeModule {
        pipe: Arc::new(EchoPipe),
        kind: ProviderKind::Simple,
        configuration: configuration(),
        display_name: None,
    }
}

fn configuration() -> Configuration {
    Configuration::Configurable {
        valves: Some(ValvesSpec::of::<EchoValves>("EchoValves")),
        user_valves: Some(ValvesSpec::of::<EchoUserValves>("EchoUserValves")),
    }
}

/// The echo pipe exposed once per output mode, as `<id>.<mode>`.
fn modes_factory(_ctx: &LoaderContext) -> PipeModule {
    let modes = [
        ("text", "Text"),
        ("lines", "Lines"),
        ("stream", "Stream"),
        ("object", "Object"),
        ("structured", "Structured"),
    ];
    PipeModule {
        pipe: Arc::new(EchoPipe),
        kind: ProviderKind::Manifold(SubPipeSource::Static(
            modes
                .into_iter()
                .map(|(id, name)| SubPipe {
                    id: id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
        )),
        configuration: configuration(),
        display_name: Some("Echo ".to_string()),
    }
}

inventory::submit! {
    PipeEntry {
        module: "echo",
        factory,
    }
}

inventory::submit! {
    PipeEntry {
        module: "echo_modes",
        factory: modes_factory,
    }
}
