use crate::events::{EventCaller, EventEmitter};
use crate::tools::ToolBindings;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod echo;
pub mod openai;

/// Names of the context values a pipe may declare interest in.
pub mod param {
    pub const BODY: &str = "body";
    pub const EVENT_EMITTER: &str = "__event_emitter__";
    pub const EVENT_CALL: &str = "__event_call__";
    pub const TASK: &str = "__task__";
    pub const TASK_BODY: &str = "__task_body__";
    pub const FILES: &str = "__files__";
    pub const USER: &str = "__user__";
    pub const METADATA: &str = "__metadata__";
    pub const TOOLS: &str = "__tools__";
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("{0}")]
    Failed(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("invalid valves: {0}")]
    Valves(#[from] ValvesError),
    #[error("pipe panicked: {0}")]
    Panicked(String),
}

impl PipeError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{name}: {source}")]
pub struct ValvesError {
    pub name: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// A constructed configuration object, carried as its canonical JSON form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Valves(Value);

impl Valves {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, PipeError> {
        serde_json::from_value(self.0.clone()).map_err(|source| {
            PipeError::Valves(ValvesError {
                name: "valves",
                source,
            })
        })
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Shape of a valves object: how to build it from stored values and how to
/// build its defaults.
#[derive(Clone, Copy)]
pub struct ValvesSpec {
    name: &'static str,
    build: fn(Value) -> Result<Value, serde_json::Error>,
    defaults: fn() -> Value,
}

impl ValvesSpec {
    pub fn of<T>(name: &'static str) -> Self
    where
        T: DeserializeOwned + Serialize + Default,
    {
        Self {
            name,
            build: build_typed::<T>,
            defaults: defaults_typed::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn construct(&self, stored: Option<Map<String, Value>>) -> Result<Valves, ValvesError> {
        let raw = Value::Object(stored.unwrap_or_default());
        (self.build)(raw).map(Valves).map_err(|source| ValvesError {
            name: self.name,
            source,
        })
    }

    pub fn defaults(&self) -> Valves {
        Valves((self.defaults)())
    }
}

fn build_typed<T: DeserializeOwned + Serialize>(raw: Value) -> Result<Value, serde_json::Error> {
    let typed: T = serde_json::from_value(raw)?;
    serde_json::to_value(typed)
}

fn defaults_typed<T: Serialize + Default>() -> Value {
    serde_json::to_value(T::default()).unwrap_or(Value::Object(Map::new()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPipe {
    pub id: String,
    pub name: String,
}

pub enum SubPipeSource {
    Static(Vec<SubPipe>),
    /// Sub-pipes are produced by [`Pipe::sub_pipes`] each time the catalog is built.
    Provider,
}

pub enum ProviderKind {
    Simple,
    Manifold(SubPipeSource),
}

pub enum Configuration {
    Unconfigured,
    Configurable {
        valves: Option<ValvesSpec>,
        user_valves: Option<ValvesSpec>,
    },
}

impl Configuration {
    pub fn valves(&self) -> Option<&ValvesSpec> {
        match self {
            Self::Configurable { valves, .. } => valves.as_ref(),
            Self::Unconfigured => None,
        }
    }

    pub fn user_valves(&self) -> Option<&ValvesSpec> {
        match self {
            Self::Configurable { user_valves, .. } => user_valves.as_ref(),
            Self::Unconfigured => None,
        }
    }
}

/// One element of a synchronous or asynchronous pipe sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Text(String),
    Bytes(Bytes),
    Object(Map<String, Value>),
    Structured(Value),
}

impl From<String> for Line {
    fn from(value: String) -> Self {
        Line::Text(value)
    }
}

impl From<&str> for Line {
    fn from(value: &str) -> Self {
        Line::Text(value.to_string())
    }
}

impl From<Bytes> for Line {
    fn from(value: Bytes) -> Self {
        Line::Bytes(value)
    }
}

impl From<Map<String, Value>> for Line {
    fn from(value: Map<String, Value>) -> Self {
        Line::Object(value)
    }
}

pub type LineIter = Box<dyn Iterator<Item = Result<Line, PipeError>> + Send>;
pub type LineStream = BoxStream<'static, Result<Line, PipeError>>;
pub type ByteStream = BoxStream<'static, Result<Bytes, PipeError>>;

/// Everything a pipe may return. The variant order is the classification
/// order applied by the normalizer.
pub enum PipeOutput {
    /// Already framed SSE bytes, forwarded verbatim.
    Stream(ByteStream),
    Object(Map<String, Value>),
    Text(String),
    Iter(LineIter),
    AsyncIter(LineStream),
    Structured(Value),
}

impl PipeOutput {
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, PipeError> {
        serde_json::to_value(value)
            .map(PipeOutput::Structured)
            .map_err(|err| PipeError::msg(err.to_string()))
    }

    pub fn lines<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        I::IntoIter: Send + 'static,
        L: Into<Line>,
    {
        PipeOutput::Iter(Box::new(lines.into_iter().map(|line| Ok(line.into()))))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Object(_) => "object",
            Self::Text(_) => "text",
            Self::Iter(_) => "iter",
            Self::AsyncIter(_) => "async_iter",
            Self::Structured(_) => "structured",
        }
    }
}

/// Result of calling a pipe: already computed, or a future to await.
pub enum PipeCall {
    Ready(Result<PipeOutput, PipeError>),
    Pending(BoxFuture<'static, Result<PipeOutput, PipeError>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserContext {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valves: Option<Valves>,
}

#[derive(Clone)]
pub enum ContextValue {
    Json(Value),
    User(UserContext),
    EventEmitter(EventEmitter),
    EventCall(EventCaller),
    Tools(ToolBindings),
}

pub type ContextExtras = BTreeMap<String, ContextValue>;

/// The argument set a pipe is invoked with.
pub struct PipeArgs {
    pub body: Value,
    pub valves: Option<Valves>,
    extras: BTreeMap<String, ContextValue>,
}

impl PipeArgs {
    pub fn new(body: Value, valves: Option<Valves>) -> Self {
        Self {
            body,
            valves,
            extras: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ContextValue) {
        self.extras.insert(name.into(), value);
    }

    pub fn keys(&self) -> Vec<&str> {
        std::iter::once(param::BODY)
            .chain(self.extras.keys().map(String::as_str))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.extras.get(name)
    }

    pub fn model(&self) -> &str {
        self.body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn user(&self) -> Option<&UserContext> {
        match self.extras.get(param::USER) {
            Some(ContextValue::User(user)) => Some(user),
            _ => None,
        }
    }

    pub fn user_mut(&mut self) -> Option<&mut UserContext> {
        match self.extras.get_mut(param::USER) {
            Some(ContextValue::User(user)) => Some(user),
            _ => None,
        }
    }

    pub fn event_emitter(&self) -> Option<&EventEmitter> {
        match self.extras.get(param::EVENT_EMITTER) {
            Some(ContextValue::EventEmitter(emitter)) => Some(emitter),
            _ => None,
        }
    }

    pub fn event_call(&self) -> Option<&EventCaller> {
        match self.extras.get(param::EVENT_CALL) {
            Some(ContextValue::EventCall(caller)) => Some(caller),
            _ => None,
        }
    }

    pub fn json(&self, name: &str) -> Option<&Value> {
        match self.extras.get(name) {
            Some(ContextValue::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn tools(&self) -> Option<&ToolBindings> {
        match self.extras.get(param::TOOLS) {
            Some(ContextValue::Tools(tools)) => Some(tools),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Pipe: Send + Sync + 'static {
    /// Context parameters this pipe accepts besides `body`.
    fn params(&self) -> &'static [&'static str];

    fn pipe(&self, args: PipeArgs) -> PipeCall;

    async fn sub_pipes(&self, _valves: Option<&Valves>) -> Result<Vec<SubPipe>, PipeError> {
        Ok(Vec::new())
    }
}

/// A pipe together with the capabilities it declared when it was loaded.
pub struct PipeModule {
    pub pipe: Arc<dyn Pipe>,
    pub kind: ProviderKind,
    pub configuration: Configuration,
    pub display_name: Option<String>,
}

pub struct LoaderContext {
    pub http: reqwest::Client,
}

pub struct PipeEntry {
    pub module: &'static str,
    pub factory: fn(&LoaderContext) -> PipeModule,
}

inventory::collect!(PipeEntry);

pub fn find_entry(module: &str) -> Option<&'static PipeEntry> {
    inventory::iter::<PipeEntry>
        .into_iter()
        .find(|entry| entry.module == module)
}

pub fn module_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = inventory::iter::<PipeEntry>
        .into_iter()
        .map(|entry| entry.module)
        .collect();
    names.sort_unstable();
    names
}

/// Last user message content as plain text.
pub fn last_user_message(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    let message = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))?;
    match message.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}
