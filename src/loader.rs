use crate::error::{AppError, StoreError};
use crate::functions::{FunctionStore, FunctionType};
use crate::pipes::{LoaderContext, PipeModule, ValvesError, find_entry};
use async_trait::async_trait;
use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("function {0} not found")]
    NotFound(String),
    #[error("function {id} names unknown module {module}")]
    UnknownModule { id: String, module: String },
    #[error("function {0} is not a pipe")]
    NotAPipe(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("function {id} has invalid valves: {source}")]
    Valves {
        id: String,
        #[source]
        source: ValvesError,
    },
}

impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        let (status, code) = match &err {
            LoadError::NotFound(_) => (StatusCode::NOT_FOUND, "function_not_found"),
            LoadError::UnknownModule { .. } => (StatusCode::NOT_FOUND, "unknown_module"),
            LoadError::NotAPipe(_) => (StatusCode::BAD_REQUEST, "not_a_pipe"),
            LoadError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            LoadError::Valves { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_valves"),
        };
        AppError::new(status, code, err.to_string())
    }
}

/// Turns a stored function id into an executable module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, pipe_id: &str) -> Result<PipeModule, LoadError>;
}

/// Instantiates modules from the pipes compiled into this binary.
pub struct BuiltinModuleLoader {
    functions: FunctionStore,
    ctx: LoaderContext,
}

impl BuiltinModuleLoader {
    pub fn new(functions: FunctionStore, ctx: LoaderContext) -> Self {
        Self { functions, ctx }
    }
}

#[async_trait]
impl ModuleLoader for BuiltinModuleLoader {
    async fn load(&self, pipe_id: &str) -> Result<PipeModule, LoadError> {
        let record = self
            .functions
            .get_function_by_id(pipe_id)
            .await?
            .ok_or_else(|| LoadError::NotFound(pipe_id.to_string()))?;
        if record.function_type != FunctionType::Pipe {
            return Err(LoadError::NotAPipe(record.id));
        }
        let entry = find_entry(&record.module).ok_or_else(|| LoadError::UnknownModule {
            id: record.id.clone(),
            module: record.module.clone(),
        })?;
        tracing::info!(pipe_id = %record.id, module = %record.module, "loaded pipe module");
        Ok((entry.factory)(&self.ctx))
    }
}
