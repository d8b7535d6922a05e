use crate::functions::FunctionStore;
use crate::loader::{LoadError, ModuleLoader};
use crate::pipes::{PipeModule, Valves};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A loaded pipe module held by the registry cache.
pub struct LoadedModule {
    pub id: String,
    pub module: PipeModule,
    valves: RwLock<Option<Valves>>,
}

impl LoadedModule {
    pub fn new(id: impl Into<String>, module: PipeModule) -> Self {
        Self {
            id: id.into(),
            module,
            valves: RwLock::new(None),
        }
    }

    /// Valves from the most recent resolve of this module.
    pub async fn current_valves(&self) -> Option<Valves> {
        self.valves.read().await.clone()
    }
}

/// A cached module plus the valves constructed for this invocation.
#[derive(Clone)]
pub struct ResolvedPipe {
    pub module: Arc<LoadedModule>,
    pub valves: Option<Valves>,
}

#[derive(Clone)]
pub struct PipeRegistry {
    loader: Arc<dyn ModuleLoader>,
    functions: FunctionStore,
    cache: Arc<DashMap<String, Arc<LoadedModule>>>,
}

impl PipeRegistry {
    pub fn new(loader: Arc<dyn ModuleLoader>, functions: FunctionStore) -> Self {
        Self {
            loader,
            functions,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// The cached module for `pipe_id`, loading it on a miss. Valves are not
    /// touched.
    pub async fn module(&self, pipe_id: &str) -> Result<Arc<LoadedModule>, LoadError> {
        if let Some(module) = self.cache.get(pipe_id).map(|entry| entry.value().clone()) {
            return Ok(module);
        }
        let loaded = self.loader.load(pipe_id).await?;
        // Concurrent misses may both load; the first insert is kept.
        Ok(self
            .cache
            .entry(pipe_id.to_string())
            .or_insert_with(|| Arc::new(LoadedModule::new(pipe_id, loaded)))
            .value()
            .clone())
    }

    pub async fn resolve(&self, pipe_id: &str) -> Result<ResolvedPipe, LoadError> {
        let module = self.module(pipe_id).await?;

        let valves = match module.module.configuration.valves() {
            Some(spec) => {
                let stored = self.functions.get_function_valves_by_id(pipe_id).await?;
                let valves = spec.construct(stored).map_err(|source| LoadError::Valves {
                    id: pipe_id.to_string(),
                    source,
                })?;
                *module.valves.write().await = Some(valves.clone());
                Some(valves)
            }
            None => None,
        };

        Ok(ResolvedPipe { module, valves })
    }

    pub fn evict(&self, pipe_id: &str) -> bool {
        let removed = self.cache.remove(pipe_id).is_some();
        if removed {
            tracing::debug!(pipe_id, "evicted cached pipe module");
        }
        removed
    }

    pub fn is_cached(&self, pipe_id: &str) -> bool {
        self.cache.contains_key(pipe_id)
    }
}
