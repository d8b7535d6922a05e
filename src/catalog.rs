use crate::config::{ArenaSettings, default_arena_model};
use crate::error::StoreError;
use crate::functions::{FunctionRecord, FunctionStore, FunctionType};
use crate::pipes::{ProviderKind, SubPipe, SubPipeSource};
use crate::registry::{PipeRegistry, ResolvedPipe};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeFlag {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub name: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipe: Option<PipeFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arena: Option<bool>,
}

impl ModelCatalogEntry {
    fn pipe(id: String, name: String, created: i64, kind: FunctionType) -> Self {
        Self {
            id,
            name,
            object: "model".to_string(),
            created,
            owned_by: "openai".to_string(),
            pipe: Some(PipeFlag {
                kind: kind.as_str().to_string(),
            }),
            info: None,
            arena: None,
        }
    }
}

/// Catalog entries for every active pipe. A pipe that fails to load is
/// logged and left out; a manifold that fails to enumerate lists nothing.
pub async fn pipe_models(
    functions: &FunctionStore,
    registry: &PipeRegistry,
) -> Result<Vec<ModelCatalogEntry>, StoreError> {
    let records = functions
        .get_functions_by_type(FunctionType::Pipe, true)
        .await?;
    let mut entries = Vec::new();
    for record in records {
        let resolved = match registry.resolve(&record.id).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(pipe_id = %record.id, error = %err, "skipping pipe that failed to load");
                continue;
            }
        };
        match &resolved.module.module.kind {
            ProviderKind::Manifold(source) => {
                let subs = sub_pipes(&record, &resolved, source).await;
                tracing::debug!(pipe_id = %record.id, count = subs.len(), "manifold enumerated");
                let prefix = resolved.module.module.display_name.as_deref();
                let mut seen = HashSet::new();
                for sub in subs {
                    if !seen.insert(sub.id.clone()) {
                        tracing::warn!(pipe_id = %record.id, sub_id = %sub.id, "skipping repeated sub-pipe id");
                        continue;
                    }
                    let name = match prefix {
                        Some(prefix) => format!("{prefix}{}", sub.name),
                        None => sub.name,
                    };
                    entries.push(ModelCatalogEntry::pipe(
                        format!("{}.{}", record.id, sub.id),
                        name,
                        record.created_at,
                        record.function_type,
                    ));
                }
            }
            ProviderKind::Simple => {
                tracing::debug!(pipe_id = %record.id, "single pipe");
                entries.push(ModelCatalogEntry::pipe(
                    record.id.clone(),
                    record.name.clone(),
                    record.created_at,
                    FunctionType::Pipe,
                ));
            }
        }
    }
    Ok(entries)
}

async fn sub_pipes(
    record: &FunctionRecord,
    resolved: &ResolvedPipe,
    source: &SubPipeSource,
) -> Vec<SubPipe> {
    match source {
        SubPipeSource::Static(subs) => subs.clone(),
        SubPipeSource::Provider => {
            match resolved.module.module.pipe.sub_pipes(resolved.valves.as_ref()).await {
                Ok(subs) => subs,
                Err(err) => {
                    tracing::warn!(pipe_id = %record.id, error = %err, "manifold enumeration failed");
                    Vec::new()
                }
            }
        }
    }
}

pub fn arena_models(settings: &ArenaSettings) -> Vec<ModelCatalogEntry> {
    if !settings.enabled {
        return Vec::new();
    }
    let configured = if settings.models.is_empty() {
        vec![default_arena_model()]
    } else {
        settings.models.clone()
    };
    let now = chrono::Utc::now().timestamp();
    configured
        .into_iter()
        .map(|model| ModelCatalogEntry {
            id: model.id,
            name: model.name,
            object: "model".to_string(),
            created: now,
            owned_by: "arena".to_string(),
            pipe: None,
            info: Some(serde_json::json!({ "meta": model.meta })),
            arena: Some(true),
        })
        .collect()
}

/// Pipe entries followed by arena entries. Built fresh on every call.
pub async fn list_models(
    functions: &FunctionStore,
    registry: &PipeRegistry,
    arena: &ArenaSettings,
) -> Result<Vec<ModelCatalogEntry>, StoreError> {
    let mut models = pipe_models(functions, registry).await?;
    models.extend(arena_models(arena));
    metrics::counter!("pipegate_catalog_builds_total").increment(1);
    Ok(models)
}
