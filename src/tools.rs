use crate::auth::SessionUser;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolBinding {
    pub toolkit_id: String,
    pub spec: Value,
}

/// Resolved tools keyed by function name.
pub type ToolBindings = BTreeMap<String, ToolBinding>;

/// What a resolver may look at when binding tools for one call.
pub struct ToolContext<'a> {
    pub model: Option<&'a Value>,
    pub messages: &'a Value,
    pub files: &'a Value,
}

#[async_trait]
pub trait ToolResolver: Send + Sync {
    async fn resolve(
        &self,
        tool_ids: &[String],
        user: &SessionUser,
        context: ToolContext<'_>,
    ) -> ToolBindings;
}

/// Resolver used when no tool subsystem is attached.
pub struct NoTools;

#[async_trait]
impl ToolResolver for NoTools {
    async fn resolve(
        &self,
        tool_ids: &[String],
        _user: &SessionUser,
        _context: ToolContext<'_>,
    ) -> ToolBindings {
        if !tool_ids.is_empty() {
            tracing::debug!(?tool_ids, "tool ids requested but no tool resolver is attached");
        }
        ToolBindings::new()
    }
}
