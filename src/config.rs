use crate::auth::UserRole;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ArenaModelConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub meta: Value,
}

pub fn default_arena_model() -> ArenaModelConfig {
    ArenaModelConfig {
        id: "arena-model".to_string(),
        name: "Arena Model".to_string(),
        meta: json!({
            "profile_image_url": "/favicon.png",
            "description": "Submit your questions to anonymous AI chatbots and vote on the best response.",
            "model_ids": null
        }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArenaSettings {
    pub enabled: bool,
    pub models: Vec<ArenaModelConfig>,
}

/// A bearer token bound to a user identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserTokenConfig {
    pub token: String,
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_role")]
    pub role: UserRole,
}

fn default_role() -> UserRole {
    UserRole::User
}

pub fn parse_arena_models(raw: &str) -> Result<Vec<ArenaModelConfig>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|err| format!("arena_models_invalid: {err}"))
}

pub fn parse_user_tokens(raw: &str) -> Result<Vec<UserTokenConfig>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|err| format!("users_invalid: {err}"))
}

pub fn parse_bool_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
