use crate::auth::SessionUser;
use serde_json::{Map, Value, json};

/// Copies model-level sampling parameters onto an OpenAI request body.
pub fn apply_model_params_to_body_openai(params: &Map<String, Value>, body: &mut Map<String, Value>) {
    for key in ["temperature", "top_p", "frequency_penalty"] {
        if let Some(value) = params.get(key).and_then(Value::as_f64) {
            body.insert(key.to_string(), json!(value));
        }
    }
    for key in ["max_tokens", "seed"] {
        if let Some(value) = params.get(key).and_then(Value::as_i64) {
            body.insert(key.to_string(), json!(value));
        }
    }
    if let Some(stop) = params.get("stop").and_then(Value::as_array) {
        let stop: Vec<Value> = stop
            .iter()
            .filter_map(Value::as_str)
            .map(|s| Value::String(decode_escapes(s)))
            .collect();
        body.insert("stop".to_string(), Value::Array(stop));
    }
}

/// Stop sequences are entered as typed text, so `\n` arrives as two characters.
fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub fn render_system_prompt(template: &str, user: Option<&SessionUser>) -> String {
    let now = chrono::Local::now();
    let mut rendered = template
        .replace("{{CURRENT_DATE}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{CURRENT_TIME}}", &now.format("%H:%M:%S").to_string())
        .replace(
            "{{CURRENT_DATETIME}}",
            &now.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
    let name = user.map(|u| u.name.as_str()).unwrap_or("Unknown");
    rendered = rendered.replace("{{USER_NAME}}", name);
    rendered
}

/// Prepends `content` to a leading system message, or inserts one.
pub fn add_or_update_system_message(content: &str, messages: &mut Vec<Value>) {
    if let Some(first) = messages.first_mut() {
        if first.get("role").and_then(Value::as_str) == Some("system") {
            let existing = first
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            first["content"] = Value::String(format!("{content}\n{existing}"));
            return;
        }
    }
    messages.insert(0, json!({"role": "system", "content": content}));
}

pub fn apply_model_system_prompt_to_body(
    params: &Map<String, Value>,
    body: &mut Map<String, Value>,
    user: Option<&SessionUser>,
) {
    let Some(system) = params.get("system").and_then(Value::as_str) else {
        return;
    };
    if system.is_empty() {
        return;
    }
    let rendered = render_system_prompt(system, user);
    let messages = body
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(messages) = messages {
        add_or_update_system_message(&rendered, messages);
    }
}
