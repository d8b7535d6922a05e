use crate::functions::FunctionStore;
use crate::pipes::{ContextExtras, ContextValue, PipeArgs, Valves};
use crate::registry::ResolvedPipe;
use serde_json::Value;

/// Pipe id for a model id: everything before the first `.`.
pub fn pipe_id_from_model(model: &str) -> &str {
    model.split_once('.').map(|(id, _)| id).unwrap_or(model)
}

/// Keeps `body` plus the extras the pipe declared; drops everything else.
pub fn bind_declared(
    declared: &[&str],
    body: Value,
    valves: Option<Valves>,
    extras: ContextExtras,
) -> PipeArgs {
    let mut args = PipeArgs::new(body, valves);
    for (name, value) in extras {
        if declared.contains(&name.as_str()) {
            args.insert(name, value);
        }
    }
    args
}

#[derive(Clone)]
pub struct ParameterBinder {
    functions: FunctionStore,
}

impl ParameterBinder {
    pub fn new(functions: FunctionStore) -> Self {
        Self { functions }
    }

    pub async fn bind(&self, resolved: &ResolvedPipe, body: Value, extras: ContextExtras) -> PipeArgs {
        let module = &resolved.module.module;
        let mut args = bind_declared(
            module.pipe.params(),
            body,
            resolved.valves.clone(),
            extras,
        );

        let Some(spec) = module.configuration.user_valves() else {
            return args;
        };
        let pipe_id = resolved.module.id.clone();
        let Some(user) = args.user_mut() else {
            return args;
        };

        let stored = match self
            .functions
            .get_user_valves_by_id_and_user_id(&pipe_id, &user.id)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(pipe_id = %pipe_id, user_id = %user.id, error = %err, "failed to read user valves");
                None
            }
        };
        let valves = match spec.construct(stored) {
            Ok(valves) => valves,
            Err(err) => {
                tracing::warn!(
                    pipe_id = %pipe_id,
                    user_id = %user.id,
                    error = %err,
                    "invalid user valves, using defaults"
                );
                spec.defaults()
            }
        };
        user.valves = Some(valves);
        args
    }
}

/// Builds the `__user__` context value from a session user.
pub fn user_context(user: &crate::auth::SessionUser) -> ContextValue {
    ContextValue::User(crate::pipes::UserContext {
        id: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        role: user.role.as_str().to_string(),
        valves: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::{
        Configuration, PipeCall, PipeModule, PipeOutput, ProviderKind, ValvesSpec, param,
    };
    use crate::registry::LoadedModule;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Prefs {
        verbose: bool,
    }

    struct Greeter;

    impl crate::pipes::Pipe for Greeter {
        fn params(&self) -> &'static [&'static str] {
            &[param::USER]
        }

        fn pipe(&self, _args: PipeArgs) -> PipeCall {
            PipeCall::Ready(Ok(PipeOutput::Text("hi".into())))
        }
    }

    async fn fixture() -> (ParameterBinder, FunctionStore, ResolvedPipe) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        let functions = FunctionStore::new(pool).await.expect("functions");
        let module = PipeModule {
            pipe: Arc::new(Greeter),
            kind: ProviderKind::Simple,
            configuration: Configuration::Configurable {
                valves: None,
                user_valves: Some(ValvesSpec::of::<Prefs>("Prefs")),
            },
            display_name: None,
        };
        let resolved = ResolvedPipe {
            module: Arc::new(LoadedModule::new("greeter", module)),
            valves: None,
        };
        (ParameterBinder::new(functions.clone()), functions, resolved)
    }

    fn extras() -> ContextExtras {
        let mut extras = ContextExtras::new();
        for name in [
            param::EVENT_EMITTER,
            param::EVENT_CALL,
            param::TASK,
            param::TASK_BODY,
            param::FILES,
            param::METADATA,
            param::TOOLS,
            "__model__",
            "__messages__",
            "__request__",
        ] {
            extras.insert(name.to_string(), ContextValue::Json(json!(null)));
        }
        extras.insert(
            param::USER.to_string(),
            ContextValue::User(crate::pipes::UserContext {
                id: "u1".into(),
                email: "u@example.com".into(),
                name: "U".into(),
                role: "user".into(),
                valves: None,
            }),
        );
        extras
    }

    #[test]
    fn only_declared_parameters_are_bound() {
        let args = bind_declared(&[param::USER], json!({"model": "m"}), None, extras());
        assert_eq!(args.keys(), vec!["body", "__user__"]);
        assert_eq!(args.user().unwrap().id, "u1");
    }

    #[test]
    fn pipe_id_stops_at_first_dot() {
        assert_eq!(pipe_id_from_model("openai.gpt-4o"), "openai");
        assert_eq!(pipe_id_from_model("a.b.c"), "a");
        assert_eq!(pipe_id_from_model("echo"), "echo");
    }

    #[tokio::test]
    async fn stored_user_valves_are_attached() {
        let (binder, functions, resolved) = fixture().await;
        let stored = json!({"verbose": true}).as_object().cloned().unwrap();
        functions.update_user_valves("greeter", "u1", &stored).await.unwrap();

        let args = binder.bind(&resolved, json!({"model": "greeter"}), extras()).await;
        let valves = args.user().unwrap().valves.clone().unwrap();
        assert_eq!(valves.as_value(), &json!({"verbose": true}));
    }

    #[tokio::test]
    async fn invalid_user_valves_fall_back_to_defaults() {
        let (binder, functions, resolved) = fixture().await;
        let stored = json!({"verbose": "very"}).as_object().cloned().unwrap();
        functions.update_user_valves("greeter", "u1", &stored).await.unwrap();

        let args = binder.bind(&resolved, json!({"model": "greeter"}), extras()).await;
        let valves = args.user().unwrap().valves.clone().unwrap();
        assert_eq!(valves.as_value(), &json!({"verbose": false}));
    }
}
