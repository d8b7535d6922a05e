use crate::auth::{AuthState, SessionUser};
use crate::completion::ChatCompletions;
use crate::config::{ArenaSettings, UserTokenConfig, parse_arena_models, parse_bool_flag, parse_user_tokens};
use crate::error::{AppError, AppResult};
use crate::events::EventHub;
use crate::functions::FunctionStore;
use crate::latency::LatencyStore;
use crate::loader::{BuiltinModuleLoader, ModuleLoader};
use crate::models::ModelStore;
use crate::binder::ParameterBinder;
use crate::pipes::LoaderContext;
use crate::registry::PipeRegistry;
use crate::tools::{NoTools, ToolResolver};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub functions: FunctionStore,
    pub models: ModelStore,
    pub latency: LatencyStore,
    pub registry: PipeRegistry,
    pub events: EventHub,
    pub completions: ChatCompletions,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub arena: ArenaSettings,
    pub users: Vec<UserTokenConfig>,
}

impl RuntimeConfig {
    pub fn from_env() -> AppResult<Self> {
        let listen = env_non_empty("PIPEGATE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("PIPEGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        let arena = ArenaSettings {
            enabled: env_non_empty("PIPEGATE_ENABLE_ARENA_MODELS")
                .map(|raw| parse_bool_flag(&raw))
                .unwrap_or(true),
            models: parse_arena_models(&env_non_empty("PIPEGATE_ARENA_MODELS").unwrap_or_default())
                .map_err(|err| AppError::internal("config_invalid", err))?,
        };
        let users = parse_user_tokens(&env_non_empty("PIPEGATE_USERS").unwrap_or_default())
            .map_err(|err| AppError::internal("config_invalid", err))?;
        Ok(Self {
            listen,
            metrics_path,
            database_dsn,
            arena,
            users,
        })
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()?).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    load_state_with(runtime, Arc::new(NoTools)).await
}

/// Like [`load_state_with_runtime`], with a caller-provided tool resolver.
pub async fn load_state_with(
    runtime: RuntimeConfig,
    tools: Arc<dyn ToolResolver>,
) -> AppResult<AppState> {
    let auth = AuthState::new();
    for user in &runtime.users {
        auth.register_token(
            user.token.clone(),
            SessionUser {
                id: user.id.clone(),
                email: user.email.clone(),
                name: user.name.clone(),
                role: user.role,
            },
        );
    }

    let http = reqwest::Client::builder()
        .user_agent("pipegate/0.1")
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::internal("database_init_failed", err))?;

    let pool = pool_options(&runtime.database_dsn)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| AppError::internal("database_dsn_parse_failed", err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::internal("database_init_failed", err.to_string()))?;

    let functions = FunctionStore::new(pool.clone())
        .await
        .map_err(|err| AppError::internal("function_store_init_failed", err.to_string()))?;
    let models = ModelStore::new(pool.clone())
        .await
        .map_err(|err| AppError::internal("model_store_init_failed", err.to_string()))?;
    let latency = LatencyStore::new(pool)
        .await
        .map_err(|err| AppError::internal("latency_store_init_failed", err.to_string()))?;

    let metrics = init_metrics()?;

    let loader: Arc<dyn ModuleLoader> = Arc::new(BuiltinModuleLoader::new(
        functions.clone(),
        LoaderContext { http: http.clone() },
    ));
    let registry = PipeRegistry::new(loader, functions.clone());
    let events = EventHub::default();
    let completions = ChatCompletions::new(
        registry.clone(),
        ParameterBinder::new(functions.clone()),
        models.clone(),
        events.clone(),
        tools,
    );

    tracing::info!(
        modules = ?crate::pipes::module_names(),
        arena_enabled = runtime.arena.enabled,
        users = runtime.users.len(),
        "state loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth,
        http,
        metrics,
        functions,
        models,
        latency,
        registry,
        events,
        completions,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::internal("metrics_init_failed", "metrics recorder not available")
    })
}

fn resolve_database_dsn() -> String {
    env_non_empty("PIPEGATE_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/pipegate.db".to_string())
}

/// Each in-memory connection is its own database, so those get exactly one
/// connection that is never recycled.
fn pool_options(dsn: &str) -> sqlx::sqlite::SqlitePoolOptions {
    let options = sqlx::sqlite::SqlitePoolOptions::new();
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options.max_connections(5)
    }
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router();
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/models", get(crate::handlers::list_models))
        .route(
            "/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/performance/latency",
            post(crate::admin_handlers::record_latency)
                .get(crate::admin_handlers::list_latency)
                .delete(crate::admin_handlers::delete_latency),
        )
        .route(
            "/functions/create",
            post(crate::admin_handlers::create_function),
        )
        .route(
            "/functions/id/{id}/valves/update",
            post(crate::admin_handlers::update_function_valves),
        )
        .route(
            "/functions/id/{id}/valves/user/update",
            post(crate::admin_handlers::update_user_valves),
        )
        .route(
            "/functions/id/{id}/toggle",
            post(crate::admin_handlers::toggle_function),
        )
        .route("/models/create", post(crate::admin_handlers::create_model))
}
