use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use http_body_util::BodyExt;
use pipegate::auth::UserRole;
use pipegate::config::{ArenaModelConfig, ArenaSettings, UserTokenConfig};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN: &str = "admin-token";
const USER: &str = "user-token";
const PENDING: &str = "pending-token";

const UPSTREAM_SSE: &str = "data: {\"id\":\"up-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";

struct TestContext {
    router: Router,
    state: pipegate::app::AppState,
    upstream_base: String,
    upstream_models: Arc<Mutex<Vec<String>>>,
    _temp_dir: TempDir,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("json body")
    }
}

async fn start_upstream() -> (String, Arc<Mutex<Vec<String>>>) {
    let seen_models: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    async fn models(headers: HeaderMap) -> impl IntoResponse {
        let authorized = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            == Some("Bearer upstream-key");
        if !authorized {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"}))).into_response();
        }
        Json(json!({
            "object": "list",
            "data": [{"id": "gpt-a", "object": "model"}, {"id": "gpt-b", "object": "model"}]
        }))
        .into_response()
    }

    async fn chat(
        State(seen_models): State<Arc<Mutex<Vec<String>>>>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Ok(mut lock) = seen_models.lock() {
            lock.push(model.clone());
        }
        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            return ([(CONTENT_TYPE, "text/event-stream")], UPSTREAM_SSE).into_response();
        }
        Json(json!({
            "id": "up-2",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "finish_reason": "stop",
                "message": {"role": "assistant", "content": "upstream says hi"}
            }]
        }))
        .into_response()
    }

    let router = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat))
        .with_state(Arc::clone(&seen_models));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}/v1"), seen_models)
}

fn token_user(token: &str, id: &str, name: &str, role: UserRole) -> UserTokenConfig {
    UserTokenConfig {
        token: token.to_string(),
        id: id.to_string(),
        email: format!("{id}@example.com"),
        name: name.to_string(),
        role,
    }
}

async fn setup_with_arena(arena: ArenaSettings) -> TestContext {
    let (upstream_base, upstream_models) = start_upstream().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("pipegate.db");
    let state = pipegate::app::load_state_with_runtime(pipegate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        arena,
        users: vec![
            token_user(ADMIN, "admin-1", "Admin", UserRole::Admin),
            token_user(USER, "user-1", "Ada", UserRole::User),
            token_user(PENDING, "pending-1", "Pending", UserRole::Pending),
        ],
    })
    .await
    .expect("load state");
    let router = pipegate::app::build_app(state.clone());
    TestContext {
        router,
        state,
        upstream_base,
        upstream_models,
        _temp_dir: temp_dir,
    }
}

async fn setup() -> TestContext {
    setup_with_arena(ArenaSettings::default()).await
}

async fn send(
    ctx: &TestContext,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body: String::from_utf8_lossy(&bytes).to_string(),
    }
}

async fn create_function(ctx: &TestContext, id: &str, name: &str, module: &str) {
    let reply = send(
        ctx,
        "POST",
        "/functions/create",
        Some(ADMIN),
        Some(json!({"id": id, "name": name, "type": "pipe", "module": module})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
}

async fn set_valves(ctx: &TestContext, id: &str, valves: Value) -> Value {
    let reply = send(
        ctx,
        "POST",
        &format!("/functions/id/{id}/valves/update"),
        Some(ADMIN),
        Some(valves),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    reply.json()
}

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

fn sse_frames(body: &str) -> Vec<&str> {
    body.split("\n\n").filter(|f| !f.is_empty()).collect()
}

fn frame_json(frame: &str) -> Value {
    serde_json::from_str(frame.strip_prefix("data: ").expect("data frame")).expect("json frame")
}

fn model_ids(reply: &Reply) -> Vec<String> {
    reply.json()["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn models_require_a_verified_user() {
    let ctx = setup().await;
    let reply = send(&ctx, "GET", "/models", None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json()["code"], "unauthorized");

    let reply = send(&ctx, "GET", "/models", Some(PENDING), None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["data"], json!([]));
}

#[tokio::test]
async fn catalog_lists_simple_pipes_and_manifold_sub_pipes() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    create_function(&ctx, "gpt", "GPT", "openai").await;
    create_function(&ctx, "broken", "Broken", "openai").await;
    set_valves(
        &ctx,
        "gpt",
        json!({"base_url": ctx.upstream_base, "api_key": "upstream-key"}),
    )
    .await;

    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(model_ids(&reply), vec!["echo_pipe", "gpt.gpt-a", "gpt.gpt-b"]);

    let data = reply.json()["data"].clone();
    assert_eq!(data[0]["name"], "Echo");
    assert_eq!(data[0]["object"], "model");
    assert_eq!(data[0]["owned_by"], "openai");
    assert_eq!(data[0]["pipe"], json!({"type": "pipe"}));
    assert_eq!(data[1]["name"], "OpenAI: gpt-a");
    assert!(data[1].get("arena").is_none());
}

#[tokio::test]
async fn static_model_list_needs_no_upstream_call() {
    let ctx = setup().await;
    create_function(&ctx, "fixed", "Fixed", "openai").await;
    set_valves(
        &ctx,
        "fixed",
        json!({"models": [{"id": "one", "name": "One"}, {"id": "two", "name": "Two"}]}),
    )
    .await;
    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(model_ids(&reply), vec!["fixed.one", "fixed.two"]);
}

#[tokio::test]
async fn repeated_sub_pipe_ids_are_listed_once() {
    let ctx = setup().await;
    create_function(&ctx, "fixed", "Fixed", "openai").await;
    set_valves(
        &ctx,
        "fixed",
        json!({"models": [
            {"id": "one", "name": "One"},
            {"id": "one", "name": "Again"},
            {"id": "two", "name": "Two"}
        ]}),
    )
    .await;
    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(model_ids(&reply), vec!["fixed.one", "fixed.two"]);
    assert_eq!(reply.json()["data"][0]["name"], "OpenAI: One");
}

#[tokio::test]
async fn static_manifold_lists_and_routes_each_mode() {
    let ctx = setup().await;
    create_function(&ctx, "modes", "Modes", "echo_modes").await;

    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(
        model_ids(&reply),
        vec![
            "modes.text",
            "modes.lines",
            "modes.stream",
            "modes.object",
            "modes.structured"
        ]
    );
    assert_eq!(reply.json()["data"][1]["name"], "Echo Lines");

    let body = json!({
        "model": "modes.lines",
        "stream": true,
        "messages": [{"role": "user", "content": "a b"}]
    });
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(body)).await;
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 4);
    assert_eq!(frame_json(frames[0])["model"], "modes.lines");
    assert_eq!(frames[3], "data: [DONE]");
}

#[tokio::test]
async fn malformed_json_bodies_use_the_error_envelope() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/chat/completions")
        .header(AUTHORIZATION, format!("Bearer {USER}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json error body");
    assert_eq!(body["code"], "invalid_json");
    assert!(body["detail"].is_string());

    let reply = send(
        &ctx,
        "POST",
        "/performance/latency",
        Some(ADMIN),
        Some(json!({"chat_id": "c1"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.json()["code"], "invalid_request");

    let req = Request::builder()
        .method("POST")
        .uri("/models/create")
        .header(AUTHORIZATION, format!("Bearer {ADMIN}"))
        .body(Body::from("{}"))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json error body");
    assert_eq!(body["code"], "unsupported_media_type");
}

#[tokio::test]
async fn arena_entries_follow_pipe_entries() {
    let ctx = setup_with_arena(ArenaSettings {
        enabled: true,
        models: Vec::new(),
    })
    .await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(model_ids(&reply), vec!["echo_pipe", "arena-model"]);
    let data = reply.json()["data"].clone();
    assert_eq!(data[1]["arena"], true);
    assert_eq!(data[1]["owned_by"], "arena");
    assert_eq!(data[1]["name"], "Arena Model");

    let ctx = setup_with_arena(ArenaSettings {
        enabled: true,
        models: vec![
            ArenaModelConfig {
                id: "duel".into(),
                name: "Duel".into(),
                meta: json!({"model_ids": ["echo_pipe"]}),
            },
            ArenaModelConfig {
                id: "trio".into(),
                name: "Trio".into(),
                meta: json!({}),
            },
        ],
    })
    .await;
    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert_eq!(model_ids(&reply), vec!["duel", "trio"]);
    assert_eq!(
        reply.json()["data"][0]["info"],
        json!({"meta": {"model_ids": ["echo_pipe"]}})
    );
}

#[tokio::test]
async fn toggled_functions_leave_the_catalog() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(&ctx, "POST", "/functions/id/echo_pipe/toggle", Some(ADMIN), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["is_active"], false);

    let reply = send(&ctx, "GET", "/models", Some(USER), None).await;
    assert!(model_ids(&reply).is_empty());
}

#[tokio::test]
async fn function_creation_is_validated() {
    let ctx = setup().await;
    let reply = send(
        &ctx,
        "POST",
        "/functions/create",
        Some(ADMIN),
        Some(json!({"id": "x", "name": "X", "module": "no_such_module"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["code"], "unknown_module");

    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(
        &ctx,
        "POST",
        "/functions/create",
        Some(ADMIN),
        Some(json!({"id": "echo_pipe", "name": "Again", "module": "echo"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["code"], "id_taken");

    let reply = send(
        &ctx,
        "POST",
        "/functions/create",
        Some(USER),
        Some(json!({"id": "mine", "name": "Mine", "module": "echo"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn text_output_streams_chunk_finish_and_done() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", true))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 3);
    let chunk = frame_json(frames[0]);
    assert_eq!(chunk["object"], "chat.completion.chunk");
    assert_eq!(chunk["model"], "echo_pipe");
    assert_eq!(chunk["choices"][0]["delta"]["content"], "hello");
    assert_eq!(frame_json(frames[1])["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[2], "data: [DONE]");
    assert!(reply.body.ends_with("data: [DONE]"));
}

#[tokio::test]
async fn sync_and_async_sequences_differ_only_in_termination() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let body = json!({
        "model": "echo_pipe",
        "stream": true,
        "messages": [{"role": "user", "content": "a b"}]
    });

    set_valves(&ctx, "echo_pipe", json!({"mode": "lines"})).await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(body.clone())).await;
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 4);
    assert_eq!(frame_json(frames[0])["choices"][0]["delta"]["content"], "a ");
    assert_eq!(frame_json(frames[1])["choices"][0]["delta"]["content"], "b");
    assert_eq!(frames[3], "data: [DONE]");

    set_valves(&ctx, "echo_pipe", json!({"mode": "stream"})).await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(body)).await;
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 2);
    assert!(!reply.body.contains("[DONE]"));
}

#[tokio::test]
async fn non_streaming_sequences_are_concatenated() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    set_valves(&ctx, "echo_pipe", json!({"mode": "lines", "prefix": "> "})).await;

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "> hello");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn object_and_structured_outputs() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;

    set_valves(&ctx, "echo_pipe", json!({"mode": "object"})).await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json(), json!({"model": "echo_pipe", "echo": "hello"}));

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", true))).await;
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frame_json(frames[0]), json!({"model": "echo_pipe", "echo": "hello"}));

    set_valves(&ctx, "echo_pipe", json!({"mode": "structured"})).await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json(), json!({"model": "echo_pipe", "content": "hello"}));
}

#[tokio::test]
async fn pipe_failures_become_error_envelopes() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    set_valves(&ctx, "echo_pipe", json!({"mode": "fail"})).await;

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", true))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "data: {\"error\":{\"detail\":\"hello\"}}\n\n");

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({"error": {"detail": "hello"}}));
}

#[tokio::test]
async fn unknown_models_are_not_found() {
    let ctx = setup().await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("nope", true))).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["code"], "function_not_found");
}

#[tokio::test]
async fn valves_updates_apply_without_eviction() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json()["choices"][0]["message"]["content"], "hello");
    assert!(ctx.state.registry.is_cached("echo_pipe"));

    let stored = set_valves(&ctx, "echo_pipe", json!({"prefix": "re: "})).await;
    assert_eq!(stored, json!({"prefix": "re: ", "mode": "text"}));

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json()["choices"][0]["message"]["content"], "re: hello");
}

#[tokio::test]
async fn invalid_valves_are_rejected() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(
        &ctx,
        "POST",
        "/functions/id/echo_pipe/valves/update",
        Some(ADMIN),
        Some(json!({"mode": "shout"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["code"], "invalid_valves");
}

#[tokio::test]
async fn user_valves_are_per_user() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(
        &ctx,
        "POST",
        "/functions/id/echo_pipe/valves/user/update",
        Some(USER),
        Some(json!({"uppercase": true})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({"uppercase": true}));

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json()["choices"][0]["message"]["content"], "HELLO");

    let reply = send(&ctx, "POST", "/chat/completions", Some(ADMIN), Some(chat_body("echo_pipe", false))).await;
    assert_eq!(reply.json()["choices"][0]["message"]["content"], "hello");
}

#[tokio::test]
async fn manifold_streams_are_forwarded_verbatim() {
    let ctx = setup().await;
    create_function(&ctx, "gpt", "GPT", "openai").await;
    set_valves(
        &ctx,
        "gpt",
        json!({"base_url": ctx.upstream_base, "api_key": "upstream-key"}),
    )
    .await;

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("gpt.gpt-a", true))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, UPSTREAM_SSE);

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("gpt.gpt-b", false))).await;
    let body = reply.json();
    assert_eq!(body["id"], "up-2");
    assert_eq!(body["choices"][0]["message"]["content"], "upstream says hi");

    let seen = ctx.upstream_models.lock().unwrap().clone();
    assert_eq!(seen, vec!["gpt-a", "gpt-b"]);
}

#[tokio::test]
async fn upstream_failures_surface_as_error_frames() {
    let ctx = setup().await;
    create_function(&ctx, "gpt", "GPT", "openai").await;
    set_valves(
        &ctx,
        "gpt",
        json!({"base_url": "http://127.0.0.1:9/v1", "api_key": "upstream-key"}),
    )
    .await;
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("gpt.gpt-a", true))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let frames = sse_frames(&reply.body);
    assert_eq!(frames.len(), 1);
    assert!(frame_json(frames[0])["error"]["detail"].is_string());
}

#[tokio::test]
async fn model_overrides_route_to_their_base_pipe() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let reply = send(
        &ctx,
        "POST",
        "/models/create",
        Some(ADMIN),
        Some(json!({
            "id": "friendly",
            "base_model_id": "echo_pipe",
            "name": "Friendly",
            "params": {"system": "Greet {{USER_NAME}}", "temperature": 0.3}
        })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.json()["base_model_id"], "echo_pipe");

    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("friendly", false))).await;
    let body = reply.json();
    assert_eq!(body["model"], "echo_pipe");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
}

#[tokio::test]
async fn event_emitter_is_bound_when_metadata_names_the_turn() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    let mut events = ctx.state.events.subscribe();

    let mut body = chat_body("echo_pipe", false);
    body["metadata"] = json!({"session_id": "s1", "chat_id": "c1", "message_id": "m1"});
    let reply = send(&ctx, "POST", "/chat/completions", Some(USER), Some(body)).await;
    assert_eq!(reply.json()["choices"][0]["message"]["content"], "hello");

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.target.chat_id, "c1");
    assert_eq!(event.data["type"], "status");
}

#[tokio::test]
async fn latency_routes_are_admin_only() {
    let ctx = setup().await;
    let form = json!({
        "chat_id": "c1",
        "message_id": "m1",
        "question_time": 1.0,
        "response_start_time": 1.2,
        "response_end_time": 2.5,
        "llm_id": "echo_pipe"
    });
    let reply = send(&ctx, "POST", "/performance/latency", None, Some(form.clone())).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let reply = send(&ctx, "POST", "/performance/latency", Some(USER), Some(form)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    let reply = send(&ctx, "GET", "/performance/latency", Some(USER), None).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    let reply = send(&ctx, "DELETE", "/performance/latency", Some(USER), None).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn latency_metrics_are_recorded_once_and_filtered() {
    let ctx = setup().await;
    let form = |message_id: &str, chat_id: &str, llm_id: &str| {
        json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "question_time": 1.0,
            "response_start_time": 1.2,
            "response_end_time": 2.5,
            "total_tokens": 12,
            "llm_id": llm_id
        })
    };

    let reply = send(&ctx, "POST", "/performance/latency", Some(ADMIN), Some(form("m1", "c1", "a"))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({"status": "success"}));

    let reply = send(&ctx, "POST", "/performance/latency", Some(ADMIN), Some(form("m1", "c9", "z"))).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reply.json()["detail"].is_string());

    send(&ctx, "POST", "/performance/latency", Some(ADMIN), Some(form("m2", "c1", "b"))).await;
    send(&ctx, "POST", "/performance/latency", Some(ADMIN), Some(form("m3", "c2", "a"))).await;

    let reply = send(&ctx, "GET", "/performance/latency", Some(ADMIN), None).await;
    let metrics = reply.json()["metrics"].as_array().unwrap().clone();
    let ids: Vec<_> = metrics.iter().map(|m| m["id"].as_str().unwrap().to_string()).collect();
    assert_eq!(ids, vec!["m3", "m2", "m1"]);
    assert_eq!(metrics[2]["chat_id"], "c1");

    let reply = send(&ctx, "GET", "/performance/latency?chat_id=c1", Some(ADMIN), None).await;
    let ids: Vec<_> = reply.json()["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["m2", "m1"]);

    let reply = send(&ctx, "GET", "/performance/latency?llm_id=a", Some(ADMIN), None).await;
    assert_eq!(reply.json()["metrics"].as_array().unwrap().len(), 2);

    let reply = send(&ctx, "DELETE", "/performance/latency", Some(ADMIN), None).await;
    assert_eq!(reply.json(), json!({"deleted": true}));
    let reply = send(&ctx, "DELETE", "/performance/latency", Some(ADMIN), None).await;
    assert_eq!(reply.json(), json!({"deleted": false}));
}

#[tokio::test]
async fn routes_are_also_served_under_api_prefix() {
    let ctx = setup().await;
    let reply = send(&ctx, "GET", "/api/models", Some(USER), None).await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let ctx = setup().await;
    create_function(&ctx, "echo_pipe", "Echo", "echo").await;
    send(&ctx, "POST", "/chat/completions", Some(USER), Some(chat_body("echo_pipe", false))).await;
    let reply = send(&ctx, "GET", "/metrics", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
}
