//! Coordinator HTTP surface: the runner websocket, the polling API and the
//! run-script entry point.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, Query, Request, State,
        ws::WebSocketUpgrade,
    },
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::registry::RunnerRegistry;
use super::script::{Script, ScriptRequest, render_reply};
use super::store::Store;
use super::tasks::TaskQueue;
use crate::bus::{Bus, ReplyCorrelator, new_inbox};
use crate::error::{RelayError, StoreError};
use crate::relay::envelope::APP_QUEUE;
use crate::relay::ws::serve_runner_socket;
use crate::relay::{QueueBridge, SessionInfo};
use crate::runner::model::{RunnerState, RunnerTask, TaskResult};

/// Shared state of every coordinator handler.
#[derive(Clone)]
pub struct CoordinatorState {
    pub bus: Arc<dyn Bus>,
    pub bridge: Arc<QueueBridge>,
    pub correlator: ReplyCorrelator,
    pub tasks: Arc<TaskQueue>,
    pub registry: Arc<RunnerRegistry>,
    pub store: Arc<dyn Store>,
    /// Token runners must present; `None` accepts any runner.
    pub runner_token: Option<SecretString>,
    pub request_timeout: Duration,
}

/// Build the coordinator router.
pub fn coordinator_routes(state: CoordinatorState) -> Router {
    let runner_api = Router::new()
        .route("/ws/runner", get(runner_socket))
        .route("/api/v1/runner/{id}/next-task", get(next_task))
        .route("/api/v1/runner/{id}/state", post(update_state))
        .route("/api/v1/runner/{id}/result", post(submit_result))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_runner_token,
        ));

    let apps = Router::new()
        .route("/api/v1/apps/{id}/gptscript", post(run_script))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runners", get(list_runners))
        .route("/api/v1/tasks", post(enqueue_task))
        .merge(runner_api)
        .merge(apps)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<CoordinatorState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "runner-relay-coordinator",
        "sessions": state.bridge.session_count(),
    }))
}

// ── Runner auth ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

async fn require_runner_token(
    State(state): State<CoordinatorState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.runner_token.as_ref() else {
        return next.run(request).await;
    };

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned);
    let presented = bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.access_token)
    });

    match presented {
        Some(token) if token == expected.expose_secret() => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "Rejected runner request without a valid token");
            error_response(StatusCode::UNAUTHORIZED, "invalid runner token")
        }
    }
}

// ── Runner websocket ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RunnerSocketQuery {
    runnerid: Option<String>,
}

async fn runner_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<RunnerSocketQuery>,
    State(state): State<CoordinatorState>,
) -> Response {
    let Some(runner_id) = query.runnerid.filter(|id| !id.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "runnerid is required");
    };
    info!(runner_id = %runner_id, "Runner websocket connecting");
    ws.on_upgrade(move |socket| serve_runner_socket(socket, runner_id, state.bridge))
}

// ── Polling API ─────────────────────────────────────────────────────────

async fn next_task(State(state): State<CoordinatorState>, Path(runner_id): Path<String>) -> Response {
    let snapshot = state.registry.get(&runner_id).await;
    match state.tasks.next_for(&runner_id, snapshot.as_ref()).await {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn update_state(
    State(state): State<CoordinatorState>,
    Path(runner_id): Path<String>,
    Json(mut snapshot): Json<RunnerState>,
) -> impl IntoResponse {
    snapshot.runner_id = runner_id;
    state.registry.update(snapshot).await;
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_result(
    State(state): State<CoordinatorState>,
    Path(runner_id): Path<String>,
    Json(result): Json<TaskResult>,
) -> Response {
    if result.reply.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "result has no reply subject");
    }
    let body = match serde_json::to_vec(&result) {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.bus.publish(&result.reply, Bytes::from(body)) {
        Ok(()) => {
            info!(
                runner_id = %runner_id,
                task_id = %result.task_id,
                success = result.is_success(),
                "Task result published"
            );
            Json(serde_json::json!({ "status": "published" })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Serialize)]
struct RunnerView {
    #[serde(flatten)]
    state: RunnerState,
    sessions: usize,
}

#[derive(Serialize)]
struct RunnersResponse {
    runners: Vec<RunnerView>,
    sessions: Vec<SessionInfo>,
}

async fn list_runners(State(state): State<CoordinatorState>) -> impl IntoResponse {
    let runners = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|snapshot| RunnerView {
            sessions: state.bridge.runner_session_count(&snapshot.runner_id),
            state: snapshot,
        })
        .collect();
    Json(RunnersResponse {
        runners,
        sessions: state.bridge.sessions(),
    })
}

async fn enqueue_task(
    State(state): State<CoordinatorState>,
    Json(mut task): Json<RunnerTask>,
) -> impl IntoResponse {
    if task.reply.trim().is_empty() {
        task.reply = new_inbox();
    }
    let accepted = serde_json::json!({ "id": task.id, "reply": task.reply });
    state.tasks.push(task).await;
    (StatusCode::CREATED, Json(accepted))
}

// ── Run script ──────────────────────────────────────────────────────────

async fn run_script(
    State(state): State<CoordinatorState>,
    Path(app_id): Path<String>,
    Json(request): Json<ScriptRequest>,
) -> Response {
    let app = match state.store.get_app(&app_id).await {
        Ok(app) => app,
        Err(e @ StoreError::NotFound { .. }) => return error_response(StatusCode::NOT_FOUND, e),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let Some(script) = Script::for_app(&app, request) else {
        return error_response(StatusCode::BAD_REQUEST, "file_path is required");
    };
    let payload = match serde_json::to_vec(&script) {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    info!(app_id = %app.id, file_path = %script.file_path, "Running script");
    match state
        .correlator
        .request(APP_QUEUE, Bytes::from(payload), state.request_timeout)
        .await
    {
        Ok(reply) => Json(render_reply(&reply)).into_response(),
        Err(e @ RelayError::Timeout { .. }) => {
            warn!(app_id = %app.id, error = %e, "Script request timed out");
            error_response(StatusCode::GATEWAY_TIMEOUT, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{BusMessage, FnHandler, LocalBus};
    use crate::coordinator::store::{AppRecord, MemoryStore};
    use crate::error::BusError;
    use crate::relay::WorkKind;

    fn state(bus: LocalBus, token: Option<&str>, timeout: Duration) -> CoordinatorState {
        let bus: Arc<dyn Bus> = Arc::new(bus);
        CoordinatorState {
            bridge: QueueBridge::new(Arc::clone(&bus)),
            correlator: ReplyCorrelator::new(Arc::clone(&bus)),
            bus,
            tasks: Arc::new(TaskQueue::new()),
            registry: Arc::new(RunnerRegistry::new()),
            store: Arc::new(MemoryStore::new()),
            runner_token: token.map(|t| SecretString::from(t.to_string())),
            request_timeout: timeout,
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = coordinator_routes(state(LocalBus::new(), None, Duration::from_secs(1)));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn enqueued_task_is_handed_out_once() {
        let app = coordinator_routes(state(LocalBus::new(), None, Duration::from_secs(1)));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/tasks",
                serde_json::json!({ "kind": "tool", "payload": "cGluZw==" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let accepted = body_json(response).await;
        assert!(accepted["reply"].as_str().unwrap().starts_with("_INBOX."));

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/runner/r1/next-task").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task: RunnerTask = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(task.kind, WorkKind::Tool);
        assert_eq!(&task.payload[..], b"ping");
        assert_eq!(task.id.to_string(), accepted["id"].as_str().unwrap());

        let response = app
            .oneshot(Request::get("/api/v1/runner/r1/next-task").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn runner_api_requires_configured_token() {
        let app = coordinator_routes(state(LocalBus::new(), Some("s3cret"), Duration::from_secs(1)));

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/runner/r1/next-task").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/v1/runner/r1/next-task")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/v1/runner/r1/next-task?access_token=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Requester-facing routes are open.
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn state_reports_show_up_in_runner_list() {
        let app = coordinator_routes(state(LocalBus::new(), None, Duration::from_secs(1)));
        let snapshot = serde_json::json!({
            "runner_id": "ignored",
            "created": chrono::Utc::now(),
            "total_memory": 100,
            "free_memory": 60,
            "labels": { "gpu": "a100" },
            "model_instances": [],
        });
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/runner/r7/state", snapshot))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/v1/runners").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list["runners"][0]["runner_id"], "r7");
        assert_eq!(list["runners"][0]["free_memory"], 60);
        assert_eq!(list["runners"][0]["sessions"], 0);
    }

    #[tokio::test]
    async fn result_is_published_on_its_reply_subject() {
        let bus = LocalBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let _subscription = bus
            .subscribe(
                "_INBOX.r1",
                Arc::new(FnHandler(move |msg: BusMessage| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(msg.payload);
                        Ok::<(), BusError>(())
                    }
                })),
            )
            .unwrap();
        let app = coordinator_routes(state(bus, None, Duration::from_secs(1)));

        let task = RunnerTask::new(WorkKind::Script, "x").with_reply("_INBOX.r1");
        let result = TaskResult::failure(&task, "boom");
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/runner/r1/result",
                serde_json::to_value(&result).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let published = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let received: TaskResult = serde_json::from_slice(&published).unwrap();
        assert_eq!(received, result);
    }

    #[tokio::test]
    async fn run_script_round_trips_through_a_runner() {
        let bus = LocalBus::new();
        let responder = bus.clone();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Script>();
        let _runner = bus
            .queue_subscribe(
                APP_QUEUE,
                "runner",
                Arc::new(FnHandler(move |msg: BusMessage| {
                    let responder = responder.clone();
                    let seen_tx = seen_tx.clone();
                    async move {
                        if let Ok(script) = serde_json::from_slice::<Script>(&msg.payload) {
                            let _ = seen_tx.send(script);
                        }
                        let reply = msg.reply.unwrap_or_default();
                        responder.publish(&reply, Bytes::from_static(br#"{"output":"done"}"#))
                    }
                })),
            )
            .unwrap();

        let state = state(bus, None, Duration::from_secs(2));
        state
            .store
            .create_app(AppRecord::new("app1", "alice", "Demo").with_secret("API_KEY", "k"))
            .await
            .unwrap();
        let app = coordinator_routes(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/apps/app1/gptscript",
                serde_json::json!({ "file_path": "hello.gpt", "input": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["output"], "done");

        let script = seen_rx.recv().await.unwrap();
        assert_eq!(script.file_path, "hello.gpt");
        assert_eq!(script.env, vec!["API_KEY=k"]);
    }

    #[tokio::test]
    async fn run_script_errors() {
        let state = state(LocalBus::new(), None, Duration::from_millis(50));
        state
            .store
            .create_app(AppRecord::new("app1", "alice", "Demo"))
            .await
            .unwrap();
        let app = coordinator_routes(state);

        let missing = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/apps/nope/gptscript",
                serde_json::json!({ "file_path": "x.gpt" }),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let no_path = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/apps/app1/gptscript", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(no_path.status(), StatusCode::BAD_REQUEST);

        // Nobody serves the app queue.
        let timed_out = app
            .oneshot(json_request(
                "POST",
                "/api/v1/apps/app1/gptscript",
                serde_json::json!({ "file_path": "x.gpt" }),
            ))
            .await
            .unwrap();
        assert_eq!(timed_out.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn run_script_answers_cors_preflight() {
        let app = coordinator_routes(state(LocalBus::new(), None, Duration::from_secs(1)));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/v1/apps/app1/gptscript")
                    .header(header::ORIGIN, "https://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
