use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};

use crate::engine::{
    error::EngineError,
    models::{ExecutionRequest, ExecutionResponse, PoolSnapshot},
    orchestrator::Orchestrator,
};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    max_code_bytes: usize,
    max_input_bytes: usize,
}

pub fn routes(orchestrator: Arc<Orchestrator>, max_code_bytes: usize, max_input_bytes: usize) -> Router {
    let state = AppState {
        orchestrator,
        max_code_bytes,
        max_input_bytes,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/languages", get(languages))
        .route("/v1/pools", get(pools))
        .route("/v1/execute", post(execute))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.pool().snapshot();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.orchestrator.metrics().render_prometheus(&snapshot),
    )
}

async fn languages(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    let mut tags: Vec<&'static str> = state
        .orchestrator
        .registry()
        .profiles()
        .map(|profile| profile.language.as_str())
        .collect();
    tags.sort_unstable();
    Json(tags)
}

async fn pools(State(state): State<AppState>) -> Json<Vec<PoolSnapshot>> {
    Json(state.orchestrator.pool().snapshot())
}

async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Json<ExecutionResponse>, EngineError> {
    let Json(request) = payload.map_err(|rejection| {
        state.orchestrator.metrics().rejected();
        EngineError::InvalidRequest(rejection.body_text())
    })?;
    if let Err(err) = validate_request(&state, &request) {
        state.orchestrator.metrics().rejected();
        return Err(err);
    }

    // Runs on its own task so a dropped connection cannot interrupt cleanup.
    let orchestrator = state.orchestrator.clone();
    let execution = tokio::spawn(async move {
        orchestrator
            .execute(&request.language, &request.code, &request.input)
            .await
    });
    match execution.await {
        Ok(result) => result.map(Json),
        Err(err) => {
            tracing::error!(error = %err, "execution task failed");
            Err(EngineError::Internal("execution task failed".to_string()))
        }
    }
}

fn validate_request(state: &AppState, request: &ExecutionRequest) -> Result<(), EngineError> {
    if request.language.trim().is_empty() {
        return Err(EngineError::InvalidRequest("language is empty".to_string()));
    }
    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > state.max_code_bytes {
        return Err(EngineError::InvalidRequest(format!(
            "code exceeds {} bytes",
            state.max_code_bytes
        )));
    }
    if request.input.len() > state.max_input_bytes {
        return Err(EngineError::InvalidRequest(format!(
            "input exceeds {} bytes",
            state.max_input_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::routes;
    use crate::engine::{
        config::{EngineConfig, PoolConfig},
        language::LanguageRegistry,
        metrics::MetricsRegistry,
        orchestrator::Orchestrator,
        pool::ContainerPool,
        sandbox::mock::{MockReply, MockRuntime, mentions},
    };

    async fn app(runtime: Arc<MockRuntime>) -> Router {
        let mut config = EngineConfig::from_env();
        config.run_timeout = Duration::from_millis(100);
        config.pool = PoolConfig {
            maintenance_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        };
        let registry = Arc::new(LanguageRegistry::new(&config.pool));
        let metrics = Arc::new(MetricsRegistry::new());
        let pool = Arc::new(
            ContainerPool::initialize(runtime.clone(), &registry, config.pool.clone(), metrics.clone())
                .await,
        );
        let orchestrator = Arc::new(Orchestrator::new(registry, pool, runtime, metrics, &config));
        routes(orchestrator, 64, 32)
    }

    fn scripted() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::scripted(|command, stdin| {
            if mentions(command, "python3") {
                MockReply::ok(&format!("{}\n", stdin.unwrap_or_default()))
            } else if mentions(command, "gcc") {
                MockReply::exit(1, "error: expected ';'")
            } else if mentions(command, "ruby") {
                MockReply::Hang
            } else {
                MockReply::ok("")
            }
        }))
    }

    async fn post(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post("/v1/execute")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn execute_returns_output() {
        let app = app(scripted()).await;
        let (status, body) = post(
            app,
            json!({ "language": "python", "code": "print(input())", "input": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "output": "hello" }));
    }

    #[tokio::test]
    async fn input_defaults_to_empty() {
        let app = app(scripted()).await;
        let (status, body) = post(app, json!({ "language": "py", "code": "print(input())" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "");
    }

    #[tokio::test]
    async fn failures_map_to_statuses() {
        let runtime = scripted();
        let app = app(runtime.clone()).await;

        let (status, body) = post(app.clone(), json!({ "language": "ruby2", "code": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported language: ruby2");

        let (status, body) = post(app.clone(), json!({ "language": "c", "code": "int main() {" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("expected ';'"));

        let (status, body) = post(app, json!({ "language": "ruby", "code": "loop {}" })).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["error"], "execution timed out after 100ms");
        assert_eq!(runtime.killed().len(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_payloads() {
        let app = app(scripted()).await;

        let (status, body) = post(app.clone(), json!({ "language": "python", "code": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid request: code is empty");

        let (status, _) = post(app.clone(), json!({ "language": "python", "code": "x".repeat(65) })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(
            app.clone(),
            json!({ "language": "python", "code": "x", "input": "y".repeat(33) }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(app, json!({ "code": "print(1)" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid request"));
    }

    #[tokio::test]
    async fn lists_languages_and_pools() {
        let app = app(scripted()).await;

        let response = app
            .clone()
            .oneshot(Request::get("/v1/languages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let tags: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tags.len(), 10);
        assert!(tags.windows(2).all(|pair| pair[0] < pair[1]));

        let response = app
            .oneshot(Request::get("/v1/pools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let pools: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(pools.len(), 10);
        assert!(pools.iter().all(|pool| pool["busy"] == 0));
    }

    #[tokio::test]
    async fn metrics_count_outcomes() {
        let app = app(scripted()).await;
        post(app.clone(), json!({ "language": "python", "code": "print(1)" })).await;

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("sandbox_executions_total{language=\"python\",outcome=\"ok\"} 1"));
        assert!(text.contains("sandbox_containers_created_total 1"));
    }
}
