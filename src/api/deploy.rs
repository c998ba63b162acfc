//! 部署管理 API
//!
//! 包含 /deploy/submit, /deploy/status, /deploy/pending*, /deploy/runs, /deploy/cancel,
//! /deploy/logs/stream 端点

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::env::constants::{DEPLOY_RESOURCE, MAX_RUN_HISTORY};
use crate::domain::deploy::{DeployError, PendingCount, RunRecord, SubmitResponse};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::{self, classifier};
use crate::state::AppState;

/// 状态查询参数
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// 指定运行 ID 时精确查询
    pub run_id: Option<String>,
}

/// 运行历史查询参数
#[derive(Debug, Deserialize)]
pub struct RunHistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// 运行历史响应
#[derive(Debug, Serialize)]
pub struct RunHistoryResponse {
    /// 当前持有部署锁的运行
    pub active_run: Option<String>,
    pub runs: Vec<RunRecord>,
    pub total: usize,
}

/// 待部署变更列表
#[derive(Debug, Serialize)]
pub struct PendingListResponse {
    pub count: u64,
    pub pending: Vec<serde_json::Value>,
}

/// 取消响应
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub run_id: String,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy/submit", post(submit_deployment))
        .route("/deploy/status", get(deployment_status))
        .route("/deploy/pending/count", get(pending_count))
        .route("/deploy/pending", get(list_pending))
        .route("/deploy/runs", get(recent_runs))
        .route("/deploy/cancel", post(cancel_deployment))
        .route("/deploy/logs/stream", get(stream_logs))
}

/// 提交部署
///
/// POST /deploy/submit
/// 需要 API Key
///
/// 只做校验与加锁，构建和重启在后台执行
async fn submit_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> Response {
    match services::deploy::submit(&state).await {
        Ok(run_id) => (StatusCode::OK, Json(SubmitResponse::initiated(run_id))).into_response(),
        Err(DeployError::NoPendingChanges) => (
            StatusCode::BAD_REQUEST,
            Json(SubmitResponse::rejected(
                "validation",
                "no pending changes",
                None,
            )),
        )
            .into_response(),
        Err(DeployError::AlreadyRunning(active)) => {
            warn!(active_run = %active, "Deployment already in progress");
            (
                StatusCode::CONFLICT,
                Json(SubmitResponse::rejected(
                    "locked",
                    "deployment already in progress",
                    Some(active),
                )),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to submit deployment");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SubmitResponse::rejected("error", e.to_string(), None)),
            )
                .into_response()
        }
    }
}

/// 部署状态
///
/// GET /deploy/status?run_id=
/// 无需认证
async fn deployment_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = classifier::current_status(&state.deploy_log, query.run_id.as_deref()).await?;
    Ok(Json(status))
}

/// 待部署数量
///
/// GET /deploy/pending/count
/// 无需认证
///
/// 读取失败返回 500，不能用 0 代替（客户端会误判为完成）
async fn pending_count(State(state): State<Arc<AppState>>) -> ApiResult<Json<PendingCount>> {
    let count = state.queue.count().await?;
    Ok(Json(PendingCount { count }))
}

/// 待部署变更列表
///
/// GET /deploy/pending
/// 无需认证
async fn list_pending(State(state): State<Arc<AppState>>) -> ApiResult<Json<PendingListResponse>> {
    let pending = state.queue.entries().await?;
    Ok(Json(PendingListResponse {
        count: pending.len() as u64,
        pending,
    }))
}

/// 最近的运行记录
///
/// GET /deploy/runs?limit=
/// 无需认证
async fn recent_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunHistoryQuery>,
) -> ApiResult<Json<RunHistoryResponse>> {
    if query.limit == 0 || query.limit > MAX_RUN_HISTORY {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_RUN_HISTORY
        )));
    }

    let runs = state.runs.recent(query.limit).await;
    Ok(Json(RunHistoryResponse {
        active_run: state.runs.active_run_id(DEPLOY_RESOURCE).await,
        total: runs.len(),
        runs,
    }))
}

/// 取消当前部署
///
/// POST /deploy/cancel
/// 需要 API Key
async fn cancel_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CancelResponse>> {
    let run_id = state
        .runs
        .cancel(DEPLOY_RESOURCE)
        .await
        .ok_or_else(|| ApiError::not_found("Active deployment"))?;

    tracing::info!(run_id = %run_id, "Deployment cancellation requested");
    Ok(Json(CancelResponse {
        cancelled: true,
        run_id,
    }))
}

/// 流式日志
///
/// GET /deploy/logs/stream
/// 无需认证
///
/// 推送订阅之后写入的事件，不回放历史
async fn stream_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.deploy_log.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("log").data(json));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "Log subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::domain::deploy::{DeploymentStatus, StageLabel};
    use crate::middleware::API_KEY_HEADER;
    use crate::state::MemoryPendingQueue;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path, pending: usize, build_command: &str) -> Arc<AppState> {
        let mut config = EnvConfig::for_tests(dir);
        config.build_command = build_command.to_string();
        Arc::new(AppState::with_queue(
            config,
            Arc::new(MemoryPendingQueue::with_count(pending)),
        ))
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = crate::api::router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_requires_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 1, "true");

        let (status, _) = send(&state, post("/deploy/submit", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&state, post("/deploy/submit", Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.runs.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_with_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 0, "true");

        let (status, body) = send(&state, post("/deploy/submit", Some("test-key"))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["started"], false);
        assert_eq!(body["error"], "no pending changes");
        assert_eq!(body["stage"], "validation");
        assert!(state.deploy_log.tail(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_then_conflict_then_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 2, "sleep 5");

        let (status, body) = send(&state, post("/deploy/submit", Some("test-key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["started"], true);
        assert_eq!(body["stage"], "initiated");
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let (status, body) = send(&state, post("/deploy/submit", Some("test-key"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["stage"], "locked");
        assert_eq!(body["run_id"], run_id.as_str());

        let (status, body) = send(&state, post("/deploy/cancel", Some("test-key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);
        assert_eq!(body["run_id"], run_id.as_str());
    }

    #[tokio::test]
    async fn test_cancel_without_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 0, "true");

        let (status, _) = send(&state, post("/deploy/cancel", Some("test-key"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pending_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 3, "true");

        let (status, body) = send(&state, get("/deploy/pending/count")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (status, body) = send(&state, get("/deploy/pending")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);
        assert_eq!(body["pending"].as_array().map(|a| a.len()), Some(3));
    }

    #[tokio::test]
    async fn test_pending_count_read_error_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EnvConfig::for_tests(dir.path());
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(&config.pending_queue_path, "{ not json").unwrap();
        config.build_command = "true".to_string();
        let state = Arc::new(AppState::from_config(config));

        let (status, _) = send(&state, get("/deploy/pending/count")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_status_before_any_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 0, "true");

        let (status, body) = send(&state, get("/deploy/status")).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: DeploymentStatus = serde_json::from_value(body).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.stage, StageLabel::Initializing);
        assert_eq!(parsed.message, "No deployments yet");
    }

    #[tokio::test]
    async fn test_status_and_runs_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 1, "true");

        let run_id = services::deploy::submit(&state).await.unwrap();
        for _ in 0..100 {
            if state.runs.active_run_id(DEPLOY_RESOURCE).await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let (_, body) = send(&state, get(&format!("/deploy/status?run_id={}", run_id))).await;
        assert_eq!(body["stage"], "completed");
        assert_eq!(body["success"], true);
        assert_eq!(body["run_id"], run_id.as_str());

        let (_, body) = send(&state, get("/deploy/status")).await;
        assert_eq!(body["stage"], "completed");

        let (status, body) = send(&state, get("/deploy/runs?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["runs"][0]["run_id"], run_id.as_str());
        assert_eq!(body["runs"][0]["outcome"], "completed");
        assert!(body["active_run"].is_null());

        let (status, _) = send(&state, get("/deploy/runs?limit=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
