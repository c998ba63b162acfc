//! 部署服务模块
//!
//! 提交部署并在后台执行：构建 → 重启 → 清空待部署队列

pub mod compile;
pub mod context;
pub mod restart;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::DEPLOY_RESOURCE;
use crate::domain::deploy::{DeployError, RunOutcome, RunRecord, StageLabel};
use crate::services::classifier::markers;
use crate::state::AppState;

pub use context::DeployContext;
pub use restart::{build_restarter, RestartOutcome, Restarter};

/// 提交部署
///
/// 校验待部署数量并获取部署锁，然后在后台启动执行器，立即返回 run_id。
/// 执行器的任何错误都不会再传回调用方，只能通过日志或状态查询观察。
pub async fn submit(state: &Arc<AppState>) -> Result<String, DeployError> {
    let pending = state
        .queue
        .count()
        .await
        .map_err(|e| DeployError::Queue(e.to_string()))?;

    if pending == 0 {
        tracing::warn!("No pending changes to apply");
        return Err(DeployError::NoPendingChanges);
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let cancel_token = state
        .runs
        .try_acquire(DEPLOY_RESOURCE, RunRecord::new(&run_id, pending))
        .await
        .map_err(DeployError::AlreadyRunning)?;

    tracing::info!(run_id = %run_id, pending, "Deployment submitted");

    // 在后台执行部署（非阻塞）
    let state_clone = state.clone();
    let run_id_clone = run_id.clone();
    tokio::spawn(async move {
        execute(state_clone, run_id_clone, cancel_token).await;
    });

    Ok(run_id)
}

/// 取消活跃运行，并等待执行器写完结束记录、释放部署锁
///
/// 超过 `grace` 仍未结束时放弃等待。返回被取消的 run_id
pub async fn cancel_active(state: &AppState, grace: Duration) -> Option<String> {
    let run_id = state.runs.cancel(DEPLOY_RESOURCE).await?;

    let finished = async {
        while state.runs.active_run_id(DEPLOY_RESOURCE).await.as_deref() == Some(run_id.as_str()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(grace, finished).await.is_err() {
        tracing::warn!(
            run_id = %run_id,
            grace_secs = grace.as_secs(),
            "Deployment did not finish after cancellation"
        );
    }

    Some(run_id)
}

/// 执行部署
///
/// 部署流程在独立任务中运行，panic 也会被记录为 FATAL 并结束运行。
/// 结束时总是释放部署锁。
pub async fn execute(
    state: Arc<AppState>,
    run_id: String,
    cancel_token: CancellationToken,
) -> RunOutcome {
    let ctx = DeployContext::new(state.clone(), run_id.clone(), cancel_token);

    let pipeline = tokio::spawn({
        let ctx = ctx.clone();
        async move { run_pipeline(&ctx).await }
    });

    let outcome = match pipeline.await {
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(err)) => {
            report_failure(&ctx, &err).await;
            err.outcome()
        }
        Err(join_err) => {
            tracing::error!(run_id = %run_id, error = %join_err, "Deployment task panicked");
            log_failure(
                &ctx,
                format!("{}: deployment aborted: {}", markers::FATAL, join_err),
            )
            .await;
            RunOutcome::Aborted
        }
    };

    state.runs.finish(&run_id, outcome).await;
    state.runs.release(DEPLOY_RESOURCE, &run_id).await;

    tracing::info!(run_id = %run_id, outcome = outcome.as_str(), "Deployment finished");
    outcome
}

async fn run_pipeline(ctx: &DeployContext) -> Result<(), DeployError> {
    ctx.log_stage(StageLabel::Initializing, "DEPLOYMENT STARTED").await?;

    compile::run(ctx).await?;

    let restart_outcome = restart::run(ctx).await?;
    ctx.state
        .runs
        .set_restart(&ctx.run_id, restart_outcome.describe())
        .await;

    // 构建已成功，取消请求不再阻止清空队列
    if ctx.is_cancelled() {
        ctx.note("Cancellation requested after build; finishing deployment").await;
    }

    clear_queue(ctx).await?;

    ctx.log_stage(StageLabel::Completed, markers::COMPLETED).await?;
    Ok(())
}

/// 清空待部署队列
///
/// 只在构建成功后调用；失败只记录警告，不影响运行结果
async fn clear_queue(ctx: &DeployContext) -> Result<(), DeployError> {
    match ctx.state.queue.clear().await {
        Ok(()) => ctx.log("Pending queue cleared").await?,
        Err(e) => {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "Failed to clear pending queue");
            ctx.warn(format!("failed to clear pending queue: {}", e)).await;
        }
    }
    Ok(())
}

async fn report_failure(ctx: &DeployContext, err: &DeployError) {
    tracing::error!(run_id = %ctx.run_id, error = %err, "Deployment failed");

    let line = match err {
        DeployError::CompileFailed { .. }
        | DeployError::PhaseTimeout { .. }
        | DeployError::Cancelled(_) => format!("{}: {}", markers::ERROR, err),
        _ => format!("{}: deployment aborted: {}", markers::FATAL, err),
    };
    log_failure(ctx, line).await;
    ctx.note("DEPLOYMENT FAILED; pending changes remain queued").await;
}

async fn log_failure(ctx: &DeployContext, line: String) {
    if let Err(e) = ctx.log_stage(StageLabel::Failed, line).await {
        tracing::error!(run_id = %ctx.run_id, error = %e, "Failed to write deployment log");
    }
}
