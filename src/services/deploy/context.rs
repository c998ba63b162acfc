//! 部署上下文
//!
//! 一次部署运行的执行上下文，包含 run_id、应用状态与取消令牌

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::deploy::{LogEvent, StageLabel};
use crate::state::AppState;

/// 部署执行上下文
#[derive(Clone)]
pub struct DeployContext {
    /// 运行 ID
    pub run_id: String,
    /// 应用状态
    pub state: Arc<AppState>,
    /// 取消令牌
    pub cancel_token: CancellationToken,
}

impl DeployContext {
    pub fn new(state: Arc<AppState>, run_id: impl Into<String>, cancel_token: CancellationToken) -> Self {
        Self {
            run_id: run_id.into(),
            state,
            cancel_token,
        }
    }

    /// 写入一行日志
    pub async fn log(&self, message: impl Into<String>) -> std::io::Result<()> {
        self.state
            .deploy_log
            .append(LogEvent::new(&self.run_id, None, message))
            .await
    }

    /// 写入阶段变化，同时更新运行登记
    pub async fn log_stage(&self, stage: StageLabel, message: impl Into<String>) -> std::io::Result<()> {
        self.state.runs.update_stage(&self.run_id, stage).await;
        self.state
            .deploy_log
            .append(LogEvent::new(&self.run_id, Some(stage), message))
            .await
    }

    /// 写入日志，失败时只记录 tracing 错误
    ///
    /// 用于重启等非关键路径
    pub async fn note(&self, message: impl Into<String>) {
        if let Err(e) = self.log(message).await {
            tracing::error!(run_id = %self.run_id, error = %e, "Failed to write deployment log");
        }
    }

    /// 写入警告
    pub async fn warn(&self, message: impl std::fmt::Display) {
        self.note(format!("WARNING: {}", message)).await;
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
