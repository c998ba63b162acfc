//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 部署阶段标签
///
/// 由日志推导而来，从不作为"当前状态"单独存储
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageLabel {
    Initializing,
    Compiling,
    Compiled,
    Restarting,
    Completed,
    Failed,
}

impl StageLabel {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            StageLabel::Initializing => "initializing",
            StageLabel::Compiling => "compiling",
            StageLabel::Compiled => "compiled",
            StageLabel::Restarting => "restarting",
            StageLabel::Completed => "completed",
            StageLabel::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageLabel::Completed | StageLabel::Failed)
    }
}

impl std::fmt::Display for StageLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署执行的受时限阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Restart,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Compile => write!(f, "asset compilation"),
            Phase::Restart => write!(f, "service restart"),
        }
    }
}

/// 一次部署的最终结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompileFailed,
    TimedOut,
    Cancelled,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompileFailed => "compile_failed",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Aborted => "aborted",
        }
    }

    /// 对应的阶段标签
    pub fn stage(&self) -> StageLabel {
        match self {
            RunOutcome::Completed => StageLabel::Completed,
            _ => StageLabel::Failed,
        }
    }
}

/// 部署运行记录
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub stage: StageLabel,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// 提交时的待部署数量
    pub pending_at_submit: u64,
    /// 重启阶段的结果描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
}

impl RunRecord {
    /// 创建新的运行记录
    pub fn new(run_id: impl Into<String>, pending_at_submit: u64) -> Self {
        Self {
            run_id: run_id.into(),
            stage: StageLabel::Initializing,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            pending_at_submit,
            restart: None,
        }
    }

    /// 设置运行完成
    pub fn complete(&mut self, outcome: RunOutcome) {
        self.stage = outcome.stage();
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }
}

/// 结构化日志事件
///
/// 每行附带 run_id，分类时按 run_id 精确查找
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: Option<StageLabel>,
    pub detail: String,
}

impl LogEvent {
    pub fn new(run_id: &str, stage: Option<StageLabel>, detail: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            stage,
            detail: detail.into(),
        }
    }

    /// 文本日志中的行格式
    pub fn to_text_line(&self) -> String {
        format!(
            "[{}] [run {}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            short_run_id(&self.run_id),
            self.detail
        )
    }
}

/// 取 run_id 的前 8 个字符
pub fn short_run_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

/// 部署状态（deployment-status 响应）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatus {
    pub success: bool,
    pub stage: StageLabel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// 提交部署的响应（成功与拒绝共用）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub started: bool,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitResponse {
    pub fn initiated(run_id: impl Into<String>) -> Self {
        Self {
            started: true,
            stage: "initiated".to_string(),
            run_id: Some(run_id.into()),
            error: None,
        }
    }

    pub fn rejected(stage: &str, error: impl Into<String>, run_id: Option<String>) -> Self {
        Self {
            started: false,
            stage: stage.to_string(),
            run_id,
            error: Some(error.into()),
        }
    }
}

/// 待部署数量（pending-count 响应）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCount {
    pub count: u64,
}

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no pending changes")]
    NoPendingChanges,

    #[error("deployment already in progress (run {0})")]
    AlreadyRunning(String),

    #[error("asset compilation failed (exit code {exit_code})")]
    CompileFailed { exit_code: i32 },

    #[error("{phase} TIMED OUT after {secs}s")]
    PhaseTimeout { phase: Phase, secs: u64 },

    #[error("deployment cancelled during {0}")]
    Cancelled(Phase),

    #[error("pending queue error: {0}")]
    Queue(String),

    #[error("deployment log error: {0}")]
    Log(#[from] std::io::Error),
}

impl DeployError {
    /// 映射为运行结果
    pub fn outcome(&self) -> RunOutcome {
        match self {
            DeployError::CompileFailed { .. } => RunOutcome::CompileFailed,
            DeployError::PhaseTimeout { .. } => RunOutcome::TimedOut,
            DeployError::Cancelled(_) => RunOutcome::Cancelled,
            _ => RunOutcome::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_label_serde() {
        let json = serde_json::to_string(&StageLabel::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
        let stage: StageLabel = serde_json::from_str("\"compiled\"").unwrap();
        assert_eq!(stage, StageLabel::Compiled);
    }

    #[test]
    fn test_stage_label_is_terminal() {
        assert!(!StageLabel::Compiling.is_terminal());
        assert!(StageLabel::Completed.is_terminal());
        assert!(StageLabel::Failed.is_terminal());
    }

    #[test]
    fn test_run_record_complete() {
        let mut record = RunRecord::new("run-1", 3);
        assert_eq!(record.stage, StageLabel::Initializing);

        record.complete(RunOutcome::TimedOut);
        assert_eq!(record.stage, StageLabel::Failed);
        assert_eq!(record.outcome, Some(RunOutcome::TimedOut));
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_log_event_text_line() {
        let event = LogEvent::new(
            "0123456789abcdef",
            Some(StageLabel::Compiling),
            "Compiling assets",
        );
        let line = event.to_text_line();
        assert!(line.contains("[run 01234567]"));
        assert!(line.ends_with("Compiling assets"));
    }

    #[test]
    fn test_deploy_error_messages() {
        let err = DeployError::PhaseTimeout {
            phase: Phase::Compile,
            secs: 180,
        };
        assert_eq!(err.to_string(), "asset compilation TIMED OUT after 180s");
        assert_eq!(err.outcome(), RunOutcome::TimedOut);
        assert_eq!(
            DeployError::CompileFailed { exit_code: 2 }.outcome(),
            RunOutcome::CompileFailed
        );
    }
}
