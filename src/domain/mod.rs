//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deploy;

pub use deploy::{
    short_run_id, DeployError, DeploymentStatus, LogEvent, PendingCount, Phase, RunOutcome,
    RunRecord, StageLabel, SubmitResponse,
};
