//! 部署客户端
//!
//! 提交部署并轮询完成情况，供 CLI `apply` / `status` 使用

pub mod api;
pub mod poller;
pub mod progress;

use thiserror::Error;

pub use api::DeployApiClient;
pub use poller::{CompletionPoller, CompletionSignal, PollOutcome, StatusSource};
pub use progress::{ProgressSink, ProgressUpdate, TerminalProgress};

/// 客户端错误
#[derive(Debug, Error)]
pub enum ClientError {
    /// 连接失败、超时或响应解析失败
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// 服务端拒绝提交（无待部署变更、已有部署在进行等）
    #[error("deployment not started ({stage}): {error}")]
    Rejected {
        status: u16,
        stage: String,
        error: String,
        run_id: Option<String>,
    },
}
