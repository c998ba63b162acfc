//! 运行时状态模块
//!
//! 管理应用状态、待部署队列、部署日志与运行登记

pub mod app_state;
pub mod deploy_log;
pub mod pending_queue;
pub mod run_registry;

pub use app_state::AppState;
pub use deploy_log::DeploymentLog;
pub use pending_queue::{FilePendingQueue, MemoryPendingQueue, PendingQueue, QueueError};
pub use run_registry::RunRegistry;
