//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::env::EnvConfig;
use crate::services::deploy::{build_restarter, Restarter};

use super::deploy_log::DeploymentLog;
use super::pending_queue::{FilePendingQueue, PendingQueue};
use super::run_registry::RunRegistry;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署 ==========
    /// 待部署变更队列
    pub queue: Arc<dyn PendingQueue>,
    /// 部署日志
    pub deploy_log: DeploymentLog,
    /// 运行登记与部署锁
    pub runs: RunRegistry,
    /// 重启机制
    pub restarter: Arc<dyn Restarter>,
}

impl AppState {
    /// 使用文件队列创建
    pub fn from_config(config: EnvConfig) -> Self {
        let queue = Arc::new(FilePendingQueue::new(config.pending_queue_path.clone()));
        Self::with_queue(config, queue)
    }

    /// 使用指定的队列实现创建
    pub fn with_queue(config: EnvConfig, queue: Arc<dyn PendingQueue>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),
            queue,
            deploy_log: DeploymentLog::new(config.deploy_log_path.clone()),
            runs: RunRegistry::new(),
            restarter: build_restarter(&config.restart),
            config,
        }
    }
}
