//! Template Deploy Agent - 模板资源部署代理
//!
//! 接收部署请求，在后台构建资源并重启服务，同时提供轮询完成情况的客户端

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;
pub mod client;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::{
    CompletionPoller, CompletionSignal, DeployApiClient, StatusSource, TerminalProgress,
};
use crate::config::env::constants::{SHUTDOWN_GRACE_SECS, VERSION};
use crate::config::PollerConfig;
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Default, Clone)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
}

/// `apply` 子命令参数
#[derive(Debug, Default, Clone)]
pub struct ApplyOptions {
    /// 覆盖 agent 地址
    pub server_url: Option<String>,
    /// 按 run_id 跟踪阶段，而不是观察待部署数量
    pub follow_run: bool,
}

/// 初始化日志
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("template_deploy_agent=info,tower_http=info")),
        )
        .init();
}

/// 启动 agent HTTP 服务，直到收到退出信号
pub async fn run_agent(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = config::EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }

    if config.api_key.is_empty() {
        warn!("DEPLOY_AGENT_API_KEY not set, deployment submission is disabled");
    }

    info!(
        version = VERSION,
        port = config.port,
        app_dir = %config.app_dir.display(),
        build_command = %config.build_command,
        compile_timeout_secs = config.compile_timeout.as_secs(),
        restart_strategy = config.restart.strategy.name(),
        deploy_log = %config.deploy_log_path.display(),
        pending_queue = %config.pending_queue_path.display(),
        "Starting template deploy agent"
    );

    let port = config.port;
    let state = Arc::new(AppState::from_config(config));
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!(port, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // 中止仍在运行的部署，等待其写完失败记录后再退出
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    if let Some(run_id) = services::deploy::cancel_active(&state, grace).await {
        warn!(run_id = %run_id, "Cancelled active deployment on shutdown");
    }

    info!("Agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// 提交部署并等待完成
///
/// 返回部署是否成功完成
pub async fn run_apply(options: ApplyOptions) -> anyhow::Result<bool> {
    let mut config = PollerConfig::from_env();
    if let Some(url) = options.server_url {
        config.server_url = url.trim_end_matches('/').to_string();
    }

    let client = DeployApiClient::from_config(&config)?;

    // 提交前的数量作为基线；读取失败不阻止提交
    let baseline = match client.pending_count().await {
        Ok(count) => {
            println!("Pending changes: {}", count);
            Some(count)
        }
        Err(e) => {
            warn!(error = %e, "Failed to read pending count before submit");
            None
        }
    };

    let submitted = client.submit().await?;
    let run_id = submitted.run_id.unwrap_or_default();
    println!("Deployment started (run {})", run_id);

    let signal = if options.follow_run && !run_id.is_empty() {
        CompletionSignal::RunStage { run_id }
    } else {
        CompletionSignal::QueueCount { baseline }
    };

    let poller = CompletionPoller::new(client, &config);
    let mut progress = TerminalProgress::stdout();
    let outcome = poller.run(&signal, &mut progress).await;

    println!("{}", outcome.user_message());
    Ok(outcome.is_success())
}

/// 打印当前部署状态
pub async fn run_status(server_url: Option<String>, run_id: Option<String>) -> anyhow::Result<()> {
    let mut config = PollerConfig::from_env();
    if let Some(url) = server_url {
        config.server_url = url.trim_end_matches('/').to_string();
    }

    let client = DeployApiClient::from_config(&config)?;
    let status = client.deployment_status(run_id.as_deref()).await?;
    let pending = client.pending_count().await?;

    println!("Stage:   {}", status.stage);
    println!("Success: {}", status.success);
    println!("Message: {}", status.message);
    if let Some(run_id) = status.run_id {
        println!("Run:     {}", run_id);
    }
    println!("Pending: {}", pending);
    Ok(())
}
