//! 服务重启阶段
//!
//! 重启分两步：
//! 1. 无条件写入 reload sentinel 文件，运行中的进程在下一次请求时重载
//! 2. 按配置的策略执行额外的重启（服务管理器 / 固定命令 / 仅 sentinel）
//!
//! 重启结果从不导致部署失败：sentinel 已保证新构建最终生效。

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use crate::config::env::constants::INVENTORY_TIMEOUT_SECS;
use crate::config::{RestartConfig, RestartStrategy};
use crate::domain::deploy::{DeployError, StageLabel};
use crate::infra::{CommandError, CommandRunner};
use crate::services::classifier::markers;

use super::context::DeployContext;

/// 重启结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    /// 实例已重启
    Restarted { instance: String, verified: Option<bool> },
    /// 仅依赖 sentinel 文件
    SentinelOnly,
    /// 未能识别实例，需要人工介入
    ManualInterventionRequired { reason: String },
    /// 重启命令超时
    TimedOut { instance: String, secs: u64 },
    /// 重启命令失败
    Failed { instance: Option<String>, reason: String },
    /// 重启期间被取消
    Cancelled,
}

impl RestartOutcome {
    /// 写入运行记录的简短描述
    pub fn describe(&self) -> String {
        match self {
            RestartOutcome::Restarted { instance, verified: Some(false) } => {
                format!("restarted {} (not active afterwards)", instance)
            }
            RestartOutcome::Restarted { instance, .. } => format!("restarted {}", instance),
            RestartOutcome::SentinelOnly => "sentinel only".to_string(),
            RestartOutcome::ManualInterventionRequired { .. } => {
                "manual intervention required".to_string()
            }
            RestartOutcome::TimedOut { instance, secs } => {
                format!("restart of {} timed out after {}s", instance, secs)
            }
            RestartOutcome::Failed { instance, reason } => match instance {
                Some(instance) => format!("restart of {} failed: {}", instance, reason),
                None => format!("restart failed: {}", reason),
            },
            RestartOutcome::Cancelled => "restart cancelled".to_string(),
        }
    }
}

/// 可插拔的重启机制，每种部署拓扑一个实现
#[async_trait]
pub trait Restarter: Send + Sync {
    fn strategy(&self) -> RestartStrategy;

    async fn restart(&self, ctx: &DeployContext) -> RestartOutcome;
}

/// 根据配置选择重启机制
pub fn build_restarter(config: &RestartConfig) -> Arc<dyn Restarter> {
    match config.strategy {
        RestartStrategy::Sentinel => Arc::new(SentinelRestarter),
        RestartStrategy::Service => Arc::new(ServiceRestarter::new(config.clone())),
        RestartStrategy::Command => Arc::new(CommandRestarter::new(config.clone())),
    }
}

/// 执行重启阶段
///
/// 只有写日志失败会返回错误
pub async fn run(ctx: &DeployContext) -> Result<RestartOutcome, DeployError> {
    let restarter = ctx.state.restarter.clone();

    ctx.log_stage(
        StageLabel::Restarting,
        format!("{} (strategy: {})", markers::RESTARTING, restarter.strategy().name()),
    )
    .await?;

    let sentinel_path = &ctx.state.config.restart.sentinel_path;
    match write_sentinel(sentinel_path).await {
        Ok(()) => {
            ctx.log(format!("Reload sentinel written: {}", sentinel_path.display()))
                .await?
        }
        Err(e) => {
            ctx.warn(format!(
                "failed to write reload sentinel {}: {}",
                sentinel_path.display(),
                e
            ))
            .await
        }
    }

    let outcome = restarter.restart(ctx).await;

    match &outcome {
        RestartOutcome::Restarted { instance, verified } => {
            ctx.log(format!("Service instance {} restarted", instance)).await?;
            if *verified == Some(false) {
                ctx.warn(format!(
                    "{} is not active after restart; the sentinel will reload it on the next request",
                    instance
                ))
                .await;
            }
        }
        RestartOutcome::SentinelOnly => {
            ctx.log("Relying on reload sentinel; the service reloads on its next request")
                .await?;
        }
        RestartOutcome::ManualInterventionRequired { reason } => {
            ctx.warn(format!(
                "{}; manual restart may be required (sentinel written)",
                reason
            ))
            .await;
        }
        RestartOutcome::TimedOut { instance, secs } => {
            ctx.warn(format!(
                "restart of {} TIMED OUT after {}s; continuing",
                instance, secs
            ))
            .await;
        }
        RestartOutcome::Failed { reason, .. } => {
            ctx.warn(format!("restart failed: {}; continuing", reason)).await;
        }
        RestartOutcome::Cancelled => {
            ctx.warn("restart interrupted by cancellation; sentinel remains in place")
                .await;
        }
    }

    tracing::info!(run_id = %ctx.run_id, outcome = %outcome.describe(), "Restart phase finished");
    Ok(outcome)
}

/// 写入 sentinel 文件（内容为时间戳，修改时间随之更新）
pub async fn write_sentinel(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, format!("{}\n", Utc::now().to_rfc3339())).await
}

/// 只依赖 sentinel 的重启
pub struct SentinelRestarter;

#[async_trait]
impl Restarter for SentinelRestarter {
    fn strategy(&self) -> RestartStrategy {
        RestartStrategy::Sentinel
    }

    async fn restart(&self, _ctx: &DeployContext) -> RestartOutcome {
        RestartOutcome::SentinelOnly
    }
}

/// 通过服务管理器识别并重启实例
pub struct ServiceRestarter {
    config: RestartConfig,
}

impl ServiceRestarter {
    pub fn new(config: RestartConfig) -> Self {
        Self { config }
    }

    /// 识别运行中的实例
    ///
    /// 先在实例清单中匹配本机标识，再逐个探测候选名称
    async fn identify(&self, ctx: &DeployContext) -> Option<String> {
        let work_dir = &ctx.state.config.app_dir;
        let inventory = match CommandRunner::run_shell_simple(
            &self.config.inventory_command,
            work_dir,
            Duration::from_secs(INVENTORY_TIMEOUT_SECS),
        )
        .await
        {
            Ok(output) if output.success() => output.stdout,
            Ok(output) => {
                ctx.warn(format!(
                    "instance inventory exited with code {}",
                    output.exit_code()
                ))
                .await;
                String::new()
            }
            Err(e) => {
                ctx.warn(format!("instance inventory unavailable: {}", e)).await;
                String::new()
            }
        };

        if let Some(instance) = match_identity(&inventory, &self.config.identity) {
            ctx.note(format!(
                "Identified instance {} by local identity {}",
                instance, self.config.identity
            ))
            .await;
            return Some(instance);
        }

        if let Some(instance) = match_candidate(&inventory, &self.config.candidates) {
            ctx.note(format!("Identified instance {} from inventory", instance))
                .await;
            return Some(instance);
        }

        let probe = self.config.probe_command.as_deref()?;
        for candidate in self.config.candidates.iter().filter(|c| is_safe_instance_name(c)) {
            let command = substitute_instance(probe, candidate);
            let probed = CommandRunner::run_shell_simple(
                &command,
                work_dir,
                Duration::from_secs(INVENTORY_TIMEOUT_SECS),
            )
            .await;
            if probed.is_ok_and(|o| o.success()) {
                ctx.note(format!("Identified instance {} by probe", candidate))
                    .await;
                return Some(candidate.clone());
            }
        }

        None
    }

    async fn verify(&self, ctx: &DeployContext, instance: &str) -> Option<bool> {
        let probe = self.config.probe_command.as_deref()?;
        let output = CommandRunner::run_shell_simple(
            &substitute_instance(probe, instance),
            &ctx.state.config.app_dir,
            Duration::from_secs(INVENTORY_TIMEOUT_SECS),
        )
        .await;
        Some(output.is_ok_and(|o| o.success()))
    }
}

#[async_trait]
impl Restarter for ServiceRestarter {
    fn strategy(&self) -> RestartStrategy {
        RestartStrategy::Service
    }

    async fn restart(&self, ctx: &DeployContext) -> RestartOutcome {
        let Some(instance) = self.identify(ctx).await else {
            return RestartOutcome::ManualInterventionRequired {
                reason: "no running instance identified".to_string(),
            };
        };

        let command = substitute_instance(&self.config.restart_command, &instance);
        ctx.note(format!("Restarting instance {}: {}", instance, command))
            .await;

        if let Err(outcome) = run_restart_command(ctx, &command, &self.config, &instance).await {
            return outcome;
        }

        // 等待服务稳定
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => return RestartOutcome::Cancelled,
            _ = tokio::time::sleep(self.config.stabilize_delay) => {}
        }

        let verified = self.verify(ctx, &instance).await;
        RestartOutcome::Restarted { instance, verified }
    }
}

/// 执行固定的重启命令（如编排系统 API 调用）
pub struct CommandRestarter {
    config: RestartConfig,
}

impl CommandRestarter {
    pub fn new(config: RestartConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Restarter for CommandRestarter {
    fn strategy(&self) -> RestartStrategy {
        RestartStrategy::Command
    }

    async fn restart(&self, ctx: &DeployContext) -> RestartOutcome {
        let instance = self.config.identity.clone();
        let command = if is_safe_instance_name(&instance) {
            substitute_instance(&self.config.restart_command, &instance)
        } else {
            self.config.restart_command.clone()
        };
        ctx.note(format!("Running restart command: {}", command)).await;

        match run_restart_command(ctx, &command, &self.config, &instance).await {
            Ok(()) => RestartOutcome::Restarted {
                instance,
                verified: None,
            },
            Err(outcome) => outcome,
        }
    }
}

/// 运行重启命令，失败时返回对应的重启结果
async fn run_restart_command(
    ctx: &DeployContext,
    command: &str,
    config: &RestartConfig,
    instance: &str,
) -> Result<(), RestartOutcome> {
    let result = CommandRunner::run_shell(
        command,
        &ctx.state.config.app_dir,
        &ctx.cancel_token,
        config.timeout,
    )
    .await;

    match result {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(RestartOutcome::Failed {
            instance: Some(instance.to_string()),
            reason: format!(
                "exit code {}: {}",
                output.exit_code(),
                output.tail(3).join(" / ")
            ),
        }),
        Err(CommandError::Timeout(limit)) => Err(RestartOutcome::TimedOut {
            instance: instance.to_string(),
            secs: limit.as_secs(),
        }),
        Err(CommandError::Cancelled) => Err(RestartOutcome::Cancelled),
        Err(e) => Err(RestartOutcome::Failed {
            instance: Some(instance.to_string()),
            reason: e.to_string(),
        }),
    }
}

/// 在实例清单中匹配本机标识
///
/// 清单每行第一列为实例名称。任一列与标识相等（如容器短 ID 与主机名），
/// 或实例名称以标识开头（如主机名 `zammad` 与 `zammad.service`）即视为匹配。
/// 标识至少 4 个字符。
pub fn match_identity(inventory: &str, identity: &str) -> Option<String> {
    let identity = identity.trim();
    if identity.len() < 4 {
        return None;
    }

    inventory.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let name = *tokens.first()?;
        let matched = name.starts_with(identity) || tokens.iter().any(|t| *t == identity);
        (matched && is_safe_instance_name(name)).then(|| name.to_string())
    })
}

/// 在实例清单中查找第一个出现的候选名称
pub fn match_candidate(inventory: &str, candidates: &[String]) -> Option<String> {
    let names: Vec<&str> = inventory
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .collect();

    candidates
        .iter()
        .find(|c| is_safe_instance_name(c) && names.contains(&c.as_str()))
        .cloned()
}

/// 实例名称只允许出现在 shell 命令中安全的字符
fn is_safe_instance_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | ':'))
}

fn substitute_instance(template: &str, instance: &str) -> String {
    template.replace("{instance}", instance)
}
