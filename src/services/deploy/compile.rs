//! 资源构建阶段

use std::time::Instant;

use crate::config::env::constants::OUTPUT_TAIL_LINES;
use crate::domain::deploy::{DeployError, Phase, StageLabel};
use crate::infra::{CommandError, CommandRunner};
use crate::services::classifier::markers;

use super::context::DeployContext;

/// 在超时限制内运行构建命令
///
/// 失败、超时或取消都会返回错误，调用方不得继续重启与清空队列
pub async fn run(ctx: &DeployContext) -> Result<(), DeployError> {
    let config = &ctx.state.config;

    ctx.log_stage(
        StageLabel::Compiling,
        format!("{}: {}", markers::COMPILING, config.build_command),
    )
    .await?;

    let started = Instant::now();
    let result = CommandRunner::run_shell(
        &config.build_command,
        &config.app_dir,
        &ctx.cancel_token,
        config.compile_timeout,
    )
    .await;

    match result {
        Ok(output) if output.success() => {
            ctx.log_stage(
                StageLabel::Compiled,
                format!(
                    "{} in {:.1}s",
                    markers::COMPILED,
                    started.elapsed().as_secs_f64()
                ),
            )
            .await?;
            Ok(())
        }
        Ok(output) => {
            for line in output.tail(OUTPUT_TAIL_LINES) {
                ctx.log(format!("  | {}", line)).await?;
            }
            Err(DeployError::CompileFailed {
                exit_code: output.exit_code(),
            })
        }
        Err(CommandError::Timeout(limit)) => Err(DeployError::PhaseTimeout {
            phase: Phase::Compile,
            secs: limit.as_secs(),
        }),
        Err(CommandError::Cancelled) => Err(DeployError::Cancelled(Phase::Compile)),
        Err(e) => {
            // 无法启动构建（如工作目录不存在）按构建失败处理
            ctx.log(format!("  | {}", e)).await?;
            Err(DeployError::CompileFailed { exit_code: -1 })
        }
    }
}
