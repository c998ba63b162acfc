//! 部署阶段分类
//!
//! 两种方式推导当前阶段：
//! - 启发式：扫描文本日志尾部的标记字符串。行中不带 run_id 时，
//!   旧运行或并发运行的日志会影响结果。
//! - 精确：按 run_id 取该运行最后一个带阶段的事件。

use crate::config::env::constants::STATUS_TAIL_LINES;
use crate::domain::deploy::{DeploymentStatus, LogEvent, StageLabel};
use crate::state::DeploymentLog;

/// 执行器写入日志的标记文本
pub mod markers {
    pub const COMPLETED: &str = "DEPLOYMENT COMPLETED SUCCESSFULLY";
    pub const RESTARTING: &str = "Restarting service";
    pub const COMPILED: &str = "Assets compiled";
    pub const COMPILING: &str = "Compiling assets";
    pub const ERROR: &str = "ERROR";
    pub const FATAL: &str = "FATAL";
    pub const WARNING: &str = "WARNING";
}

/// 非终态标记，按优先级从高到低
const PROGRESS_MARKERS: [(&str, StageLabel); 3] = [
    (markers::RESTARTING, StageLabel::Restarting),
    (markers::COMPILED, StageLabel::Compiled),
    (markers::COMPILING, StageLabel::Compiling),
];

fn is_error_line(line: &str) -> bool {
    line.contains(markers::ERROR) || line.contains(markers::FATAL)
}

/// 从日志尾部启发式推导阶段
///
/// 完成标记 > restarting > compiled > compiling > initializing。
/// 错误行强制 `failed`，除非其后又出现了完成标记。
pub fn classify_tail(lines: &[String]) -> DeploymentStatus {
    let Some(last) = lines.last() else {
        return DeploymentStatus {
            success: true,
            stage: StageLabel::Initializing,
            message: "No deployments yet".to_string(),
            run_id: None,
        };
    };
    let message = last.trim().to_string();

    let last_completed = lines.iter().rposition(|l| l.contains(markers::COMPLETED));
    let last_error = lines.iter().rposition(|l| is_error_line(l));

    let failed = match (last_error, last_completed) {
        (Some(err), Some(done)) => err > done,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let stage = if failed {
        StageLabel::Failed
    } else if last_completed.is_some() {
        StageLabel::Completed
    } else {
        PROGRESS_MARKERS
            .iter()
            .find(|(marker, _)| lines.iter().any(|l| l.contains(marker)))
            .map(|(_, stage)| *stage)
            .unwrap_or(StageLabel::Initializing)
    };

    DeploymentStatus {
        success: !failed,
        stage,
        message,
        run_id: None,
    }
}

/// 从某次运行的事件精确推导阶段
pub fn classify_events(run_id: &str, events: &[LogEvent]) -> DeploymentStatus {
    let stage = events
        .iter()
        .rev()
        .find_map(|e| e.stage)
        .unwrap_or(StageLabel::Initializing);
    let message = events
        .last()
        .map(|e| e.detail.clone())
        .unwrap_or_else(|| "Waiting to start deployment...".to_string());

    DeploymentStatus {
        success: stage != StageLabel::Failed,
        stage,
        message,
        run_id: Some(run_id.to_string()),
    }
}

/// 读取日志并分类
///
/// 指定 run_id 时精确查询，否则扫描文本日志最后 50 行
pub async fn current_status(
    log: &DeploymentLog,
    run_id: Option<&str>,
) -> std::io::Result<DeploymentStatus> {
    match run_id {
        Some(run_id) => {
            let events = log.events_for(run_id).await?;
            Ok(classify_events(run_id, &events))
        }
        None => {
            let lines = log.tail(STATUS_TAIL_LINES).await?;
            Ok(classify_tail(&lines))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| format!("[2026-01-01 00:00:00] [run abcdef01] {}", l)).collect()
    }

    #[test]
    fn test_empty_log_is_initializing() {
        let status = classify_tail(&[]);
        assert!(status.success);
        assert_eq!(status.stage, StageLabel::Initializing);
    }

    #[test]
    fn test_most_advanced_marker_wins() {
        let status = classify_tail(&lines(&[
            "DEPLOYMENT STARTED",
            "Compiling assets: rake assets:precompile",
            "Assets compiled in 10.0s",
            "Restarting service",
            "Reload sentinel written",
        ]));
        assert!(status.success);
        assert_eq!(status.stage, StageLabel::Restarting);
        assert!(status.message.ends_with("Reload sentinel written"));
    }

    #[test]
    fn test_compiling_only() {
        let status = classify_tail(&lines(&["DEPLOYMENT STARTED", "Compiling assets: true"]));
        assert_eq!(status.stage, StageLabel::Compiling);
    }

    #[test]
    fn test_completed_marker() {
        let status = classify_tail(&lines(&[
            "Compiling assets: true",
            "Assets compiled in 1.0s",
            "Restarting service",
            "WARNING: no running instance identified",
            "Pending queue cleared",
            "DEPLOYMENT COMPLETED SUCCESSFULLY",
        ]));
        assert!(status.success);
        assert_eq!(status.stage, StageLabel::Completed);
    }

    #[test]
    fn test_error_marker_forces_failed() {
        let status = classify_tail(&lines(&[
            "Compiling assets: false",
            "ERROR: asset compilation failed (exit code 1)",
            "DEPLOYMENT FAILED",
        ]));
        assert!(!status.success);
        assert_eq!(status.stage, StageLabel::Failed);
    }

    #[test]
    fn test_stale_failure_followed_by_success() {
        let status = classify_tail(&lines(&[
            "ERROR: asset compilation failed (exit code 1)",
            "Compiling assets: true",
            "DEPLOYMENT COMPLETED SUCCESSFULLY",
        ]));
        assert_eq!(status.stage, StageLabel::Completed);

        let status = classify_tail(&lines(&[
            "DEPLOYMENT COMPLETED SUCCESSFULLY",
            "Compiling assets: true",
            "FATAL: deployment aborted: boom",
        ]));
        assert_eq!(status.stage, StageLabel::Failed);
    }

    #[test]
    fn test_classify_events_uses_last_stage() {
        let events = vec![
            LogEvent::new("run-1", Some(StageLabel::Compiling), "Compiling assets"),
            LogEvent::new("run-1", Some(StageLabel::Compiled), "Assets compiled"),
            LogEvent::new("run-1", None, "  | some build output"),
        ];
        let status = classify_events("run-1", &events);
        assert!(status.success);
        assert_eq!(status.stage, StageLabel::Compiled);
        assert_eq!(status.message, "  | some build output");
        assert_eq!(status.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_classify_events_empty() {
        let status = classify_events("run-x", &[]);
        assert_eq!(status.stage, StageLabel::Initializing);
    }

    #[tokio::test]
    async fn test_current_status_isolates_runs() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeploymentLog::new(dir.path().join("deploy.log"));

        log.append(LogEvent::new("run-old", Some(StageLabel::Failed), "ERROR: old failure"))
            .await
            .unwrap();
        log.append(LogEvent::new("run-new", Some(StageLabel::Compiling), "Compiling assets"))
            .await
            .unwrap();

        // 启发式会被旧运行的错误行污染
        let heuristic = current_status(&log, None).await.unwrap();
        assert_eq!(heuristic.stage, StageLabel::Failed);

        let exact = current_status(&log, Some("run-new")).await.unwrap();
        assert_eq!(exact.stage, StageLabel::Compiling);
        assert!(exact.success);
    }
}
