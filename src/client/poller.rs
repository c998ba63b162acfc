//! 部署完成轮询
//!
//! 提交后按固定间隔读取完成信号，直到完成、失败或用尽轮询次数。
//! 轮询只读，中途丢弃 future 不会产生副作用。

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PollerConfig;
use crate::domain::deploy::{DeploymentStatus, StageLabel};

use super::progress::{self, ProgressSink};
use super::ClientError;

/// 轮询读取的状态来源
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn pending_count(&self) -> Result<u64, ClientError>;

    async fn deployment_status(&self, run_id: Option<&str>) -> Result<DeploymentStatus, ClientError>;
}

/// 完成信号
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionSignal {
    /// 待部署数量由非零变为零
    ///
    /// `baseline` 为提交前看到的数量
    QueueCount { baseline: Option<u64> },
    /// 指定运行的阶段变为终态
    RunStage { run_id: String },
}

/// 轮询结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    /// 首次读取即为零，且此前没有看到非零数量
    NothingToWait,
    Failed { message: String },
    TimedOut {
        log_hint: String,
        last_error: Option<String>,
    },
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Completed)
    }

    /// 面向用户的提示
    pub fn user_message(&self) -> String {
        match self {
            PollOutcome::Completed => "Deployment completed! All changes are now live".to_string(),
            PollOutcome::NothingToWait => {
                "No pending changes were observed; nothing to wait for".to_string()
            }
            PollOutcome::Failed { message } => format!("Deployment failed: {}", message),
            PollOutcome::TimedOut {
                log_hint,
                last_error: None,
            } => format!(
                "Deployment timeout. Please check server logs at {}",
                log_hint
            ),
            PollOutcome::TimedOut {
                log_hint,
                last_error: Some(error),
            } => format!(
                "Deployment timeout (last error: {}). Please check server logs at {}",
                error, log_hint
            ),
        }
    }
}

/// 完成轮询器
pub struct CompletionPoller<S> {
    source: S,
    initial_delay: Duration,
    interval: Duration,
    max_attempts: u32,
    log_hint: String,
}

impl<S: StatusSource> CompletionPoller<S> {
    pub fn new(source: S, config: &PollerConfig) -> Self {
        Self {
            source,
            initial_delay: config.initial_delay,
            interval: config.interval,
            max_attempts: config.max_attempts,
            log_hint: config.log_hint.clone(),
        }
    }

    /// 轮询直到得出结果
    pub async fn run(&self, signal: &CompletionSignal, sink: &mut dyn ProgressSink) -> PollOutcome {
        sink.update(&progress::initiated());
        tokio::time::sleep(self.initial_delay).await;

        let mut last_count = match signal {
            CompletionSignal::QueueCount { baseline } => *baseline,
            CompletionSignal::RunStage { .. } => None,
        };
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.check(signal, &mut last_count).await {
                Ok(Some(outcome)) => {
                    if outcome.is_success() {
                        sink.update(&progress::completed());
                    }
                    return outcome;
                }
                Ok(None) => last_error = None,
                Err(e) => {
                    warn!(attempt, error = %e, "Status check failed, will retry");
                    last_error = Some(e.to_string());
                }
            }

            sink.update(&progress::synthetic_progress(attempt));

            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        PollOutcome::TimedOut {
            log_hint: self.log_hint.clone(),
            last_error,
        }
    }

    async fn check(
        &self,
        signal: &CompletionSignal,
        last_count: &mut Option<u64>,
    ) -> Result<Option<PollOutcome>, ClientError> {
        match signal {
            CompletionSignal::QueueCount { .. } => {
                let count = self.source.pending_count().await?;
                debug!(count, previous = ?last_count, "Pending count");

                if count == 0 {
                    return Ok(Some(match last_count {
                        Some(previous) if *previous > 0 => PollOutcome::Completed,
                        _ => PollOutcome::NothingToWait,
                    }));
                }
                *last_count = Some(count);
                Ok(None)
            }
            CompletionSignal::RunStage { run_id } => {
                let status = self.source.deployment_status(Some(run_id)).await?;
                debug!(run_id = %run_id, stage = %status.stage, "Deployment stage");

                if !status.stage.is_terminal() {
                    return Ok(None);
                }
                Ok(Some(if status.stage == StageLabel::Completed {
                    PollOutcome::Completed
                } else {
                    PollOutcome::Failed {
                        message: status.message,
                    }
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProgressUpdate;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本返回读数，读完后重复最后一个
    struct ScriptedSource {
        counts: Mutex<VecDeque<Result<u64, u16>>>,
        stages: Mutex<VecDeque<StageLabel>>,
    }

    impl ScriptedSource {
        fn counts(script: Vec<Result<u64, u16>>) -> Self {
            Self {
                counts: Mutex::new(script.into()),
                stages: Mutex::new(VecDeque::new()),
            }
        }

        fn stages(script: Vec<StageLabel>) -> Self {
            Self {
                counts: Mutex::new(VecDeque::new()),
                stages: Mutex::new(script.into()),
            }
        }
    }

    fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> T {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn pending_count(&self) -> Result<u64, ClientError> {
            next(&self.counts).map_err(|status| ClientError::Status {
                status,
                body: "unavailable".to_string(),
            })
        }

        async fn deployment_status(
            &self,
            run_id: Option<&str>,
        ) -> Result<DeploymentStatus, ClientError> {
            let stage = next(&self.stages);
            Ok(DeploymentStatus {
                success: stage != StageLabel::Failed,
                stage,
                message: format!("stage {}", stage),
                run_id: run_id.map(str::to_string),
            })
        }
    }

    fn fast_config(max_attempts: u32) -> PollerConfig {
        PollerConfig {
            server_url: "http://127.0.0.1:1".to_string(),
            api_key: String::new(),
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            max_attempts,
            log_hint: "/var/log/deploy.log".to_string(),
        }
    }

    async fn poll(
        source: ScriptedSource,
        signal: CompletionSignal,
        max_attempts: u32,
    ) -> (PollOutcome, Vec<ProgressUpdate>) {
        let poller = CompletionPoller::new(source, &fast_config(max_attempts));
        let mut updates = Vec::new();
        let outcome = poller.run(&signal, &mut updates).await;
        (outcome, updates)
    }

    #[tokio::test]
    async fn test_nonzero_to_zero_completes() {
        let source = ScriptedSource::counts(vec![Ok(3), Ok(3), Ok(3), Ok(0)]);
        let (outcome, updates) = poll(source, CompletionSignal::QueueCount { baseline: None }, 60).await;

        assert_eq!(outcome, PollOutcome::Completed);
        assert_eq!(updates.first().map(|u| u.percent), Some(20));
        assert_eq!(updates.last().map(|u| u.percent), Some(100));
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[tokio::test]
    async fn test_baseline_allows_immediate_completion() {
        let source = ScriptedSource::counts(vec![Ok(0)]);
        let (outcome, _) = poll(source, CompletionSignal::QueueCount { baseline: Some(2) }, 5).await;
        assert_eq!(outcome, PollOutcome::Completed);
    }

    #[tokio::test]
    async fn test_zero_without_baseline_is_not_success() {
        let source = ScriptedSource::counts(vec![Ok(0)]);
        let (outcome, updates) = poll(source, CompletionSignal::QueueCount { baseline: None }, 5).await;

        assert_eq!(outcome, PollOutcome::NothingToWait);
        assert!(!outcome.is_success());
        assert!(updates.iter().all(|u| u.percent < 100));
    }

    #[tokio::test]
    async fn test_never_reaching_zero_times_out() {
        let source = ScriptedSource::counts(vec![Ok(4)]);
        let (outcome, updates) = poll(source, CompletionSignal::QueueCount { baseline: None }, 60).await;

        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                log_hint: "/var/log/deploy.log".to_string(),
                last_error: None,
            }
        );
        assert!(outcome.user_message().contains("/var/log/deploy.log"));
        // 初始 20% + 每次轮询一条
        assert_eq!(updates.len(), 61);
        assert_eq!(updates.last().map(|u| u.percent), Some(95));
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let source = ScriptedSource::counts(vec![Err(503), Ok(2), Err(502), Ok(0)]);
        let (outcome, _) = poll(source, CompletionSignal::QueueCount { baseline: None }, 10).await;
        assert_eq!(outcome, PollOutcome::Completed);
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_error() {
        let source = ScriptedSource::counts(vec![Ok(1), Err(500)]);
        let (outcome, _) = poll(source, CompletionSignal::QueueCount { baseline: None }, 3).await;

        match &outcome {
            PollOutcome::TimedOut { last_error: Some(e), .. } => assert!(e.contains("500")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.user_message().contains("last error"));
    }

    #[tokio::test]
    async fn test_run_stage_signal() {
        let source = ScriptedSource::stages(vec![
            StageLabel::Compiling,
            StageLabel::Restarting,
            StageLabel::Completed,
        ]);
        let signal = CompletionSignal::RunStage {
            run_id: "run-1".to_string(),
        };
        let (outcome, _) = poll(source, signal, 10).await;
        assert_eq!(outcome, PollOutcome::Completed);

        let source = ScriptedSource::stages(vec![StageLabel::Compiling, StageLabel::Failed]);
        let signal = CompletionSignal::RunStage {
            run_id: "run-2".to_string(),
        };
        let (outcome, _) = poll(source, signal, 10).await;
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                message: "stage failed".to_string()
            }
        );
    }
}
