//! 部署运行登记
//!
//! 按资源名称持有单写者锁，并保存活跃运行与历史记录

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::MAX_RUN_HISTORY;
use crate::domain::deploy::{RunOutcome, RunRecord, StageLabel};

/// 持有部署锁的运行
struct ActiveRun {
    run_id: String,
    cancel_token: CancellationToken,
}

/// 运行登记表
pub struct RunRegistry {
    /// 资源名称 -> 持锁运行
    locks: RwLock<HashMap<String, ActiveRun>>,
    /// 未结束的运行
    runs: RwLock<HashMap<String, RunRecord>>,
    /// 已结束的运行，最新在前
    history: RwLock<VecDeque<RunRecord>>,
    max_history: usize,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::with_history(MAX_RUN_HISTORY)
    }

    pub fn with_history(max_history: usize) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// 尝试获取资源锁并登记运行
    ///
    /// 资源已被占用时返回持锁运行的 run_id
    pub async fn try_acquire(
        &self,
        resource: &str,
        record: RunRecord,
    ) -> Result<CancellationToken, String> {
        let run_id = record.run_id.clone();
        let cancel_token = {
            let mut locks = self.locks.write().await;
            if let Some(active) = locks.get(resource) {
                return Err(active.run_id.clone());
            }
            let cancel_token = CancellationToken::new();
            locks.insert(
                resource.to_string(),
                ActiveRun {
                    run_id: run_id.clone(),
                    cancel_token: cancel_token.clone(),
                },
            );
            cancel_token
        };

        self.create(record).await;
        Ok(cancel_token)
    }

    /// 释放资源锁（仅当仍由该运行持有）
    pub async fn release(&self, resource: &str, run_id: &str) {
        let mut locks = self.locks.write().await;
        if locks.get(resource).is_some_and(|a| a.run_id == run_id) {
            locks.remove(resource);
        }
    }

    /// 持锁运行的 run_id
    pub async fn active_run_id(&self, resource: &str) -> Option<String> {
        let locks = self.locks.read().await;
        locks.get(resource).map(|a| a.run_id.clone())
    }

    /// 取消持锁运行，返回被取消的 run_id
    pub async fn cancel(&self, resource: &str) -> Option<String> {
        let locks = self.locks.read().await;
        locks.get(resource).map(|active| {
            active.cancel_token.cancel();
            active.run_id.clone()
        })
    }

    /// 登记运行（不加锁）
    pub async fn create(&self, record: RunRecord) {
        let mut runs = self.runs.write().await;
        runs.insert(record.run_id.clone(), record);
    }

    /// 更新运行阶段
    pub async fn update_stage(&self, run_id: &str, stage: StageLabel) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(run_id) {
            run.stage = stage;
        }
    }

    /// 记录重启结果
    pub async fn set_restart(&self, run_id: &str, description: impl Into<String>) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(run_id) {
            run.restart = Some(description.into());
        }
    }

    /// 结束运行并移到历史记录
    pub async fn finish(&self, run_id: &str, outcome: RunOutcome) {
        let run = {
            let mut runs = self.runs.write().await;
            runs.remove(run_id).map(|mut run| {
                run.complete(outcome);
                run
            })
        };

        if let Some(run) = run {
            let mut history = self.history.write().await;
            history.push_front(run);
            while history.len() > self.max_history {
                history.pop_back();
            }
        }
    }

    /// 最近的运行：活跃运行在前，随后是历史记录
    pub async fn recent(&self, limit: usize) -> Vec<RunRecord> {
        let mut active: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        active.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let history = self.history.read().await;
        active
            .into_iter()
            .chain(history.iter().cloned())
            .take(limit)
            .collect()
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_rejects_second_run() {
        let registry = RunRegistry::new();

        let token = registry
            .try_acquire("assets", RunRecord::new("run-1", 2))
            .await;
        assert!(token.is_ok());

        let second = registry
            .try_acquire("assets", RunRecord::new("run-2", 2))
            .await;
        assert_eq!(second.unwrap_err(), "run-1");
        assert!(registry.recent(10).await.iter().all(|r| r.run_id != "run-2"));

        registry.release("assets", "run-1").await;
        assert!(registry.active_run_id("assets").await.is_none());
        assert!(registry
            .try_acquire("assets", RunRecord::new("run-3", 1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_release_ignores_other_run() {
        let registry = RunRegistry::new();
        registry
            .try_acquire("assets", RunRecord::new("run-1", 1))
            .await
            .unwrap();

        registry.release("assets", "run-other").await;
        assert_eq!(registry.active_run_id("assets").await, Some("run-1".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_triggers_token() {
        let registry = RunRegistry::new();
        let token = registry
            .try_acquire("assets", RunRecord::new("run-1", 1))
            .await
            .unwrap();

        assert_eq!(registry.cancel("assets").await, Some("run-1".to_string()));
        assert!(token.is_cancelled());
        assert_eq!(registry.cancel("other").await, None);
    }

    #[tokio::test]
    async fn test_finish_moves_to_history() {
        let registry = RunRegistry::with_history(2);

        for i in 0..3 {
            let id = format!("run-{}", i);
            registry.create(RunRecord::new(id.clone(), 1)).await;
            registry.update_stage(&id, StageLabel::Compiling).await;
            registry.finish(&id, RunOutcome::Completed).await;
        }

        let recent = registry.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "run-2");
        assert_eq!(recent[0].stage, StageLabel::Completed);
        assert!(recent.iter().all(|r| r.run_id != "run-0"));
    }
}
