//! 待部署变更队列
//!
//! 队列本身由模板编辑流程维护，这里只关心数量与部署成功后的清空。
//! 默认实现读取编辑流程写入的 JSON 文件 `{"pending": [...]}`。

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// 队列错误
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid queue file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 待部署变更队列
#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// 待部署数量
    async fn count(&self) -> Result<u64, QueueError>;

    /// 待部署条目
    async fn entries(&self) -> Result<Vec<Value>, QueueError>;

    /// 清空队列
    ///
    /// 幂等：清空空队列（或不存在的队列文件）不是错误
    async fn clear(&self) -> Result<(), QueueError>;
}

/// 基于 JSON 文件的队列
pub struct FilePendingQueue {
    path: PathBuf,
    /// 串行化本进程内的写入
    write_lock: Mutex<()>,
}

impl FilePendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// 追加一条待部署记录
    ///
    /// 正常情况下由编辑流程写入，这里提供给本地工具与测试
    pub async fn enqueue(&self, entry: Value) -> Result<u64, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?.unwrap_or_else(|| serde_json::json!({}));
        let mut pending = pending_of(&doc);
        pending.push(entry);
        let count = pending.len() as u64;
        set_pending(&mut doc, pending);
        self.save(&doc).await?;
        Ok(count)
    }

    async fn load(&self) -> Result<Option<Value>, QueueError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(QueueError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| QueueError::Parse {
                path: self.path.display().to_string(),
                source,
            })
    }

    /// 原子写入：临时文件 + rename
    async fn save(&self, doc: &Value) -> Result<(), QueueError> {
        let io_err = |source| QueueError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // 临时文件名唯一，避免多个写入者互相覆盖
        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let content = serde_json::to_string_pretty(doc).map_err(|source| QueueError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        fs::write(&temp_path, content).await.map_err(io_err)?;
        fs::rename(&temp_path, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/// 写回 `pending` 数组，非对象文档会被替换为对象
fn set_pending(doc: &mut Value, pending: Vec<Value>) {
    if !doc.is_object() {
        *doc = serde_json::json!({});
    }
    doc["pending"] = Value::Array(pending);
}

fn pending_of(doc: &Value) -> Vec<Value> {
    doc.get("pending")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl PendingQueue for FilePendingQueue {
    async fn count(&self) -> Result<u64, QueueError> {
        Ok(self
            .load()
            .await?
            .map_or(0, |doc| pending_of(&doc).len() as u64))
    }

    async fn entries(&self) -> Result<Vec<Value>, QueueError> {
        Ok(self.load().await?.map(|doc| pending_of(&doc)).unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;

        let Some(mut doc) = self.load().await? else {
            info!(path = %self.path.display(), "Pending queue file absent, nothing to clear");
            return Ok(());
        };

        let removed = pending_of(&doc).len();
        if removed == 0 {
            return Ok(());
        }
        set_pending(&mut doc, Vec::new());

        if let Some(obj) = doc.as_object_mut() {
            obj.insert(
                "cleared_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        self.save(&doc).await?;

        info!(path = %self.path.display(), removed, "Cleared pending queue");
        Ok(())
    }
}

/// 内存队列
#[derive(Default)]
pub struct MemoryPendingQueue {
    entries: RwLock<Vec<Value>>,
}

impl MemoryPendingQueue {
    pub fn with_count(count: usize) -> Self {
        let entries = (0..count)
            .map(|i| serde_json::json!({ "id": format!("change-{}", i) }))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn push(&self, entry: Value) {
        self.entries.write().await.push(entry);
    }
}

#[async_trait]
impl PendingQueue for MemoryPendingQueue {
    async fn count(&self) -> Result<u64, QueueError> {
        Ok(self.entries.read().await.len() as u64)
    }

    async fn entries(&self) -> Result<Vec<Value>, QueueError> {
        Ok(self.entries.read().await.clone())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut entries = self.entries.write().await;
        if !entries.is_empty() {
            warn!(removed = entries.len(), "Clearing in-memory pending queue");
        }
        entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_counts_zero_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FilePendingQueue::new(dir.path().join("tmp/queue.json"));

        assert_eq!(queue.count().await.unwrap(), 0);
        assert!(queue.clear().await.is_ok());
        assert!(queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FilePendingQueue::new(dir.path().join("tmp/queue.json"));

        queue.enqueue(serde_json::json!({"template": "a"})).await.unwrap();
        let count = queue.enqueue(serde_json::json!({"template": "b"})).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.count().await.unwrap(), 2);

        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);

        // 再次清空不报错
        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_preserves_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, r#"{"pending":[{"id":1}],"owner":"editor"}"#).unwrap();

        let queue = FilePendingQueue::new(&path);
        queue.clear().await.unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["owner"], "editor");
        assert_eq!(doc["pending"].as_array().unwrap().len(), 0);
        assert!(doc.get("cleared_at").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_clears_never_fail() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(FilePendingQueue::new(dir.path().join("queue.json")));
        for i in 0..3 {
            queue.enqueue(serde_json::json!({ "id": i })).await.unwrap();
        }

        let a = tokio::spawn({
            let queue = queue.clone();
            async move { queue.clear().await }
        });
        let b = tokio::spawn({
            let queue = queue.clone();
            async move { queue.clear().await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();

        let queue = FilePendingQueue::new(&path);
        assert!(matches!(queue.count().await, Err(QueueError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_memory_queue() {
        let queue = MemoryPendingQueue::with_count(2);
        assert_eq!(queue.count().await.unwrap(), 2);
        queue.push(serde_json::json!({"id": "x"})).await;
        assert_eq!(queue.count().await.unwrap(), 3);
        queue.clear().await.unwrap();
        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
