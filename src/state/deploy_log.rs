//! 部署日志
//!
//! 只追加的部署记录，写入两份文件：
//! - 文本日志：`[时间] [run xxxxxxxx] 消息`，供运维人员直接查看与启发式分类
//! - 事件日志（JSON Lines）：`{run_id, timestamp, stage, detail}`，按 run 精确查询
//!
//! 每次追加同时广播给 SSE 订阅者。

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};

use crate::config::env::constants::MAX_RUN_HISTORY;
use crate::domain::deploy::{short_run_id, LogEvent};

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

/// 读取尾部时最多回看的字节数
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

/// 部署日志
pub struct DeploymentLog {
    text_path: PathBuf,
    events_path: PathBuf,
    /// 写锁，保证一行内容不会与并发写入交错
    ///
    /// 同时记录最近运行的首个事件在事件文件中的偏移，最新在后
    run_offsets: Mutex<VecDeque<(String, u64)>>,
    sender: broadcast::Sender<LogEvent>,
}

impl DeploymentLog {
    /// 创建部署日志，事件文件与文本日志同目录
    pub fn new(text_path: impl Into<PathBuf>) -> Self {
        let text_path = text_path.into();
        let events_path = text_path.with_extension("events.jsonl");
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            text_path,
            events_path,
            run_offsets: Mutex::new(VecDeque::new()),
            sender,
        }
    }

    /// 追加一条记录
    pub async fn append(&self, event: LogEvent) -> std::io::Result<()> {
        let text_line = event.to_text_line();
        let json_line = serde_json::to_string(&event)?;

        {
            let mut offsets = self.run_offsets.lock().await;
            if let Some(parent) = self.text_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            append_line(&self.text_path, &text_line).await?;

            if !offsets.iter().any(|(id, _)| *id == event.run_id) {
                let offset = match fs::metadata(&self.events_path).await {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(e),
                };
                offsets.push_back((event.run_id.clone(), offset));
                while offsets.len() > MAX_RUN_HISTORY {
                    offsets.pop_front();
                }
            }
            append_line(&self.events_path, &json_line).await?;
        }

        tracing::info!(
            run_id = %short_run_id(&event.run_id),
            stage = ?event.stage,
            "{}",
            event.detail
        );

        // 没有订阅者时发送失败，忽略
        let _ = self.sender.send(event);
        Ok(())
    }

    /// 文本日志的最后 `n` 行
    pub async fn tail(&self, n: usize) -> std::io::Result<Vec<String>> {
        let mut file = match File::open(&self.text_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        let offset = len.saturating_sub(TAIL_WINDOW_BYTES);
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        let content = String::from_utf8_lossy(&buf);

        let mut lines: Vec<&str> = content.lines().collect();
        // 从文件中间开始读时，第一行可能不完整
        if offset > 0 && !lines.is_empty() {
            lines.remove(0);
        }

        let skip = lines.len().saturating_sub(n);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }

    /// 某次运行的全部事件
    ///
    /// 本进程记录过的运行从其首个事件处开始读，其余运行扫描整个事件文件
    pub async fn events_for(&self, run_id: &str) -> std::io::Result<Vec<LogEvent>> {
        let offset = {
            let offsets = self.run_offsets.lock().await;
            offsets
                .iter()
                .find(|(id, _)| id == run_id)
                .map(|(_, offset)| *offset)
        };

        if let Some(offset) = offset {
            let events = self.scan_events(run_id, offset).await?;
            // 文件被外部截断后偏移失效，回退为整体扫描
            if !events.is_empty() {
                return Ok(events);
            }
        }
        self.scan_events(run_id, 0).await
    }

    /// 订阅新追加的事件
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    async fn scan_events(&self, run_id: &str, offset: u64) -> std::io::Result<Vec<LogEvent>> {
        let mut file = match File::open(&self.events_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(offset)).await?;

        let mut events = Vec::new();
        let mut lines = BufReader::new(file).split(b'\n');
        while let Some(line) = lines.next_segment().await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LogEvent>(&line) {
                Ok(event) if event.run_id == run_id => events.push(event),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping malformed deploy event line"),
            }
        }
        Ok(events)
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}
