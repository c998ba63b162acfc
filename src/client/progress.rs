//! 客户端进度显示
//!
//! 轮询期间的百分比只由轮询次数推算，与服务端真实阶段无关，
//! 因此每条更新都带有 `estimated` 标记。

use std::io::Write;

/// 一次进度更新
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub status: String,
    pub detail: String,
    /// 是否为推算值
    pub estimated: bool,
}

impl ProgressUpdate {
    fn new(percent: u8, status: &str, detail: impl Into<String>, estimated: bool) -> Self {
        Self {
            percent,
            status: status.to_string(),
            detail: detail.into(),
            estimated,
        }
    }
}

/// 提交成功后的初始进度
pub fn initiated() -> ProgressUpdate {
    ProgressUpdate::new(20, "Deployment initiated", "Connecting to server...", false)
}

/// 完成时的进度
pub fn completed() -> ProgressUpdate {
    ProgressUpdate::new(100, "Deployment completed!", "All changes are now live", false)
}

/// 按轮询次数推算进度（attempt 从 1 开始），结果随 attempt 单调不减
pub fn synthetic_progress(attempt: u32) -> ProgressUpdate {
    match attempt {
        0..=9 => ProgressUpdate::new(
            30 + 3 * attempt as u8,
            "Compiling assets...",
            format!("Step {}/10", attempt),
            true,
        ),
        10..=29 => ProgressUpdate::new(65, "Still compiling...", "This may take a moment", true),
        30..=44 => ProgressUpdate::new(85, "Restarting service...", "Almost done", true),
        _ => ProgressUpdate::new(95, "Finalizing...", "Just a few more seconds", true),
    }
}

/// 进度输出
pub trait ProgressSink {
    fn update(&mut self, update: &ProgressUpdate);
}

impl ProgressSink for Vec<ProgressUpdate> {
    fn update(&mut self, update: &ProgressUpdate) {
        self.push(update.clone());
    }
}

/// 终端进度条
pub struct TerminalProgress<W: Write> {
    out: W,
}

impl TerminalProgress<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> TerminalProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ProgressSink for TerminalProgress<W> {
    fn update(&mut self, update: &ProgressUpdate) {
        let filled = (update.percent as usize / 5).min(20);
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(20 - filled));
        let marker = if update.estimated { " (estimated)" } else { "" };
        // 终端写入失败不影响轮询
        let _ = writeln!(
            self.out,
            "[{}] {:>3}%{} {} - {}",
            bar, update.percent, marker, update.status, update.detail
        );
        let _ = self.out.flush();
    }
}
