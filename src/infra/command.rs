//! 命令执行器
//!
//! 提供统一的 shell 命令执行接口，支持：
//! - 超时控制（超时与普通失败可区分）
//! - 取消支持
//! - stdout/stderr 分离捕获

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout(Duration),
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout(d) => write!(f, "Command timed out after {}s", d.as_secs()),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandOutput {
    /// 退出状态
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// 退出码，被信号终止时为 -1
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// 输出的最后 `n` 行（stdout 在前，stderr 在后）
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|l| !l.trim().is_empty())
            .collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }
}

impl CommandRunner {
    /// 执行 shell 命令并捕获输出
    ///
    /// 使用 `sh -c` 在独立进程组中执行命令字符串。超时或取消时终止整个进程组，
    /// 包括命令派生的子进程。
    pub async fn run_shell(
        command: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        debug!(command = %command, work_dir = %work_dir.display(), "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(CommandError::SpawnFailed)?;
        // future 被丢弃时也会终止进程组
        let mut group = ProcessGroup { pgid: child.id() };

        let stdout_task = tokio::spawn(read_lossy(child.stdout.take()));
        let stderr_task = tokio::spawn(read_lossy(child.stderr.take()));

        // 等待命令完成，支持超时和取消
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %command, "Command cancelled, killing process group");
                group.kill();
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                error!(command = %command, "Command timed out after {:?}", timeout);
                group.kill();
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::Timeout(timeout));
            }
            status = child.wait() => status.map_err(CommandError::WaitFailed)?,
        };
        group.disarm();

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// 执行不可取消的 shell 命令
    ///
    /// 用于实例探测等短小查询
    pub async fn run_shell_simple(
        command: &str,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        Self::run_shell(command, work_dir, &CancellationToken::new(), timeout).await
    }
}

/// 读取全部输出，非 UTF-8 字节按替换字符处理
async fn read_lossy<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "Command output read interrupted");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// 命令所在的进程组，drop 时整组终止
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    /// 命令已正常退出，不再需要终止
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        // 进程组已全部退出
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
