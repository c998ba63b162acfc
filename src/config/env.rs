//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥（提交与取消部署需要）
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 应用目录（构建命令的工作目录）
    pub app_dir: PathBuf,
    /// 资源构建命令
    pub build_command: String,
    /// 构建超时
    pub compile_timeout: Duration,
    /// 重启配置
    pub restart: RestartConfig,
    /// 部署日志路径（文本）
    pub deploy_log_path: PathBuf,
    /// 待部署队列文件路径
    pub pending_queue_path: PathBuf,
}

/// 重启策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartStrategy {
    /// 仅写入 sentinel 文件，由运行中的进程自行重载
    Sentinel,
    /// 通过服务管理器识别实例并重启
    Service,
    /// 执行固定的重启命令（如编排系统 API 调用）
    Command,
}

impl RestartStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentinel" => RestartStrategy::Sentinel,
            "command" => RestartStrategy::Command,
            "service" | "systemd" => RestartStrategy::Service,
            other => {
                warn!(strategy = %other, "Unknown RESTART_STRATEGY, falling back to service");
                RestartStrategy::Service
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RestartStrategy::Sentinel => "sentinel",
            RestartStrategy::Service => "service",
            RestartStrategy::Command => "command",
        }
    }
}

/// 重启配置
#[derive(Clone, Debug)]
pub struct RestartConfig {
    pub strategy: RestartStrategy,
    /// sentinel 文件路径，运行中的进程在下一次请求时检查其修改时间
    pub sentinel_path: PathBuf,
    /// 列出运行中实例的命令
    pub inventory_command: String,
    /// 本机标识（默认主机名），用于在实例列表中匹配
    pub identity: String,
    /// 候选实例名称
    pub candidates: Vec<String>,
    /// 重启命令，`{instance}` 会被替换为实例名称
    pub restart_command: String,
    /// 探测实例是否存活的命令，`{instance}` 会被替换
    pub probe_command: Option<String>,
    /// 重启超时
    pub timeout: Duration,
    /// 重启后的稳定等待时间
    pub stabilize_delay: Duration,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        // 未配置时为空，提交与取消接口全部拒绝
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY").unwrap_or_default();
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOY_AGENT_API_KEY");
        }

        let port = parse_var("PORT").unwrap_or(constants::DEFAULT_PORT);

        let app_dir = PathBuf::from(
            env::var("APP_DIR").unwrap_or_else(|_| "/opt/zammad".to_string()),
        );

        let build_command = env::var("BUILD_COMMAND")
            .unwrap_or_else(|_| "zammad run rake assets:precompile".to_string());

        let compile_timeout = Duration::from_secs(
            parse_var("COMPILE_TIMEOUT_SECS").unwrap_or(constants::COMPILE_TIMEOUT_SECS),
        );

        let restart = RestartConfig::from_env(&app_dir);

        let deploy_log_path = env::var("DEPLOY_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir.join("log").join("template_deploy.log"));

        let pending_queue_path = env::var("PENDING_QUEUE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir.join("tmp").join("template_pending_queue.json"));

        Self {
            api_key,
            port,
            app_dir,
            build_command,
            compile_timeout,
            restart,
            deploy_log_path,
            pending_queue_path,
        }
    }

    /// 以给定目录为根的本地配置，所有外部命令均为无副作用的 shell 内建
    #[cfg(test)]
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            api_key: "test-key".to_string(),
            port: 0,
            app_dir: dir.to_path_buf(),
            build_command: "true".to_string(),
            compile_timeout: Duration::from_secs(5),
            restart: RestartConfig {
                strategy: RestartStrategy::Service,
                sentinel_path: dir.join("tmp").join("restart.txt"),
                inventory_command: "echo 'app-web.service loaded active running'".to_string(),
                identity: "test-host".to_string(),
                candidates: vec!["app-web.service".to_string()],
                restart_command: "true".to_string(),
                probe_command: None,
                timeout: Duration::from_secs(5),
                stabilize_delay: Duration::from_millis(10),
            },
            deploy_log_path: dir.join("log").join("template_deploy.log"),
            pending_queue_path: dir.join("tmp").join("template_pending_queue.json"),
        }
    }
}

impl RestartConfig {
    /// 从环境变量加载重启配置
    pub fn from_env(app_dir: &std::path::Path) -> Self {
        let strategy = env::var("RESTART_STRATEGY")
            .map(|v| RestartStrategy::from_str(&v))
            .unwrap_or(RestartStrategy::Service);

        let sentinel_path = env::var("SENTINEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir.join("tmp").join("restart.txt"));

        let inventory_command = env::var("INVENTORY_COMMAND").unwrap_or_else(|_| {
            "systemctl list-units --type=service --state=running --no-legend --plain".to_string()
        });

        // 本机标识，默认使用主机名
        let identity = env::var("INSTANCE_IDENTITY").unwrap_or_else(|_| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });

        let candidates = env::var("SERVICE_CANDIDATES")
            .map(|v| parse_list(&v))
            .unwrap_or_else(|_| {
                vec![
                    "zammad.service".to_string(),
                    "zammad-web.service".to_string(),
                    "zammad-railsserver.service".to_string(),
                ]
            });

        let restart_command = env::var("RESTART_COMMAND")
            .unwrap_or_else(|_| "sudo systemctl restart {instance}".to_string());

        let probe_command = match env::var("PROBE_COMMAND") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => Some("systemctl is-active --quiet {instance}".to_string()),
        };

        let timeout = Duration::from_secs(
            parse_var("RESTART_TIMEOUT_SECS").unwrap_or(constants::RESTART_TIMEOUT_SECS),
        );
        let stabilize_delay = Duration::from_secs(
            parse_var("RESTART_STABILIZE_SECS").unwrap_or(constants::RESTART_STABILIZE_SECS),
        );

        Self {
            strategy,
            sentinel_path,
            inventory_command,
            identity,
            candidates,
            restart_command,
            probe_command,
            timeout,
            stabilize_delay,
        }
    }
}

/// 客户端轮询配置
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Agent 地址
    pub server_url: String,
    /// API 密钥
    pub api_key: String,
    /// 提交后首次轮询前的等待
    pub initial_delay: Duration,
    /// 轮询间隔
    pub interval: Duration,
    /// 最大轮询次数
    pub max_attempts: u32,
    /// 超时提示中引用的服务端日志位置
    pub log_hint: String,
}

impl PollerConfig {
    pub fn from_env() -> Self {
        let server_url = env::var("DEPLOY_AGENT_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{}", constants::DEFAULT_PORT));
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY").unwrap_or_default();
        let interval =
            Duration::from_secs(parse_var("POLL_INTERVAL_SECS").unwrap_or(constants::POLL_INTERVAL_SECS));
        let max_attempts = parse_var("POLL_MAX_ATTEMPTS").unwrap_or(constants::POLL_MAX_ATTEMPTS);
        let log_hint = env::var("DEPLOY_LOG_PATH")
            .unwrap_or_else(|_| "/opt/zammad/log/template_deploy.log".to_string());

        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key,
            initial_delay: Duration::from_secs(constants::POLL_INITIAL_DELAY_SECS),
            interval,
            max_attempts,
            log_hint,
        }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// 逗号分隔列表
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 常量
pub mod constants {
    /// 默认监听端口
    pub const DEFAULT_PORT: u16 = 9877;

    /// 资源构建超时（秒）
    pub const COMPILE_TIMEOUT_SECS: u64 = 180;

    /// 实例重启超时（秒）
    pub const RESTART_TIMEOUT_SECS: u64 = 60;

    /// 重启后稳定等待（秒）
    pub const RESTART_STABILIZE_SECS: u64 = 3;

    /// 实例清单查询超时（秒）
    pub const INVENTORY_TIMEOUT_SECS: u64 = 10;

    /// 退出时等待被取消部署结束的时间（秒）
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;

    /// 部署锁的资源名称
    pub const DEPLOY_RESOURCE: &str = "template-assets";

    /// 状态分类读取的日志行数
    pub const STATUS_TAIL_LINES: usize = 50;

    /// 运行历史最大保存数量
    pub const MAX_RUN_HISTORY: usize = 50;

    /// 失败时写入日志的命令输出行数
    pub const OUTPUT_TAIL_LINES: usize = 20;

    /// 客户端轮询间隔（秒）
    pub const POLL_INTERVAL_SECS: u64 = 3;

    /// 客户端最大轮询次数（约 3 分钟）
    pub const POLL_MAX_ATTEMPTS: u32 = 60;

    /// 提交后首次轮询前的等待（秒）
    pub const POLL_INITIAL_DELAY_SECS: u64 = 2;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
