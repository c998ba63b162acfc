//! Template Deploy Agent - 模板资源部署代理
//!
//! Usage:
//! - Run the agent: `template-deploy-agent` or `template-deploy-agent serve --port 9877`
//! - Apply pending changes: `template-deploy-agent apply [--server URL] [--follow-run]`
//! - Show status: `template-deploy-agent status [--server URL] [--run RUN_ID]`

use template_deploy_agent::{ApplyOptions, RuntimeConfig};

/// 子命令
enum Command {
    Serve(RuntimeConfig),
    Apply(ApplyOptions),
    Status {
        server_url: Option<String>,
        run_id: Option<String>,
    },
}

/// 解析命令行参数
fn parse_args() -> Command {
    let args: Vec<String> = std::env::args().collect();

    let (command, start) = match args.get(1).map(String::as_str) {
        Some("apply") => ("apply", 2),
        Some("status") => ("status", 2),
        Some("serve") => ("serve", 2),
        _ => ("serve", 1),
    };

    let mut runtime = RuntimeConfig::default();
    let mut apply = ApplyOptions::default();
    let mut run_id = None;

    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                match parse_port(&args[i + 1]) {
                    Ok(port) => runtime.port_override = Some(port),
                    Err(e) => {
                        eprintln!("{}", e);
                        std::process::exit(2);
                    }
                }
                i += 2;
            }
            "--server" if i + 1 < args.len() => {
                apply.server_url = Some(args[i + 1].clone());
                i += 2;
            }
            "--run" if i + 1 < args.len() => {
                run_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--follow-run" => {
                apply.follow_run = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    match command {
        "apply" => Command::Apply(apply),
        "status" => Command::Status {
            server_url: apply.server_url,
            run_id,
        },
        _ => Command::Serve(runtime),
    }
}

/// 解析 `--port` 的值
fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) => Err("Invalid --port value '0': port must be non-zero".to_string()),
        Ok(port) => Ok(port),
        Err(e) => Err(format!("Invalid --port value '{}': {}", value, e)),
    }
}

fn print_help() {
    println!("Template Deploy Agent - 模板资源部署代理");
    println!();
    println!("USAGE:");
    println!("    template-deploy-agent [COMMAND] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    serve            Run the deploy agent (default)");
    println!("    apply            Submit pending changes and wait for completion");
    println!("    status           Print the current deployment status");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port (serve)");
    println!("    --server <URL>   Agent URL (apply, status)");
    println!("    --follow-run     Track the submitted run's stage instead of the pending count (apply)");
    println!("    --run <RUN_ID>   Query a specific run (status)");
    println!("    -h, --help       Print help information");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    template_deploy_agent::init_tracing();

    match parse_args() {
        Command::Serve(runtime) => template_deploy_agent::run_agent(runtime).await,
        Command::Apply(options) => {
            if !template_deploy_agent::run_apply(options).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status { server_url, run_id } => {
            template_deploy_agent::run_status(server_url, run_id).await
        }
    }
}
