//! ServerBond Agent - 单机多站点部署代理
//!
//! Usage:
//! - Normal mode: `serverbond-agent`
//! - With custom port: `serverbond-agent --port 9000`

use serverbond_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("ServerBond Agent - 单机多站点部署代理");
    println!();
    println!("USAGE:");
    println!("    serverbond-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port (SB_AGENT_PORT)");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    SB_AGENT_TOKEN   Bearer token (generated and stored when unset)");
    println!("    SB_BASE_DIR      Site working directories (default /opt/sites)");
    println!("    RUST_LOG         Log filter (default serverbond_agent=info,tower_http=info)");
}

fn main() {
    let config = parse_args();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(serverbond_agent::init_and_run_agent_with_config(config)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
