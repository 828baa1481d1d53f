mod bot;
mod callback;
mod config;
mod core;
mod correlation;
mod deadline;
mod delivery;
mod kv;
mod limiter;
mod retry;
mod runner;
mod tts;
mod webhook;

#[cfg(test)]
mod e2e_tests;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config_path = PathBuf::from("config.toml");

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("relaybot {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("relaybot {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: relaybot [--config <path>]\n");
                println!("Options:");
                println!("  --config <path>  Path to config.toml (default: ./config.toml)");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            "--config" => {
                let path = args.get(2).ok_or_else(|| {
                    anyhow::anyhow!("--config requires a path argument")
                })?;
                config_path = PathBuf::from(path);
            }
            other => {
                anyhow::bail!("Unknown argument: {} (see --help)", other);
            }
        }
    }

    let config = config::AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(core::run(config))
}
