// Bootstrap configuration
// Process-level knobs only; policy knobs live in the hot-reloaded runtime
// settings. Priority: CLI > ENV > defaults.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Prism Gateway - multi-protocol LLM gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Path to the SQLite store; omit for the in-memory store
    #[arg(long, env = "GATEWAY_DB_FILE")]
    pub db_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub db_file: Option<PathBuf>,
    pub log_level: String,
    /// Seconds between runtime-settings reloads
    pub settings_reload_interval: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        Ok(Config {
            server_host: args
                .host
                .or_else(|| std::env::var("SERVER_HOST").ok())
                .unwrap_or_else(|| "0.0.0.0".to_string()),

            server_port: args
                .port
                .or_else(|| {
                    std::env::var("SERVER_PORT")
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(8080),

            db_file: args
                .db_file
                .or_else(|| std::env::var("GATEWAY_DB_FILE").ok().map(PathBuf::from)),

            log_level: args
                .log_level
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .unwrap_or_else(|| "info".to_string()),

            settings_reload_interval: std::env::var("SETTINGS_RELOAD_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        })
    }
}
