use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Path to the SQLite database file.
    #[arg(long)]
    pub database: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Location of the SQLite database file.
    pub database: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    database: FileDatabase,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileDatabase {
    path: Option<PathBuf>,
}

fn default_port() -> u16 {
    8790
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file
    /// and defaults, in that precedence order.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut port = default_port();
        let mut logging = default_logging();
        let mut database: Option<PathBuf> = None;

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("COURIER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/courier.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            database = file_cfg.database.path;
        }

        // environment overrides
        if let Ok(p) = std::env::var("COURIER_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("COURIER_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(d) = std::env::var("DATABASE_URL") {
            if !d.is_empty() {
                database = Some(PathBuf::from(d));
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(d) = &cli.database {
            database = Some(d.clone());
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        Ok(Self {
            bind,
            database: database.unwrap_or_else(|| PathBuf::from("./courier.db")),
            logging_enabled: logging,
        })
    }
}
