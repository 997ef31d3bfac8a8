//! Command-line and file configuration (ambient stack: `clap` +
//! `serde`/`toml`, the way the reference server layers file defaults
//! under CLI overrides).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

const DEFAULT_PORT: u16 = 2800;
const DEFAULT_NOTIFY_INTERVAL: u64 = 895;
const DEFAULT_MAX_CONNECTIONS: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "microdlna", version, about = "A minimal DLNA/UPnP-AV media server")]
struct Cli {
    /// Directory tree to publish.
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Optional TOML config file; CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    friendly_name: Option<String>,

    /// Fixed device UUID; derived from a MAC address when omitted.
    #[arg(long)]
    uuid: Option<String>,

    /// Restrict to these interface names; all non-loopback IPv4
    /// interfaces are used when omitted.
    #[arg(long, value_delimiter = ',')]
    interface: Vec<String>,

    #[arg(long)]
    notify_interval: Option<u64>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Drop privileges to this user after binding sockets.
    #[arg(long)]
    uid: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    media_dir: Option<PathBuf>,
    port: Option<u16>,
    friendly_name: Option<String>,
    uuid: Option<String>,
    interface: Option<Vec<String>>,
    notify_interval: Option<u64>,
    max_connections: Option<usize>,
    pid_file: Option<PathBuf>,
    uid: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub media_dir: PathBuf,
    pub port: u16,
    pub friendly_name: String,
    pub uuid_override: Option<uuid::Uuid>,
    pub interfaces: Option<Vec<String>>,
    pub notify_interval: u64,
    pub max_connections: usize,
    pub pid_file: Option<PathBuf>,
    pub uid: Option<String>,
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("media-dir is required (pass --media-dir or set it in the config file)")]
    MissingMediaDir,
    #[error("media-dir does not exist or is not a directory: {0}")]
    BadMediaDir(PathBuf),
    #[error("invalid uuid: {0}")]
    BadUuid(String),
    #[error("failed to read config file {0}: {1}")]
    ReadFile(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    ParseFile(PathBuf, toml::de::Error),
}

impl Config {
    pub fn from_args() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile(path.clone(), e))?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFile(path.clone(), e))?
            }
            None => FileConfig::default(),
        };

        let media_dir = cli.media_dir.or(file.media_dir).ok_or(ConfigError::MissingMediaDir)?;
        if !media_dir.is_dir() {
            return Err(ConfigError::BadMediaDir(media_dir));
        }

        let uuid_override = match cli.uuid.or(file.uuid) {
            Some(s) => Some(uuid::Uuid::parse_str(&s).map_err(|_| ConfigError::BadUuid(s.clone()))?),
            None => None,
        };

        let interfaces = if !cli.interface.is_empty() { Some(cli.interface) } else { file.interface };

        Ok(Config {
            media_dir,
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            friendly_name: cli.friendly_name.or(file.friendly_name).unwrap_or_else(|| "MicroDLNA Server".to_string()),
            uuid_override,
            interfaces,
            notify_interval: cli.notify_interval.or(file.notify_interval).unwrap_or(DEFAULT_NOTIFY_INTERVAL),
            max_connections: cli.max_connections.or(file.max_connections).unwrap_or(DEFAULT_MAX_CONNECTIONS),
            pid_file: cli.pid_file.or(file.pid_file),
            uid: cli.uid.or(file.uid),
            log_level: if cli.log_level != "info" { cli.log_level } else { file.log_level.unwrap_or(cli.log_level) },
        })
    }

    pub fn server_string(&self) -> String {
        format!(
            "{}/{} UPnP/1.0 MicroDLNA/{}",
            std::env::consts::OS,
            os_release(),
            env!("CARGO_PKG_VERSION"),
        )
    }
}

fn os_release() -> &'static str {
    "1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_string_includes_version() {
        let cfg = Config {
            media_dir: PathBuf::from("."),
            port: 2800,
            friendly_name: "x".into(),
            uuid_override: None,
            interfaces: None,
            notify_interval: 895,
            max_connections: 10,
            pid_file: None,
            uid: None,
            log_level: "info".into(),
        };
        assert!(cfg.server_string().contains(env!("CARGO_PKG_VERSION")));
    }
}
