//! Server configuration loading from file and environment variables.

use crate::connection::ConnectionSettings;
use crate::pipeline::PipelineConfig;
use echome_llm::{LlmConfig, SearchConfig};
use echome_types::Character;
use echome_voice::{AsrConfig, TtsConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
///
/// Built once at start-up and handed by reference to every adapter
/// constructor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Credentials shared by the chat, recognition and synthesis upstreams.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub asr: AsrConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    /// Client socket write queue and heartbeat.
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Characters served by the built-in lookup.
    #[serde(default)]
    pub characters: Vec<Character>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "echome_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `ECHOME_HOST` overrides `server.host`
/// - `ECHOME_PORT` overrides `server.port`
/// - `ECHOME_LOG_LEVEL` overrides `logging.level`
/// - `ECHOME_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `ECHOME_API_KEY` overrides `upstream.api_key`
/// - `ECHOME_TAVILY_API_KEY` overrides `search.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("ECHOME_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("ECHOME_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("ECHOME_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("ECHOME_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(key) = var("ECHOME_API_KEY") {
        config.upstream.api_key = key;
    }
    if let Some(key) = var("ECHOME_TAVILY_API_KEY") {
        config.search.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echome_voice::TtsProtocol;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pipeline.handoff_capacity, 100);
        assert_eq!(config.connection.queue_capacity, 100);
        assert_eq!(config.llm.timeout_secs, 30);
        assert!(config.characters.is_empty());
    }

    #[test]
    fn parses_sections_and_characters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9100

[llm]
model = "qwen-max"
timeout_secs = 10

[llm.retry]
max_retries = 1

[tts.default]
model = "qwen3-tts-flash-realtime"
voice = "Cherry"
protocol = "session-update"
mode = "commit"

[pipeline]
segment_min_chars = 20

[[characters]]
id = "6f9619ff-8b86-d011-b42d-00c04fc964ff"
name = "Captain"
persona = "A retired sea captain."
voice_id = "echome-captain"
uses_cloned_voice = true
status = "approved"
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.llm.model, "qwen-max");
        assert_eq!(config.llm.retry.max_retries, 1);
        assert_eq!(config.tts.default.voice, "Cherry");
        assert_eq!(config.tts.default.protocol, TtsProtocol::SessionUpdate);
        assert_eq!(config.tts.cloned.model, "cosyvoice-v2");
        assert_eq!(config.pipeline.segment_min_chars, 20);
        assert_eq!(config.pipeline.handoff_capacity, 100);
        assert_eq!(config.characters.len(), 1);
        assert_eq!(config.characters[0].cloned_voice(), Some("echome-captain"));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let vars: HashMap<&str, &str> = [
            ("ECHOME_PORT", "7000"),
            ("ECHOME_HOST", "not-an-ip"),
            ("ECHOME_LOG_JSON", "1"),
            ("ECHOME_API_KEY", "sk-env"),
            ("ECHOME_TAVILY_API_KEY", "tvly-env"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, default_host());
        assert!(config.logging.json);
        assert_eq!(config.upstream.api_key, "sk-env");
        assert!(config.search.is_enabled());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = Config::default();
        config.upstream.api_key = "sk-secret".into();
        config.search.api_key = "tvly-secret".into();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("tvly-secret"));
    }
}
