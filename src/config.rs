//! Configuration loading for obs-mcp.
//!
//! Each setting is resolved from the first source that provides it:
//!
//! 1. **CLI flags**: `--url`, `--password`, `--log-level`
//! 2. **JSON file** via `--config <path>` or the `OBS_MCP_CONFIG` environment
//!    variable
//! 3. **Environment variables**: `OBS_WEBSOCKET_URL`, `OBS_WEBSOCKET_PASSWORD`
//! 4. **Defaults**: `ws://localhost:4455`, no password
//!
//! See `obs-mcp.example.json` for the file format.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientOptions, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_URL};
use crate::correlator::DEFAULT_REQUEST_TIMEOUT;
use crate::protocol::EventSubscription;

const DEFAULT_LOG_LEVEL: &str = "info";

/// CLI arguments parsed by `clap`.
#[derive(Parser, Debug, Default)]
#[command(name = "obs-mcp", about = "MCP server for OBS Studio over obs-websocket")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// obs-websocket URL, e.g. ws://localhost:4455
    #[arg(long)]
    pub url: Option<String>,

    /// obs-websocket server password
    #[arg(long)]
    pub password: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "info", "obs_mcp=debug")
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Raw JSON config file structure. Every key is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub url: Option<String>,
    pub password: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    /// Category names such as `"Scenes"` or `"All"`.
    pub event_subscriptions: Option<Vec<String>>,
    pub log_level: Option<String>,
}

/// Environment variables consulted after the config file.
#[derive(Debug, Default)]
pub struct EnvConfig {
    pub url: Option<String>,
    pub password: Option<String>,
}

impl EnvConfig {
    fn from_env() -> Self {
        Self {
            url: std::env::var("OBS_WEBSOCKET_URL").ok(),
            password: std::env::var("OBS_WEBSOCKET_PASSWORD").ok(),
        }
    }
}

/// Validated configuration ready for the client and logger.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub url: String,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub event_subscriptions: EventSubscription,
    pub log_level: String,
}

impl ResolvedConfig {
    pub fn to_client_options(&self) -> ClientOptions {
        ClientOptions {
            url: self.url.clone(),
            password: self.password.clone(),
            event_subscriptions: self.event_subscriptions,
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

/// Load and validate configuration from CLI args, config file, and env vars.
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, String> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("OBS_MCP_CONFIG").ok().map(PathBuf::from));
    let file = match path {
        Some(path) => Some(load_file(&expand_tilde(&path))?),
        None => None,
    };
    resolve(cli, file.unwrap_or_default(), EnvConfig::from_env())
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn load_file(path: &Path) -> Result<FileConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
}

/// Merge the three sources and validate the result.
pub fn resolve(cli: &Cli, file: FileConfig, env: EnvConfig) -> Result<ResolvedConfig, String> {
    let url = cli
        .url
        .clone()
        .or(file.url)
        .or(env.url)
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    validate_url(&url)?;

    // An empty password anywhere means "no password".
    let password = cli
        .password
        .clone()
        .or(file.password)
        .or(env.password)
        .filter(|p| !p.is_empty());

    let request_timeout = timeout_from_ms(
        "request_timeout_ms",
        file.request_timeout_ms,
        DEFAULT_REQUEST_TIMEOUT,
    )?;
    let handshake_timeout = timeout_from_ms(
        "handshake_timeout_ms",
        file.handshake_timeout_ms,
        DEFAULT_HANDSHAKE_TIMEOUT,
    )?;

    let event_subscriptions = match file.event_subscriptions {
        Some(names) => EventSubscription::from_names(&names)?,
        None => EventSubscription::ALL,
    };

    let log_level = cli
        .log_level
        .clone()
        .or(file.log_level)
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    Ok(ResolvedConfig {
        url,
        password,
        request_timeout,
        handshake_timeout,
        event_subscriptions,
        log_level,
    })
}

fn validate_url(url: &str) -> Result<(), String> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(format!("Invalid url '{url}': expected ws://host:port"));
    };
    if !scheme.eq_ignore_ascii_case("ws") && !scheme.eq_ignore_ascii_case("wss") {
        return Err(format!("Invalid url '{url}': scheme must be ws or wss"));
    }
    if rest.is_empty() {
        return Err(format!("Invalid url '{url}': missing host"));
    }
    Ok(())
}

fn timeout_from_ms(key: &str, ms: Option<u64>, default: Duration) -> Result<Duration, String> {
    match ms {
        None => Ok(default),
        Some(0) => Err(format!("{key} must be greater than 0")),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(json: &str) -> FileConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let c = resolve(&Cli::default(), FileConfig::default(), EnvConfig::default()).unwrap();
        assert_eq!(c.url, "ws://localhost:4455");
        assert_eq!(c.password, None);
        assert_eq!(c.request_timeout, Duration::from_secs(10));
        assert_eq!(c.handshake_timeout, Duration::from_secs(5));
        assert_eq!(c.event_subscriptions, EventSubscription::ALL);
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn cli_beats_file_beats_env() {
        let env = EnvConfig {
            url: Some("ws://env:1".into()),
            password: Some("env-pass".into()),
        };
        let f = file(r#"{"url": "ws://file:2", "log_level": "debug"}"#);
        let cli = Cli {
            password: Some("cli-pass".into()),
            ..Cli::default()
        };

        let c = resolve(&cli, f, env).unwrap();
        assert_eq!(c.url, "ws://file:2");
        assert_eq!(c.password.as_deref(), Some("cli-pass"));
        assert_eq!(c.log_level, "debug");
    }

    #[test]
    fn env_used_when_file_is_silent() {
        let env = EnvConfig {
            url: Some("wss://obs.local:4455".into()),
            password: Some("hunter2".into()),
        };
        let c = resolve(&Cli::default(), FileConfig::default(), env).unwrap();
        assert_eq!(c.url, "wss://obs.local:4455");
        assert_eq!(c.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn empty_password_means_none() {
        let f = file(r#"{"password": ""}"#);
        let c = resolve(&Cli::default(), f, EnvConfig::default()).unwrap();
        assert_eq!(c.password, None);
    }

    #[test]
    fn file_settings_flow_into_client_options() {
        let f = file(
            r#"{
                "request_timeout_ms": 2500,
                "handshake_timeout_ms": 1000,
                "event_subscriptions": ["Scenes", "Outputs"]
            }"#,
        );
        let opts = resolve(&Cli::default(), f, EnvConfig::default())
            .unwrap()
            .to_client_options();
        assert_eq!(opts.request_timeout, Duration::from_millis(2500));
        assert_eq!(opts.handshake_timeout, Duration::from_millis(1000));
        assert_eq!(
            opts.event_subscriptions,
            EventSubscription::SCENES | EventSubscription::OUTPUTS
        );
    }

    #[test]
    fn rejects_bad_values() {
        let cli = Cli {
            url: Some("http://localhost:4455".into()),
            ..Cli::default()
        };
        let err = resolve(&cli, FileConfig::default(), EnvConfig::default()).unwrap_err();
        assert!(err.contains("scheme"));

        let err = resolve(
            &Cli::default(),
            file(r#"{"url": "localhost:4455"}"#),
            EnvConfig::default(),
        )
        .unwrap_err();
        assert!(err.contains("Invalid url"));

        let err = resolve(
            &Cli::default(),
            file(r#"{"event_subscriptions": ["Scenes", "Bogus"]}"#),
            EnvConfig::default(),
        )
        .unwrap_err();
        assert!(err.contains("Bogus"));

        let err = resolve(
            &Cli::default(),
            file(r#"{"request_timeout_ms": 0}"#),
            EnvConfig::default(),
        )
        .unwrap_err();
        assert!(err.contains("request_timeout_ms"));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(serde_json::from_str::<FileConfig>(r#"{"devices": {}}"#).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_file(Path::new("/nonexistent/obs-mcp.json")).unwrap_err();
        assert!(err.contains("/nonexistent/obs-mcp.json"));
    }
}
