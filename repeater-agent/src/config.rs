//! Configuration for the repeater agent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use repeater_lib::bus::{BusConfig, ReconnectPolicy};
use repeater_lib::certs::CertificateSource;
use repeater_lib::executor::{DEFAULT_WHITELIST_MIMES, HttpExecutorOptions};
use repeater_lib::headers::Headers;
use repeater_lib::scripts::SandboxConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure loaded from TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Control-plane credentials
    #[serde(default)]
    pub profile: ProfileConfig,
    /// Message bus settings
    #[serde(default)]
    pub bus: BusSettings,
    /// Request execution settings
    #[serde(default)]
    pub request: RequestConfig,
    /// Client and CA certificates by hostname
    #[serde(default)]
    pub certificates: Vec<CertificateSource>,
    /// Local scripts: hostname wildcard to script path
    #[serde(default)]
    pub scripts: BTreeMap<String, PathBuf>,
    /// Script sandbox settings
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileConfig {
    /// Control-plane hostname (e.g., "app.example.com")
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub repeater_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusSettings {
    /// gRPC endpoint. Defaults to `https://<cluster>:443`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Skip control-plane certificate verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: None,
            insecure: false,
            request_timeout_secs: default_request_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    /// Initial delay before reconnecting (seconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    /// Maximum delay between reconnection attempts (seconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Attempts before the repeater gives up and exits
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    20
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Response body limit in KB, -1 for unlimited
    #[serde(default = "default_max_content_length")]
    pub max_content_length: i64,
    #[serde(default = "default_whitelist_mimes")]
    pub whitelist_mimes: Vec<String>,
    /// SOCKS5 proxy for target connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub reuse_connection: bool,
    /// Headers added to every request
    #[serde(default)]
    pub headers: Headers,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_content_length() -> i64 {
    100
}

fn default_whitelist_mimes() -> Vec<String> {
    DEFAULT_WHITELIST_MIMES.iter().map(|m| m.to_string()).collect()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_content_length: default_max_content_length(),
            whitelist_mimes: default_whitelist_mimes(),
            proxy_url: None,
            reuse_connection: false,
            headers: Headers::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxSettings {
    /// Interpreter binary (default: "node")
    #[serde(default = "default_sandbox_program")]
    pub program: String,
    /// Interpreter arguments. Empty means the bundled harness.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_ms: u64,
}

fn default_sandbox_program() -> String {
    "node".to_string()
}

fn default_sandbox_timeout() -> u64 {
    10_000
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            program: default_sandbox_program(),
            args: Vec::new(),
            timeout_ms: default_sandbox_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rotated log files. Defaults to `<data dir>/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Default filter when RUST_LOG is unset (e.g., "info", "repeater_lib=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily log file next to stdout
    #[serde(default = "default_log_to_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
            file: default_log_to_file(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        // Expand ~ in paths
        for cert in &mut config.certificates {
            cert.path = expand_tilde(&cert.path);
        }
        for path in config.scripts.values_mut() {
            *path = expand_tilde(path);
        }
        if let Some(dir) = &mut config.logging.dir {
            *dir = expand_tilde(dir);
        }

        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that the profile is complete enough to connect.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let mut errors = Vec::new();

        if self.profile.cluster.is_empty() && self.bus.url.is_none() {
            errors.push("profile.cluster: Control-plane hostname (or --cluster)");
        }
        if self.profile.api_key.is_empty() {
            errors.push("profile.api_key: API key with repeater scopes (or --token)");
        }
        if self.profile.repeater_id.is_empty() {
            errors.push("profile.repeater_id: ID of this repeater (or --id)");
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "Configuration incomplete\n\nPlease edit {} and set:\n  - {}",
                path.display(),
                errors.join("\n  - ")
            )));
        }
        Ok(())
    }

    pub fn bus_url(&self) -> String {
        self.bus
            .url
            .clone()
            .unwrap_or_else(|| format!("https://{}:443", self.profile.cluster))
    }

    /// Base URL of the control plane's REST API.
    pub fn api_url(&self) -> String {
        let cluster = &self.profile.cluster;
        if cluster.starts_with("http://") || cluster.starts_with("https://") {
            format!("{}/", cluster.trim_end_matches('/'))
        } else {
            format!("https://{cluster}/")
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        let reconnect = &self.bus.reconnect;
        BusConfig {
            url: self.bus_url(),
            api_key: self.profile.api_key.clone(),
            repeater_id: self.profile.repeater_id.clone(),
            insecure: self.bus.insecure,
            request_timeout: Duration::from_secs(self.bus.request_timeout_secs),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_secs(reconnect.initial_delay_secs),
                max_delay: Duration::from_secs(reconnect.max_delay_secs),
                max_attempts: reconnect.max_attempts,
            },
        }
    }

    pub fn executor_options(&self) -> HttpExecutorOptions {
        HttpExecutorOptions {
            timeout: Duration::from_millis(self.request.timeout_ms),
            max_content_length: self.request.max_content_length,
            whitelist_mimes: self.request.whitelist_mimes.clone(),
            proxy_url: self.request.proxy_url.clone(),
            reuse_connection: self.request.reuse_connection,
            headers: self.request.headers.clone(),
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::node(self.sandbox.program.clone())
            .with_timeout(Duration::from_millis(self.sandbox.timeout_ms));
        if !self.sandbox.args.is_empty() {
            config.args = self.sandbox.args.clone();
        }
        config
    }

    /// Where rotated log files go.
    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("logs"))
    }

    /// Get the default configuration file path.
    ///
    /// - macOS: `~/Library/Application Support/repeater-agent/config.toml`
    /// - Linux: `~/.config/repeater-agent/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("repeater-agent")
            .join("config.toml")
    }

    /// Get the default data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("repeater-agent")
    }
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str()
        && path_str.starts_with("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(&path_str[2..]);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_tilde() {
        let path = Path::new("~/foo/bar");
        let expanded = expand_tilde(path);
        assert!(!expanded.to_string_lossy().contains('~'));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[profile]
cluster = "app.example.com"
api_key = "key"
repeater_id = "rep-1"

[bus]
insecure = true

[bus.reconnect]
max_attempts = 5

[request]
max_content_length = -1
proxy_url = "socks5://127.0.0.1:1080"

[request.headers]
X-Scanner = "repeater"

[[certificates]]
path = "/etc/repeater/client.pfx"
hostname = "*.corp"
passphrase = "secret"

[scripts]
"*.corp" = "/etc/repeater/rewrite.js"

[logging]
dir = "/var/log/repeater"
level = "repeater_lib=debug"
"#;

        let config: Config = toml::from_str(toml).expect("Failed to parse config");
        assert_eq!(config.bus_url(), "https://app.example.com:443");
        assert!(config.bus.insecure);
        assert_eq!(config.bus.request_timeout_secs, 30);
        assert_eq!(config.bus.reconnect.max_attempts, 5);
        assert_eq!(config.bus.reconnect.initial_delay_secs, 1);
        assert_eq!(config.request.max_content_length, -1);
        assert_eq!(config.request.timeout_ms, 30_000);
        assert_eq!(config.request.headers.get("x-scanner"), Some("repeater"));
        assert_eq!(config.certificates.len(), 1);
        assert_eq!(config.certificates[0].passphrase.as_deref(), Some("secret"));
        assert_eq!(config.scripts.len(), 1);
        assert_eq!(config.sandbox.program, "node");
        assert_eq!(config.api_url(), "https://app.example.com/");
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/repeater"));
        assert_eq!(config.logging.level, "repeater_lib=debug");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.request.max_content_length, 100);
        assert!(config.request.whitelist_mimes.contains(&"application/json".to_string()));
        assert_eq!(config.bus.reconnect.max_delay_secs, 60);
        assert_eq!(config.sandbox.timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file);
        assert_eq!(config.log_dir(), Config::default_data_dir().join("logs"));

        let options = config.executor_options();
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(!options.reuse_connection);
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let config = Config::default();
        let err = config.validate(Path::new("config.toml")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("profile.api_key"));
        assert!(message.contains("profile.repeater_id"));
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(Config::load_or_default(&missing).unwrap().profile.api_key.is_empty());

        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[profile]\napi_key = \"abc\"").unwrap();
        assert_eq!(Config::load_or_default(&path).unwrap().profile.api_key, "abc");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.profile.cluster = "app.example.com".to_string();
        config.profile.repeater_id = "rep-9".to_string();
        config.request.headers.append("X-Trace", "1");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.profile.repeater_id, "rep-9");
        assert_eq!(loaded.request.headers.get("x-trace"), Some("1"));
        assert!(loaded.validate(&path).is_err());
    }
}
