use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Bearer token remote callers must present. If empty, a temporary token
    /// is generated at startup and printed (NOT saved).
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Enables `navigate` and `write` tier commands.
    #[serde(default)]
    pub allow_write: bool,
    /// Enables `sensitive` tier commands.
    #[serde(default)]
    pub allow_sensitive: bool,
    #[serde(default)]
    pub disable_confirmation: bool,
    /// Return sensitive results without masking token-like values.
    #[serde(default)]
    pub expose_sensitive: bool,
    /// Comma-separated host list, e.g. "example.com, github.com".
    #[serde(default)]
    pub allowed_domains: String,
    /// Audit log file. Defaults to a daily file under `~/.domshell/audit`.
    #[serde(default)]
    pub audit_log: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18795
}

fn default_command_timeout() -> u64 {
    30
}

fn default_confirm_timeout() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            auth_token: None,
            allow_write: false,
            allow_sensitive: false,
            disable_confirmation: false,
            expose_sensitive: false,
            allowed_domains: String::new(),
            audit_log: None,
            command_timeout_secs: default_command_timeout(),
            confirm_timeout_secs: default_confirm_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Parsed allowlist; empty means unrestricted.
    pub fn allowed_domains(&self) -> Vec<String> {
        self.allowed_domains
            .split(',')
            .map(|d| d.trim().trim_start_matches("*.").trim_end_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_debug_host")]
    pub debug_host: String,
    /// Chrome remote debugging port (`--remote-debugging-port`).
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    /// Upper bound for navigate-and-wait; the kernel proceeds anyway once it elapses.
    #[serde(default = "default_navigate_timeout")]
    pub navigate_timeout_secs: u64,
    #[serde(default = "default_reconnect_max_backoff")]
    pub reconnect_max_backoff_secs: u64,
}

fn default_debug_host() -> String {
    "127.0.0.1".to_string()
}

fn default_debug_port() -> u16 {
    9222
}

fn default_navigate_timeout() -> u64 {
    15
}

fn default_reconnect_max_backoff() -> u64 {
    30
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_host: default_debug_host(),
            debug_port: default_debug_port(),
            navigate_timeout_secs: default_navigate_timeout(),
            reconnect_max_backoff_secs: default_reconnect_max_backoff(),
        }
    }
}

impl BrowserConfig {
    /// Base URL of the DevTools HTTP endpoint (`/json/version`, `/json/list`).
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.debug_host, self.debug_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        if let Ok(token) = std::env::var("DOMSHELL_TOKEN") {
            if !token.trim().is_empty() {
                config.gateway.auth_token = Some(token.trim().to_string());
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Explicit audit log file, if one is configured.
    pub fn audit_destination(&self) -> Option<PathBuf> {
        self.gateway
            .audit_log
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.gateway.port, 18795);
        assert!(!cfg.gateway.allow_write);
        assert_eq!(cfg.browser.navigate_timeout_secs, 15);
        assert!(cfg.gateway.allowed_domains().is_empty());
    }

    #[test]
    fn test_allowed_domains_parsing() {
        let raw = r#"{ "gateway": { "allowedDomains": " Example.com, *.github.com ,, " } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.gateway.allowed_domains(), vec!["example.com", "github.com"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.gateway.allow_write = true;
        cfg.gateway.audit_log = Some("/tmp/audit.jsonl".into());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.gateway.allow_write);
        assert_eq!(
            loaded.audit_destination(),
            Some(PathBuf::from("/tmp/audit.jsonl"))
        );
    }
}
