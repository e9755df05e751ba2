//! Configuration management for the VpnPilot daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/vpnpilot/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::CredentialType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("client binary must not be empty")]
    EmptyClientBinary,

    #[error("client binary not found: {0}")]
    ClientBinaryNotFound(String),

    #[error("disconnect_grace_secs must be between 1 and 300, got {0}")]
    InvalidDisconnectGrace(u64),

    #[error("kill_timeout_secs must be between 1 and 300, got {0}")]
    InvalidKillTimeout(u64),

    #[error("credential_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidCredentialTimeout(u64),

    #[error("prompt_flush_ms must be between 10 and 5000, got {0}")]
    InvalidPromptFlush(u64),

    #[error("invalid monitor rule pattern {pattern:?}: {reason}")]
    InvalidRulePattern { pattern: String, reason: String },

    #[error("auth_request rule {0:?} must name a credential type")]
    MissingCredentialType(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the VpnPilot daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// External VPN client invocation.
    pub client: ClientConfig,

    /// Session lifecycle timing.
    pub session: SessionConfig,

    /// Profile import behavior.
    pub profiles: ProfilesConfig,

    /// Output monitoring and classification.
    pub monitor: MonitorConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the profile registry and copied profiles.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file that receives a copy of the daemon log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// How the external VPN client is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Client executable, either absolute or looked up in `PATH`.
    pub binary: String,

    /// Command prepended to the client invocation (e.g. `sudo -n`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privilege_wrapper: Option<String>,

    /// Arguments appended after `--config <path>`.
    pub extra_args: Vec<String>,
}

/// Session lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for the client to exit after SIGTERM.
    pub disconnect_grace_secs: u64,

    /// Seconds to wait for the client to exit after SIGKILL.
    pub kill_timeout_secs: u64,

    /// Seconds a credential prompt may stay unanswered.
    pub credential_timeout_secs: u64,
}

/// Profile import behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Copy imported files into the data directory instead of
    /// referencing them in place.
    pub copy_on_import: bool,
}

/// Output monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Milliseconds of silence after which a partial line is emitted.
    pub prompt_flush_ms: u64,

    /// Classification rules. A non-empty list replaces the built-in table.
    pub rules: Vec<RuleConfig>,
}

/// What a matching line means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleClass {
    /// Tunnel initialization completed.
    Connected,
    /// The server rejected the credentials.
    AuthFailed,
    /// The client waits for a credential on stdin.
    AuthRequest,
    /// Any other unrecoverable error.
    Fatal,
    /// Informational line carrying a tunnel endpoint in the named capture
    /// groups `remote` or `local`.
    Address,
}

/// One entry of the classification table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleConfig {
    /// Rule class.
    pub class: RuleClass,

    /// Regular expression matched against each line. Named groups `remote`
    /// and `local` capture tunnel addresses on a rule of any class.
    pub pattern: String,

    /// Requested credential, required for `auth_request` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialType>,
}

impl RuleConfig {
    fn new(class: RuleClass, pattern: &str) -> Self {
        Self {
            class,
            pattern: pattern.to_string(),
            credential: None,
        }
    }

    fn prompt(pattern: &str, credential: CredentialType) -> Self {
        Self {
            class: RuleClass::AuthRequest,
            pattern: pattern.to_string(),
            credential: Some(credential),
        }
    }
}

/// Built-in classification table for OpenVPN 2.x output.
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig::new(RuleClass::Connected, "Initialization Sequence Completed"),
        RuleConfig::new(RuleClass::AuthFailed, "AUTH_FAILED"),
        RuleConfig::new(RuleClass::AuthFailed, "auth-failure"),
        RuleConfig::prompt("Enter Auth Username", CredentialType::Username),
        RuleConfig::prompt("Enter Auth Password", CredentialType::Password),
        RuleConfig::prompt(
            "Enter Private Key Password",
            CredentialType::PrivateKeyPassphrase,
        ),
        RuleConfig::prompt("CHALLENGE:", CredentialType::Challenge),
        RuleConfig::new(RuleClass::Fatal, "Exiting due to fatal error"),
        RuleConfig::new(RuleClass::Fatal, "^Options error:"),
        RuleConfig::new(RuleClass::Fatal, "Cannot open TUN/TAP dev"),
        RuleConfig::new(RuleClass::Fatal, "Cannot load (CA|certificate|private key)"),
        RuleConfig::new(
            RuleClass::Address,
            r"Peer Connection Initiated with \[AF_INET\](?P<remote>\d{1,3}(?:\.\d{1,3}){3})",
        ),
        RuleConfig::new(
            RuleClass::Address,
            r"net_addr_v4_add: (?P<local>\d{1,3}(?:\.\d{1,3}){3})",
        ),
        RuleConfig::new(
            RuleClass::Address,
            r"ip addr add dev \S+ (?:local )?(?P<local>\d{1,3}(?:\.\d{1,3}){3})",
        ),
        RuleConfig::new(
            RuleClass::Address,
            r"ifconfig \S+ (?P<local>\d{1,3}(?:\.\d{1,3}){3})",
        ),
    ]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: "openvpn".to_string(),
            privilege_wrapper: None,
            extra_args: vec![
                "--auth-retry".to_string(),
                "none".to_string(),
                "--verb".to_string(),
                "3".to_string(),
            ],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_secs: 5,
            kill_timeout_secs: 5,
            credential_timeout_secs: 120,
        }
    }
}

impl SessionConfig {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            prompt_flush_ms: 200,
            rules: default_rules(),
        }
    }
}

impl MonitorConfig {
    pub fn prompt_flush(&self) -> Duration {
        Duration::from_millis(self.prompt_flush_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vpnpilot")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vpnpilot")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - VPNPILOT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - VPNPILOT_CLIENT_BINARY: Override the VPN client executable
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("VPNPILOT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(log_level = %level, "Overriding log_level from environment");
                self.daemon.log_level = level;
            }
        }

        if let Ok(binary) = std::env::var("VPNPILOT_CLIENT_BINARY") {
            if !binary.is_empty() {
                tracing::info!(binary = %binary, "Overriding client binary from environment");
                self.client.binary = binary;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Checks ranges, the log level and the classification rules. The
    /// client binary is checked separately by [`Config::check_client_binary`]
    /// because it depends on the host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.client.binary.trim().is_empty() {
            return Err(ConfigError::EmptyClientBinary);
        }

        let session = &self.session;
        if !(1..=300).contains(&session.disconnect_grace_secs) {
            return Err(ConfigError::InvalidDisconnectGrace(
                session.disconnect_grace_secs,
            ));
        }
        if !(1..=300).contains(&session.kill_timeout_secs) {
            return Err(ConfigError::InvalidKillTimeout(session.kill_timeout_secs));
        }
        if !(1..=3600).contains(&session.credential_timeout_secs) {
            return Err(ConfigError::InvalidCredentialTimeout(
                session.credential_timeout_secs,
            ));
        }

        if !(10..=5000).contains(&self.monitor.prompt_flush_ms) {
            return Err(ConfigError::InvalidPromptFlush(self.monitor.prompt_flush_ms));
        }

        for rule in &self.monitor.rules {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                return Err(ConfigError::InvalidRulePattern {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                });
            }
            if rule.class == RuleClass::AuthRequest && rule.credential.is_none() {
                return Err(ConfigError::MissingCredentialType(rule.pattern.clone()));
            }
        }

        Ok(())
    }

    /// Check that the client binary (and privilege wrapper, if any) can be
    /// found on this host.
    pub fn check_client_binary(&self) -> Result<(), ConfigError> {
        let mut programs = vec![self.client.binary.as_str()];
        if let Some(wrapper) = &self.client.privilege_wrapper {
            if let Some(program) = wrapper.split_whitespace().next() {
                programs.push(program);
            }
        }

        for program in programs {
            let path = Path::new(program);
            let found = if path.is_absolute() {
                path.exists()
            } else {
                which::which(program).is_ok()
            };
            if !found {
                return Err(ConfigError::ClientBinaryNotFound(program.to_string()));
            }
        }

        Ok(())
    }

    /// Path of the persisted profile registry.
    pub fn registry_path(&self) -> PathBuf {
        self.daemon.data_dir.join("profiles.json")
    }

    /// Directory receiving copies of imported profiles.
    pub fn profiles_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("profiles")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/vpnpilot/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_file.is_none());
        assert_eq!(config.client.binary, "openvpn");
        assert!(config.client.privilege_wrapper.is_none());
        assert_eq!(
            config.client.extra_args,
            vec!["--auth-retry", "none", "--verb", "3"]
        );
        assert_eq!(config.session.disconnect_grace_secs, 5);
        assert_eq!(config.session.kill_timeout_secs, 5);
        assert_eq!(config.session.credential_timeout_secs, 120);
        assert!(!config.profiles.copy_on_import);
        assert_eq!(config.monitor.prompt_flush_ms, 200);
        assert_eq!(config.monitor.rules, default_rules());
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("vpnpilot"));
    }

    #[test]
    fn test_registry_paths_follow_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/var/lib/vpnpilot");
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/var/lib/vpnpilot/profiles.json")
        );
        assert_eq!(
            config.profiles_dir(),
            PathBuf::from("/var/lib/vpnpilot/profiles")
        );
    }

    #[test]
    fn test_session_durations() {
        let config = SessionConfig::default();
        assert_eq!(config.disconnect_grace(), Duration::from_secs(5));
        assert_eq!(config.kill_timeout(), Duration::from_secs(5));
        assert_eq!(config.credential_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_default_rules_cover_every_class() {
        let rules = default_rules();
        for class in [
            RuleClass::Connected,
            RuleClass::AuthFailed,
            RuleClass::AuthRequest,
            RuleClass::Fatal,
            RuleClass::Address,
        ] {
            assert!(rules.iter().any(|r| r.class == class), "{:?}", class);
        }
        assert!(rules
            .iter()
            .filter(|r| r.class == RuleClass::AuthRequest)
            .all(|r| r.credential.is_some()));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
credential_timeout_secs = 30
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.credential_timeout_secs, 30);
        assert_eq!(config.session.disconnect_grace_secs, 5);
        assert_eq!(config.client.binary, "openvpn");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"
log_file = "/var/log/vpnpilot.log"

[client]
binary = "/usr/sbin/openvpn"
privilege_wrapper = "sudo -n"
extra_args = ["--verb", "4"]

[session]
disconnect_grace_secs = 10
kill_timeout_secs = 2
credential_timeout_secs = 60

[profiles]
copy_on_import = true

[monitor]
prompt_flush_ms = 500

[[monitor.rules]]
class = "connected"
pattern = "Tunnel up"

[[monitor.rules]]
class = "auth_request"
pattern = "Enter OTP"
credential = "challenge"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.daemon.log_file,
            Some(PathBuf::from("/var/log/vpnpilot.log"))
        );
        assert_eq!(config.client.binary, "/usr/sbin/openvpn");
        assert_eq!(config.client.privilege_wrapper.as_deref(), Some("sudo -n"));
        assert_eq!(config.client.extra_args, vec!["--verb", "4"]);
        assert_eq!(config.session.disconnect_grace_secs, 10);
        assert_eq!(config.session.kill_timeout_secs, 2);
        assert_eq!(config.session.credential_timeout_secs, 60);
        assert!(config.profiles.copy_on_import);
        assert_eq!(config.monitor.prompt_flush_ms, 500);
        assert_eq!(config.monitor.rules.len(), 2);
        assert_eq!(config.monitor.rules[0].class, RuleClass::Connected);
        assert_eq!(
            config.monitor.rules[1].credential,
            Some(CredentialType::Challenge)
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
kill_timeout_secs = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_rule_class() {
        let toml = r#"
[[monitor.rules]]
class = "maybe"
pattern = "x"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[client]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[profiles]"));
        assert!(toml.contains("[monitor]"));
        assert!(toml.contains("[[monitor.rules]]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.daemon.log_file = Some(PathBuf::from("/tmp/vpnpilot.log"));
        original.client.privilege_wrapper = Some("doas".to_string());
        original.profiles.copy_on_import = true;
        original.monitor.rules.truncate(3);

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.credential_timeout_secs = 15;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("vpnpilot"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("VPNPILOT_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("VPNPILOT_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_client_binary() {
        std::env::set_var("VPNPILOT_CLIENT_BINARY", "/opt/openvpn/sbin/openvpn");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.client.binary, "/opt/openvpn/sbin/openvpn");

        std::env::remove_var("VPNPILOT_CLIENT_BINARY");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("VPNPILOT_LOG_LEVEL", "");
        std::env::set_var("VPNPILOT_CLIENT_BINARY", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("VPNPILOT_LOG_LEVEL");
        std::env::remove_var("VPNPILOT_CLIENT_BINARY");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("VPNPILOT_LOG_LEVEL");
        std::env::remove_var("VPNPILOT_CLIENT_BINARY");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_empty_binary() {
        let mut config = Config::default();
        config.client.binary = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyClientBinary));
    }

    #[test]
    fn test_validate_timing_ranges() {
        let mut config = Config::default();
        config.session.disconnect_grace_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidDisconnectGrace(0)));

        let mut config = Config::default();
        config.session.kill_timeout_secs = 301;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKillTimeout(301)));

        let mut config = Config::default();
        config.session.credential_timeout_secs = 3601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCredentialTimeout(3601))
        );

        let mut config = Config::default();
        config.monitor.prompt_flush_ms = 5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPromptFlush(5)));
    }

    #[test]
    fn test_validate_boundary_values() {
        let mut config = Config::default();
        config.session.disconnect_grace_secs = 1;
        config.session.kill_timeout_secs = 300;
        config.session.credential_timeout_secs = 3600;
        config.monitor.prompt_flush_ms = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = Config::default();
        config
            .monitor
            .rules
            .push(RuleConfig::new(RuleClass::Fatal, "Cannot (open"));
        match config.validate() {
            Err(ConfigError::InvalidRulePattern { pattern, .. }) => {
                assert_eq!(pattern, "Cannot (open");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_requires_credential_type() {
        let mut config = Config::default();
        config
            .monitor
            .rules
            .push(RuleConfig::new(RuleClass::AuthRequest, "Enter PIN"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingCredentialType("Enter PIN".to_string()))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_check_client_binary() {
        let mut config = Config::default();
        config.client.binary = "/bin/sh".to_string();
        assert!(config.check_client_binary().is_ok());

        config.client.binary = "sh".to_string();
        assert!(config.check_client_binary().is_ok());

        config.client.binary = "/nonexistent/openvpn".to_string();
        assert_eq!(
            config.check_client_binary(),
            Err(ConfigError::ClientBinaryNotFound(
                "/nonexistent/openvpn".to_string()
            ))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_check_privilege_wrapper() {
        let mut config = Config::default();
        config.client.binary = "/bin/sh".to_string();
        config.client.privilege_wrapper = Some("nonexistent_wrapper_xyz -n".to_string());
        assert_eq!(
            config.check_client_binary(),
            Err(ConfigError::ClientBinaryNotFound(
                "nonexistent_wrapper_xyz".to_string()
            ))
        );
    }
}
