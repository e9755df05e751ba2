//! Line classification for VPN client output.
//!
//! A [`Classifier`] holds a compiled table of regex rules. Rules are checked
//! by class priority (connected, then auth failure, then credential prompt,
//! then other fatal errors) and, within a class, in table order. The first
//! match decides the [`LogKind`]; lines matching nothing are `Info`.
//! Address rules come last and only pull tunnel endpoints out of otherwise
//! informational lines.

use protocol::{ErrorKind, LogKind, TunnelAddresses};
use regex::{Captures, Regex};
use thiserror::Error;

use crate::config::{default_rules, MonitorConfig, RuleClass, RuleConfig};

/// Prefix of the fatal-error detail produced for authentication failures.
pub const AUTH_FAILED_DETAIL: &str = "auth failed";

/// Errors raised while compiling a rule table.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("auth_request rule {0:?} has no credential type")]
    MissingCredentialType(String),
}

/// Result of classifying one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Kind recorded on the log event.
    pub kind: LogKind,
    /// Failure the line implies for the session, if any.
    pub failure: Option<ErrorKind>,
    /// Tunnel endpoints captured from the line.
    pub tunnel: TunnelAddresses,
}

impl Classified {
    fn info() -> Self {
        Self::new(LogKind::Info, None)
    }

    fn new(kind: LogKind, failure: Option<ErrorKind>) -> Self {
        Self {
            kind,
            failure,
            tunnel: TunnelAddresses::default(),
        }
    }
}

fn capture_tunnel(captures: &Captures<'_>) -> TunnelAddresses {
    let group = |name: &str| captures.name(name).map(|m| m.as_str().to_string());
    TunnelAddresses {
        remote_address: group("remote"),
        local_address: group("local"),
    }
}

struct CompiledRule {
    class: RuleClass,
    regex: Regex,
    credential: Option<protocol::CredentialType>,
}

/// Compiled classification table.
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

fn priority(class: RuleClass) -> u8 {
    match class {
        RuleClass::Connected => 0,
        RuleClass::AuthFailed => 1,
        RuleClass::AuthRequest => 2,
        RuleClass::Fatal => 3,
        RuleClass::Address => 4,
    }
}

impl Classifier {
    /// Compiles a rule table.
    pub fn new(rules: &[RuleConfig]) -> Result<Self, ClassifierError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.pattern).map_err(|source| {
                ClassifierError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    source,
                }
            })?;
            if rule.class == RuleClass::AuthRequest && rule.credential.is_none() {
                return Err(ClassifierError::MissingCredentialType(rule.pattern.clone()));
            }
            compiled.push(CompiledRule {
                class: rule.class,
                regex,
                credential: rule.credential,
            });
        }
        // Stable, so table order is kept within a class.
        compiled.sort_by_key(|r| priority(r.class));
        Ok(Self { rules: compiled })
    }

    /// Compiles the rules from the monitor configuration, falling back to
    /// the built-in OpenVPN table when none are configured.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, ClassifierError> {
        if config.rules.is_empty() {
            Self::openvpn()
        } else {
            Self::new(&config.rules)
        }
    }

    /// The built-in table for OpenVPN 2.x.
    pub fn openvpn() -> Result<Self, ClassifierError> {
        Self::new(&default_rules())
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classifies one line of output.
    pub fn classify(&self, line: &str) -> Classified {
        let Some((rule, captures)) = self
            .rules
            .iter()
            .find_map(|r| r.regex.captures(line).map(|c| (r, c)))
        else {
            return Classified::info();
        };

        let mut classified = match rule.class {
            RuleClass::Connected => Classified::new(LogKind::ConnectedMarker, None),
            RuleClass::AuthFailed => Classified::new(
                LogKind::FatalError(format!("{}: {}", AUTH_FAILED_DETAIL, line.trim())),
                Some(ErrorKind::AuthFailed),
            ),
            RuleClass::AuthRequest => match rule.credential {
                Some(credential) => Classified::new(LogKind::AuthRequest(credential), None),
                None => Classified::info(),
            },
            RuleClass::Fatal => Classified::new(
                LogKind::FatalError(line.trim().to_string()),
                Some(ErrorKind::UnexpectedTermination),
            ),
            RuleClass::Address => Classified::info(),
        };
        classified.tunnel = capture_tunnel(&captures);
        classified
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::CredentialType;

    fn classifier() -> Classifier {
        Classifier::openvpn().unwrap()
    }

    #[test]
    fn test_connected_marker() {
        let c = classifier().classify(
            "2024-01-01 12:00:00 Initialization Sequence Completed",
        );
        assert_eq!(c.kind, LogKind::ConnectedMarker);
        assert_eq!(c.failure, None);
    }

    #[test]
    fn test_auth_failed() {
        let line = "AUTH: Received control message: AUTH_FAILED";
        let c = classifier().classify(line);
        match c.kind {
            LogKind::FatalError(detail) => {
                assert!(detail.starts_with(AUTH_FAILED_DETAIL));
                assert!(detail.contains("AUTH_FAILED"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        assert_eq!(c.failure, Some(ErrorKind::AuthFailed));
    }

    #[test]
    fn test_auth_failure_wording_variant() {
        let c = classifier().classify("SIGTERM[soft,auth-failure] received, process exiting");
        assert_eq!(c.failure, Some(ErrorKind::AuthFailed));
    }

    #[test]
    fn test_credential_prompts() {
        let c = classifier();
        assert_eq!(
            c.classify("Enter Auth Username:").kind,
            LogKind::AuthRequest(CredentialType::Username)
        );
        assert_eq!(
            c.classify("Enter Auth Password:").kind,
            LogKind::AuthRequest(CredentialType::Password)
        );
        assert_eq!(
            c.classify("Enter Private Key Password:").kind,
            LogKind::AuthRequest(CredentialType::PrivateKeyPassphrase)
        );
        assert_eq!(
            c.classify("CHALLENGE: Enter Google Authenticator Code").kind,
            LogKind::AuthRequest(CredentialType::Challenge)
        );
    }

    #[test]
    fn test_fatal_markers() {
        let c = classifier();
        for line in [
            "Exiting due to fatal error",
            "Options error: --ca fails with 'ca.crt': No such file",
            "ERROR: Cannot open TUN/TAP dev /dev/net/tun: No such device",
            "Cannot load certificate file client.crt",
        ] {
            let result = c.classify(line);
            assert_eq!(result.kind, LogKind::FatalError(line.to_string()), "{}", line);
            assert_eq!(result.failure, Some(ErrorKind::UnexpectedTermination));
        }
    }

    #[test]
    fn test_anchored_pattern() {
        let c = classifier().classify("note: Options error: appears mid-line");
        assert_eq!(c.kind, LogKind::Info);
    }

    #[test]
    fn test_unrecognized_line_is_info() {
        let c = classifier().classify("TCP/UDP: Preserving recently used remote address");
        assert_eq!(c.kind, LogKind::Info);
        assert_eq!(classifier().classify("").kind, LogKind::Info);
    }

    #[test]
    fn test_priority_connected_beats_fatal() {
        let c = classifier().classify("Initialization Sequence Completed; Exiting due to fatal error");
        assert_eq!(c.kind, LogKind::ConnectedMarker);
    }

    #[test]
    fn test_priority_auth_failed_beats_prompt() {
        let c = classifier().classify("AUTH_FAILED Enter Auth Password");
        assert_eq!(c.failure, Some(ErrorKind::AuthFailed));
    }

    #[test]
    fn test_priority_ignores_table_order() {
        let rules = vec![
            RuleConfig {
                class: RuleClass::Fatal,
                pattern: "boom".to_string(),
                credential: None,
            },
            RuleConfig {
                class: RuleClass::Connected,
                pattern: "up".to_string(),
                credential: None,
            },
        ];
        let c = Classifier::new(&rules).unwrap();
        assert_eq!(c.classify("boom, tunnel up").kind, LogKind::ConnectedMarker);
    }

    #[test]
    fn test_custom_rules_from_config() {
        let config = MonitorConfig {
            prompt_flush_ms: 200,
            rules: vec![RuleConfig {
                class: RuleClass::AuthRequest,
                pattern: "(?i)enter pin".to_string(),
                credential: Some(CredentialType::Challenge),
            }],
        };
        let c = Classifier::from_config(&config).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(
            c.classify("ENTER PIN:").kind,
            LogKind::AuthRequest(CredentialType::Challenge)
        );
        // The built-in table is replaced.
        assert_eq!(c.classify("Initialization Sequence Completed").kind, LogKind::Info);
    }

    #[test]
    fn test_empty_config_uses_builtin_table() {
        let config = MonitorConfig {
            prompt_flush_ms: 200,
            rules: Vec::new(),
        };
        let c = Classifier::from_config(&config).unwrap();
        assert_eq!(c.len(), default_rules().len());
    }

    #[test]
    fn test_peer_address_captured() {
        let c = classifier().classify(
            "2024-01-01 12:00:01 [server] Peer Connection Initiated with [AF_INET]203.0.113.7:1194",
        );
        assert_eq!(c.kind, LogKind::Info);
        assert_eq!(c.failure, None);
        assert_eq!(c.tunnel.remote_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(c.tunnel.local_address, None);
    }

    #[test]
    fn test_local_address_captured() {
        let c = classifier();
        for line in [
            "2024-01-01 12:00:02 net_addr_v4_add: 10.8.0.6/24 dev tun0",
            "2024-01-01 12:00:02 /sbin/ip addr add dev tun0 10.8.0.6/24 broadcast 10.8.0.255",
            "2024-01-01 12:00:02 /sbin/ifconfig utun3 10.8.0.6 10.8.0.5 mtu 1500 netmask 255.255.255.255 up",
        ] {
            let result = c.classify(line);
            assert_eq!(result.kind, LogKind::Info, "{}", line);
            assert_eq!(result.tunnel.local_address.as_deref(), Some("10.8.0.6"), "{}", line);
            assert_eq!(result.tunnel.remote_address, None, "{}", line);
        }
    }

    #[test]
    fn test_plain_lines_capture_nothing() {
        let c = classifier();
        assert!(c.classify("Initialization Sequence Completed").tunnel.is_empty());
        assert!(c.classify("TUN/TAP device tun0 opened").tunnel.is_empty());
    }

    #[test]
    fn test_named_groups_on_any_class() {
        let rules = vec![RuleConfig {
            class: RuleClass::Connected,
            pattern: r"Tunnel up: (?P<local>\S+) via (?P<remote>\S+)".to_string(),
            credential: None,
        }];
        let c = Classifier::new(&rules).unwrap().classify("Tunnel up: 10.0.0.2 via 198.51.100.1");
        assert_eq!(c.kind, LogKind::ConnectedMarker);
        assert_eq!(c.tunnel.local_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(c.tunnel.remote_address.as_deref(), Some("198.51.100.1"));
    }

    #[test]
    fn test_invalid_pattern() {
        let rules = vec![RuleConfig {
            class: RuleClass::Fatal,
            pattern: "(unclosed".to_string(),
            credential: None,
        }];
        assert!(matches!(
            Classifier::new(&rules),
            Err(ClassifierError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_prompt_without_credential_type() {
        let rules = vec![RuleConfig {
            class: RuleClass::AuthRequest,
            pattern: "Password".to_string(),
            credential: None,
        }];
        assert!(matches!(
            Classifier::new(&rules),
            Err(ClassifierError::MissingCredentialType(_))
        ));
    }
}
