//! Triggerhub configuration management

use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default length of generated shared secrets
pub const DEFAULT_TOKEN_LENGTH: usize = 40;

/// Main Triggerhub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerhubConfig {
    /// Dispatcher (broker) configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Listener (join) configuration
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl TriggerhubConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Copy with every secret replaced, safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        redact(&mut config.dispatcher.token);
        redact(&mut config.listener.dispatcher_token);
        for action in &mut config.listener.actions {
            redact(&mut action.token);
        }
        config
    }
}

const REDACTED: &str = "<redacted>";

fn redact(secret: &mut String) {
    if !secret.is_empty() {
        *secret = REDACTED.to_string();
    }
}

/// What to do when a trigger targets a listener that is already relaying
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the in-flight relay to finish (bounded by the relay timeout)
    #[default]
    Queue,
    /// Fail immediately with a "listener busy" outcome
    Reject,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Shared secret listeners present in `/ws/:token`
    pub token: String,

    /// Enable TLS
    pub tls_enabled: bool,

    /// TLS certificate path (PEM)
    pub tls_cert: Option<PathBuf>,

    /// TLS key path (PEM)
    pub tls_key: Option<PathBuf>,

    /// Upper bound for a single listener exchange, in seconds
    pub relay_timeout_secs: u64,

    /// Behaviour when a listener already has a relay in flight
    pub busy_policy: BusyPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            token: String::new(),
            tls_enabled: false,
            tls_cert: None,
            tls_key: None,
            relay_timeout_secs: 30,
            busy_policy: BusyPolicy::Queue,
        }
    }
}

impl DispatcherConfig {
    /// Check the settings needed before any socket is opened
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::Config(
                "The dispatcher token cannot be empty".to_string(),
            ));
        }
        if self.tls_enabled && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(Error::Config(
                "The certificate and key file are needed to run with TLS enabled".to_string(),
            ));
        }
        if self.relay_timeout_secs == 0 {
            return Err(Error::Config(
                "relay_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Relay timeout as a `Duration`
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    /// Socket address string to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A local action the listener is willing to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Action name advertised to the dispatcher
    pub name: String,

    /// Shell command to run
    pub command: String,

    /// Token a relayed trigger must carry
    pub token: String,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Name announced at registration
    pub name: String,

    /// Dispatcher `host[:port]`
    pub dispatcher_host: String,

    /// Dial the dispatcher with `wss://`
    pub tls: bool,

    /// Shared secret of the dispatcher
    pub dispatcher_token: String,

    /// How long to wait for a graceful close on interrupt, in milliseconds
    pub close_grace_ms: u64,

    /// Redial with backoff after a lost connection
    pub reconnect: bool,

    /// Local action table
    pub actions: Vec<ActionEntry>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "listener".to_string(),
            dispatcher_host: String::new(),
            tls: false,
            dispatcher_token: String::new(),
            close_grace_ms: 1000,
            reconnect: false,
            actions: Vec::new(),
        }
    }
}

impl ListenerConfig {
    /// Check the settings needed before dialing
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher_host.is_empty() {
            return Err(Error::Config("The dispatcher host is required".to_string()));
        }
        if self.dispatcher_token.is_empty() {
            return Err(Error::Config(
                "The dispatcher token is required".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(Error::Config("The listener name cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.name.is_empty() {
                return Err(Error::Config("Action names cannot be empty".to_string()));
            }
            if !seen.insert(action.name.as_str()) {
                return Err(Error::Config(format!(
                    "Action '{}' is declared more than once",
                    action.name
                )));
            }
        }
        Ok(())
    }

    /// WebSocket URL of the dispatcher upgrade endpoint
    pub fn websocket_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}/ws/{}",
            scheme,
            self.dispatcher_host.trim_end_matches('/'),
            self.dispatcher_token
        )
    }

    /// Close grace period as a `Duration`
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Generate a random alphanumeric token
pub fn generate_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TriggerhubConfig::default();
        assert_eq!(config.dispatcher.port, 80);
        assert_eq!(config.dispatcher.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.listener.close_grace_ms, 1000);
        assert!(!config.listener.reconnect);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = TriggerhubConfig::default();
        config.dispatcher.token = "dispatch-secret".to_string();
        config.listener.dispatcher_token = "join-secret".to_string();
        config.listener.actions = vec![ActionEntry {
            name: "deploy".to_string(),
            command: "./deploy.sh".to_string(),
            token: "action-secret".to_string(),
        }];

        let redacted = config.redacted();
        assert_eq!(redacted.dispatcher.token, REDACTED);
        assert_eq!(redacted.listener.dispatcher_token, REDACTED);
        assert_eq!(redacted.listener.actions[0].token, REDACTED);
        assert_eq!(redacted.listener.actions[0].command, "./deploy.sh");

        let printed = toml::to_string_pretty(&redacted).unwrap();
        assert!(!printed.contains("secret"));

        // Unset secrets stay empty
        let empty = TriggerhubConfig::default().redacted();
        assert!(empty.dispatcher.token.is_empty());
    }

    #[test]
    fn test_dispatcher_requires_token() {
        let config = DispatcherConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token cannot be empty"));
    }

    #[test]
    fn test_dispatcher_tls_requires_cert_and_key() {
        let config = DispatcherConfig {
            token: "secret".to_string(),
            tls_enabled: true,
            tls_cert: Some(PathBuf::from("/tmp/cert.pem")),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("certificate and key"));

        let config = DispatcherConfig {
            tls_key: Some(PathBuf::from("/tmp/key.pem")),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listener_validation() {
        let mut config = ListenerConfig {
            dispatcher_host: "hub:8080".to_string(),
            dispatcher_token: "secret".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.actions = vec![
            ActionEntry {
                name: "deploy".to_string(),
                command: "true".to_string(),
                token: "t".to_string(),
            },
            ActionEntry {
                name: "deploy".to_string(),
                command: "false".to_string(),
                token: "t".to_string(),
            },
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));

        config.actions.clear();
        config.dispatcher_host.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_websocket_url() {
        let mut config = ListenerConfig {
            dispatcher_host: "hub.example.com/".to_string(),
            dispatcher_token: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(config.websocket_url(), "ws://hub.example.com/ws/abc");
        config.tls = true;
        assert_eq!(config.websocket_url(), "wss://hub.example.com/ws/abc");
    }

    #[test]
    fn test_generate_token() {
        let token = generate_token(DEFAULT_TOKEN_LENGTH);
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token(DEFAULT_TOKEN_LENGTH));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dispatcher]
port = 9000
token = "hub-secret"
busy_policy = "reject"

[listener]
name = "svc1"
dispatcher_host = "localhost:9000"
dispatcher_token = "hub-secret"

[[listener.actions]]
name = "deploy"
command = "./deploy.sh"
token = "TOK"
"#
        )
        .unwrap();

        let config = TriggerhubConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatcher.port, 9000);
        assert_eq!(config.dispatcher.host, "0.0.0.0");
        assert_eq!(config.dispatcher.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.listener.name, "svc1");
        assert_eq!(config.listener.actions.len(), 1);
        assert_eq!(config.listener.actions[0].token, "TOK");
    }

    #[test]
    fn test_load_missing_file() {
        let err = TriggerhubConfig::load(Path::new("/nonexistent/triggerhub.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
