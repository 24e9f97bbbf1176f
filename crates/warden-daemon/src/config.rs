//! Daemon configuration.
//!
//! The daemon reads one TOML file with a `[daemon]` section and a list
//! of `[[rule]]` tables. Parsing produces an immutable [`Policy`]
//! snapshot; a reload constructs a fresh snapshot rather than mutating
//! the one in use.
//!
//! ```toml
//! [daemon]
//! listen = "0.0.0.0:4373"
//! keyring = "/etc/warden/keyring"
//! max_connections = 100
//! idle_timeout_secs = 3600
//!
//! [[rule]]
//! command = "backup"
//! subcommand = "run"          # omitted = matches any subcommand
//! program = "/usr/libexec/backup-run"
//! stdin = "last"              # or an argument index >= 1
//! acl = ["alice", "group:operators", "file:/etc/warden/acl/admins"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use warden_core::policy::{AclEntry, Policy, Rule, StdinArg};

use crate::server::{DEFAULT_PORT, ServerConfig};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// TOML syntax or structure error.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid configuration.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Daemon settings.
    pub daemon: DaemonSection,

    /// Policy rules in evaluation order.
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

/// The `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path to the keyring file.
    pub keyring: PathBuf,

    /// Maximum concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-connection idle timeout in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// One `[[rule]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Command word.
    pub command: String,

    /// Subcommand; omitted matches any subcommand.
    #[serde(default)]
    pub subcommand: Option<String>,

    /// Executable to run.
    pub program: PathBuf,

    /// Argument routed to standard input: `"last"` or an index >= 1.
    #[serde(default)]
    pub stdin: Option<StdinValue>,

    /// Ordered ACL entries.
    pub acl: Vec<String>,
}

/// Raw `stdin` value: keyword or index.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StdinValue {
    /// Argument index.
    Index(u64),
    /// The `"last"` keyword.
    Keyword(String),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

const fn default_max_connections() -> usize {
    100
}

const fn default_idle_timeout_secs() -> u64 {
    60 * 60
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Builds the immutable policy snapshot from the rule tables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` for empty commands, invalid
    /// stdin designators, or unparseable ACL entries.
    pub fn build_policy(&self) -> Result<Policy, ConfigError> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if rule.command.is_empty() {
                return Err(ConfigError::Validation("rule has empty command".to_string()));
            }
            let stdin_arg = match &rule.stdin {
                None => None,
                Some(StdinValue::Keyword(word)) if word == "last" => Some(StdinArg::Last),
                Some(StdinValue::Keyword(word)) => {
                    return Err(ConfigError::Validation(format!(
                        "rule '{}': unknown stdin keyword '{word}'",
                        rule.command
                    )));
                },
                Some(StdinValue::Index(0)) => {
                    return Err(ConfigError::Validation(format!(
                        "rule '{}': stdin index must be >= 1",
                        rule.command
                    )));
                },
                Some(StdinValue::Index(index)) => {
                    let index = usize::try_from(*index).map_err(|_| {
                        ConfigError::Validation(format!(
                            "rule '{}': stdin index out of range",
                            rule.command
                        ))
                    })?;
                    Some(StdinArg::Index(index))
                },
            };
            let mut acl = Vec::with_capacity(rule.acl.len());
            for entry in &rule.acl {
                acl.push(AclEntry::parse(entry).map_err(|e| {
                    ConfigError::Validation(format!("rule '{}': {e}", rule.command))
                })?);
            }
            rules.push(Rule {
                command: rule.command.clone(),
                subcommand: rule.subcommand.clone(),
                program: rule.program.clone(),
                stdin_arg,
                acl,
            });
        }
        Ok(Policy::new(rules))
    }

    /// Derives the server configuration from the `[daemon]` section.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.daemon.listen)
            .with_max_connections(self.daemon.max_connections)
            .with_idle_timeout(Duration::from_secs(self.daemon.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [daemon]
        listen = "127.0.0.1:4373"
        keyring = "/etc/warden/keyring"
        idle_timeout_secs = 120

        [[rule]]
        command = "backup"
        subcommand = "run"
        program = "/usr/libexec/backup-run"
        acl = ["alice", "group:operators"]

        [[rule]]
        command = "store"
        program = "/usr/libexec/store"
        stdin = "last"
        acl = ["princ:bob"]
    "#;

    #[test]
    fn test_parse_sample() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.daemon.idle_timeout_secs, 120);
        assert_eq!(config.daemon.max_connections, 100);
        assert_eq!(config.rules.len(), 2);

        let policy = config.build_policy().unwrap();
        let rule = policy.lookup("backup", Some("run")).unwrap();
        assert_eq!(rule.program, PathBuf::from("/usr/libexec/backup-run"));
        assert_eq!(
            rule.acl,
            vec![
                AclEntry::Principal("alice".to_string()),
                AclEntry::Group("operators".to_string()),
            ]
        );

        let rule = policy.lookup("store", Some("anything")).unwrap();
        assert_eq!(rule.stdin_arg, Some(StdinArg::Last));
    }

    #[test]
    fn test_stdin_index() {
        let config = DaemonConfig::from_toml(
            r#"
            [daemon]
            keyring = "/etc/warden/keyring"

            [[rule]]
            command = "put"
            program = "/bin/cat"
            stdin = 2
            acl = ["alice"]
            "#,
        )
        .unwrap();
        let policy = config.build_policy().unwrap();
        let rule = policy.lookup("put", None).unwrap();
        assert_eq!(rule.stdin_arg, Some(StdinArg::Index(2)));
    }

    #[test]
    fn test_stdin_index_zero_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
            [daemon]
            keyring = "/etc/warden/keyring"

            [[rule]]
            command = "put"
            program = "/bin/cat"
            stdin = 0
            acl = ["alice"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.build_policy(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_acl_scheme_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
            [daemon]
            keyring = "/etc/warden/keyring"

            [[rule]]
            command = "x"
            program = "/bin/true"
            acl = ["pcre:^host/"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.build_policy(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = DaemonConfig::from_toml(
            r#"
            [daemon]
            keyring = "/etc/warden/keyring"
            socket = "/run/warden.sock"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_keyring_rejected() {
        let result = DaemonConfig::from_toml("[daemon]\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
