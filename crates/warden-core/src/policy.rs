//! Authorization policy model.
//!
//! A [`Policy`] is an immutable snapshot mapping (command, subcommand)
//! pairs to rules. It is constructed once per configuration load and
//! shared read-only by every session; a reload produces a new snapshot
//! swapped in between requests, never mutated in place.
//!
//! Each rule carries an ordered list of [`AclEntry`] values. Entry
//! evaluation lives in the daemon's access control engine; this module
//! only defines the data model and entry syntax.
//!
//! # Entry Syntax
//!
//! Entries are `scheme:value` strings. A bare value with no scheme is a
//! principal name.
//!
//! - `princ:NAME` (or bare `NAME`) — exact principal match
//! - `group:NAME` — membership in the system group database
//! - `file:PATH` — recursively include another entry list
//! - `program:PATH [ARG]...` — external helper; exit 0 grants

use std::path::PathBuf;

use thiserror::Error;

/// Error type for policy construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// ACL entry used an unknown scheme prefix.
    #[error("unknown ACL scheme '{scheme}'")]
    UnknownScheme {
        /// The offending scheme prefix.
        scheme: String,
    },

    /// ACL entry was empty or had an empty value.
    #[error("empty ACL entry")]
    EmptyEntry,

    /// Rule field failed validation.
    #[error("invalid rule for command '{command}': {reason}")]
    InvalidRule {
        /// Command the rule applies to.
        command: String,
        /// Description of the problem.
        reason: String,
    },
}

/// One rule in the authorization policy.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Command word this rule applies to.
    pub command: String,

    /// Subcommand this rule applies to; `None` matches any subcommand
    /// when no exact rule exists.
    pub subcommand: Option<String>,

    /// Executable run for authorized requests.
    pub program: PathBuf,

    /// Argument delivered on the child's standard input, if any.
    pub stdin_arg: Option<StdinArg>,

    /// Ordered access control entries; first granting entry wins.
    pub acl: Vec<AclEntry>,
}

/// Designates which command argument is delivered on standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinArg {
    /// One-based argument index (1 is the first argument after the
    /// command word).
    Index(usize),
    /// The final argument, whatever its position.
    Last,
}

/// One access control entry.
///
/// A closed variant set: adding a new entry kind is a variant addition
/// with one evaluation arm, not a new type hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEntry {
    /// Exact principal name match.
    Principal(String),

    /// Membership in a system group.
    Group(String),

    /// Recursive include of another entry list file.
    File(PathBuf),

    /// External helper program; exit status 0 grants, a clean nonzero
    /// exit abstains.
    Program {
        /// Helper executable path.
        path: PathBuf,
        /// Extra arguments placed before the principal and command.
        args: Vec<String>,
    },
}

impl AclEntry {
    /// Parses a `scheme:value` entry string.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` for unknown schemes or empty entries.
    pub fn parse(entry: &str) -> Result<Self, PolicyError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(PolicyError::EmptyEntry);
        }
        let Some((scheme, value)) = entry.split_once(':') else {
            return Ok(Self::Principal(entry.to_string()));
        };
        let value = value.trim();
        if value.is_empty() {
            return Err(PolicyError::EmptyEntry);
        }
        match scheme {
            "princ" => Ok(Self::Principal(value.to_string())),
            "group" => Ok(Self::Group(value.to_string())),
            "file" => Ok(Self::File(PathBuf::from(value))),
            "program" => {
                let mut fields = value.split_whitespace();
                let path = fields.next().ok_or(PolicyError::EmptyEntry)?;
                Ok(Self::Program {
                    path: PathBuf::from(path),
                    args: fields.map(str::to_string).collect(),
                })
            },
            other => Err(PolicyError::UnknownScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for AclEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Principal(name) => write!(f, "princ:{name}"),
            Self::Group(name) => write!(f, "group:{name}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Program { path, args } => {
                write!(f, "program:{}", path.display())?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            },
        }
    }
}

/// A command request resolved from the wire.
///
/// Immutable once built; consumed by both the access control engine and
/// the command executor.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Authenticated principal making the request.
    pub principal: String,

    /// Command word (the first argument).
    pub command: String,

    /// Subcommand (the second argument), when present and textual.
    pub subcommand: Option<String>,

    /// Full raw argument vector as received; the first entry is the
    /// command word.
    pub args: Vec<Vec<u8>>,
}

/// Immutable policy snapshot.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    /// Creates a policy from an ordered rule list.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Looks up the rule for a (command, subcommand) pair.
    ///
    /// Lookup is exact on the pair; a wildcard rule (no subcommand)
    /// matches only if no exact rule exists. Within each pass the first
    /// rule in configuration order wins.
    #[must_use]
    pub fn lookup(&self, command: &str, subcommand: Option<&str>) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| {
                rule.command == command
                    && rule.subcommand.is_some()
                    && rule.subcommand.as_deref() == subcommand
            })
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|rule| rule.command == command && rule.subcommand.is_none())
            })
    }

    /// Returns all rules in configuration order.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Returns `true` if the policy has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
