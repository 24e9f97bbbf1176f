//! Access control engine.
//!
//! Evaluates a [`CommandRequest`] against the loaded [`Policy`]: the
//! rule's entries are checked in configuration order and the first
//! granting entry terminates evaluation with an allow. If the list is
//! exhausted without a grant, or the pair has no rule at all, the result
//! is a deny. Nothing is evaluated after a grant, so helper programs
//! with side effects cannot run once the decision exists.
//!
//! # Entry Semantics
//!
//! - `Principal`: exact string match against the authenticated name
//! - `Group`: membership lookup in the system group database; an
//!   unknown group is a non-match, not a fault
//! - `File`: recursively includes another entry list; include cycles are
//!   configuration faults, detected via a visited set, never looped
//! - `Program`: runs an external helper with the principal and command
//!   appended to its arguments; exit 0 grants, a clean nonzero exit
//!   abstains (falls through), anything else is a configuration fault
//!
//! A configuration fault is logged and denies the affected request; it
//! never crashes the server. Helper results are cached per evaluation
//! call only, never across requests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use warden_core::policy::{AclEntry, CommandRequest, Policy, PolicyError, Rule};

/// Error type for ACL evaluation faults.
///
/// Every variant is a configuration fault: the affected request is
/// denied and the fault is logged once.
#[derive(Debug, Error)]
pub enum AclError {
    /// An ACL file includes itself, directly or transitively.
    #[error("ACL include cycle at {path}")]
    CycleDetected {
        /// File that closed the cycle.
        path: PathBuf,
    },

    /// An included ACL file could not be read.
    #[error("cannot read ACL file {path}: {source}")]
    Include {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// An included ACL file contains an invalid entry.
    #[error("ACL file {path} line {line}: {source}")]
    InvalidEntry {
        /// File containing the entry.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Underlying parse error.
        source: PolicyError,
    },

    /// A helper program could not be run or did not exit cleanly.
    #[error("ACL helper {path}: {reason}")]
    Helper {
        /// Helper executable path.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The system group database lookup failed.
    #[error("group lookup for '{name}' failed: {reason}")]
    Group {
        /// Group name being looked up.
        name: String,
        /// Description of the failure.
        reason: String,
    },
}

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request is allowed.
    Allow,
    /// Request is denied.
    Deny(DenyReason),
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No rule exists for the (command, subcommand) pair.
    NoRule,
    /// The rule's entry list was exhausted without a grant.
    NoMatchingEntry,
    /// Evaluation hit a configuration fault; denied fail-closed.
    ConfigurationFault,
}

impl Decision {
    /// Returns `true` if this is an allow decision.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRule => write!(f, "no policy rule for command"),
            Self::NoMatchingEntry => write!(f, "no ACL entry matched"),
            Self::ConfigurationFault => write!(f, "ACL configuration fault"),
        }
    }
}

/// Per-evaluation scratch state.
///
/// The visited set tracks the include stack for cycle detection; the
/// helper cache holds external program results for this evaluation call
/// only.
#[derive(Default)]
struct Evaluation {
    visited: HashSet<PathBuf>,
    helper_cache: HashMap<(PathBuf, Vec<String>), bool>,
}

/// The access control engine.
///
/// Stateless; all inputs arrive per call, so one engine serves every
/// session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AclEngine;

impl AclEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Authorizes a request against a policy.
    ///
    /// Pure with respect to server state; the one permitted side effect
    /// is running Program-type helper entries.
    pub async fn authorize(&self, request: &CommandRequest, policy: &Policy) -> Decision {
        let Some(rule) = policy.lookup(&request.command, request.subcommand.as_deref()) else {
            debug!(
                command = %request.command,
                subcommand = request.subcommand.as_deref().unwrap_or(""),
                "no policy rule for request"
            );
            return Decision::Deny(DenyReason::NoRule);
        };
        self.check(rule, request).await
    }

    /// Evaluates one rule's entry list for a request.
    pub async fn check(&self, rule: &Rule, request: &CommandRequest) -> Decision {
        let mut eval = Evaluation::default();
        for entry in &rule.acl {
            match self.eval_entry(&mut eval, entry, request).await {
                Ok(true) => return Decision::Allow,
                Ok(false) => {},
                Err(error) => {
                    warn!(
                        command = %request.command,
                        entry = %entry,
                        %error,
                        "ACL configuration fault; denying request"
                    );
                    return Decision::Deny(DenyReason::ConfigurationFault);
                },
            }
        }
        Decision::Deny(DenyReason::NoMatchingEntry)
    }

    /// Evaluates a single entry: `Ok(true)` grants, `Ok(false)` falls
    /// through to the next entry.
    async fn eval_entry(
        &self,
        eval: &mut Evaluation,
        entry: &AclEntry,
        request: &CommandRequest,
    ) -> Result<bool, AclError> {
        match entry {
            AclEntry::Principal(name) => Ok(*name == request.principal),
            AclEntry::Group(name) => group_contains(name, &request.principal),
            AclEntry::File(path) => self.eval_file(eval, path, request).await,
            AclEntry::Program { path, args } => self.eval_helper(eval, path, args, request).await,
        }
    }

    /// Type-erased recursion point for file includes.
    fn eval_entry_boxed<'a>(
        &'a self,
        eval: &'a mut Evaluation,
        entry: &'a AclEntry,
        request: &'a CommandRequest,
    ) -> BoxFuture<'a, Result<bool, AclError>> {
        Box::pin(self.eval_entry(eval, entry, request))
    }

    async fn eval_file(
        &self,
        eval: &mut Evaluation,
        path: &Path,
        request: &CommandRequest,
    ) -> Result<bool, AclError> {
        let canonical = std::fs::canonicalize(path).map_err(|source| AclError::Include {
            path: path.to_path_buf(),
            source,
        })?;
        if !eval.visited.insert(canonical.clone()) {
            return Err(AclError::CycleDetected { path: canonical });
        }

        let result = self.eval_file_entries(eval, &canonical, request).await;

        // The file leaves the include stack on the way out so diamond
        // includes stay legal; only a live cycle trips the check.
        eval.visited.remove(&canonical);
        result
    }

    async fn eval_file_entries(
        &self,
        eval: &mut Evaluation,
        path: &Path,
        request: &CommandRequest,
    ) -> Result<bool, AclError> {
        let content = std::fs::read_to_string(path).map_err(|source| AclError::Include {
            path: path.to_path_buf(),
            source,
        })?;
        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = AclEntry::parse(line).map_err(|source| AclError::InvalidEntry {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
            if self.eval_entry_boxed(eval, &entry, request).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn eval_helper(
        &self,
        eval: &mut Evaluation,
        path: &Path,
        args: &[String],
        request: &CommandRequest,
    ) -> Result<bool, AclError> {
        let cache_key = (path.to_path_buf(), args.to_vec());
        if let Some(&cached) = eval.helper_cache.get(&cache_key) {
            debug!(helper = %path.display(), cached, "helper result from evaluation cache");
            return Ok(cached);
        }

        let status = Command::new(path)
            .args(args)
            .arg(&request.principal)
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| AclError::Helper {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let granted = match status.code() {
            Some(0) => true,
            Some(_) => false,
            // Killed by a signal is not a clean nonzero exit.
            None => {
                return Err(AclError::Helper {
                    path: path.to_path_buf(),
                    reason: "helper terminated by signal".to_string(),
                });
            },
        };
        eval.helper_cache.insert(cache_key, granted);
        Ok(granted)
    }
}

/// Checks the system group database for a principal's membership.
///
/// An unknown group is a non-match; a database failure is a fault.
fn group_contains(name: &str, principal: &str) -> Result<bool, AclError> {
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Ok(group.mem.iter().any(|member| member == principal)),
        Ok(None) => Ok(false),
        Err(errno) => Err(AclError::Group {
            name: name.to_string(),
            reason: errno.to_string(),
        }),
    }
}
