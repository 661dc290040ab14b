//! Error handling for tavern.
//!
//! The error system follows two principles:
//! 1. **Strongly-typed errors** ([`TavernError`]) so callers can match on the
//!    failure mode,
//! 2. **Contextual chains** (`anyhow::Context`) so the surface message names
//!    the file, package, or URL involved.
//!
//! Public operations return [`anyhow::Result`]; the domain error lives at the
//! root of the chain and can be recovered with
//! [`anyhow::Error::downcast_ref`]. The version solver uses exactly that to
//! decide which failures it may backtrack over; see
//! [`TavernError::is_solver_recoverable`].

use thiserror::Error;

/// The main error type for tavern operations.
///
/// Each variant represents one surface-level failure mode. Variants carry the
/// identifying data a caller needs to act on the failure (package names,
/// constraints, URLs, git output), not just prose.
#[derive(Error, Debug)]
pub enum TavernError {
    /// Malformed pubspec, lockfile, version constraint, or source description.
    #[error("Parse error in {subject}: {reason}")]
    ParseError {
        /// What was being parsed (a file path, a constraint string, ...).
        subject: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The solver exhausted every candidate version of a package.
    ///
    /// `chain` is the human-readable trail of dependers and constraints that
    /// narrowed the package's allowed set to the point of exhaustion.
    #[error("No version of {package} matches {constraint}\n{chain}")]
    NoVersionAvailable {
        /// Package whose candidate set ran dry.
        package: String,
        /// The effective (intersected) constraint at the time of failure.
        constraint: String,
        /// Formatted constraint chain, one depender per line.
        chain: String,
    },

    /// Two dependents require the same package from incompatible sources or
    /// descriptions.
    #[error("Incompatible dependencies on {package}: {first} vs {second}")]
    SourceMismatch {
        /// Package with the mismatched requirements.
        package: String,
        /// One requirement (source plus description).
        first: String,
        /// The other requirement.
        second: String,
    },

    /// A package requires an SDK outside the active version.
    #[error("Package {package} requires SDK version {constraint} (active SDK is {active})")]
    SdkConstraintMismatch {
        /// Package with the unsatisfiable SDK requirement.
        package: String,
        /// Its declared SDK constraint.
        constraint: String,
        /// The active SDK version.
        active: String,
    },

    /// A path source points nowhere, or a hosted package is unknown to the
    /// index.
    #[error("Could not find package {package}: {reason}")]
    PackageNotFound {
        /// Name of the missing package.
        package: String,
        /// Where it was looked for and what was wrong.
        reason: String,
    },

    /// HTTP failure other than a timeout.
    #[error("Network error fetching {url}: {reason}")]
    NetworkError {
        /// The URL of the failed request.
        url: String,
        /// HTTP status, when a response was received at all.
        status: Option<u16>,
        /// Transport or protocol-level detail.
        reason: String,
    },

    /// An HTTP request exceeded the per-request deadline.
    #[error("Timed out fetching {url}")]
    Timeout {
        /// The URL of the timed-out request.
        url: String,
    },

    /// A git subcommand exited non-zero.
    #[error("git {operation} failed: {stderr}")]
    GitError {
        /// The git operation that failed (e.g. "clone", "rev-parse").
        operation: String,
        /// Captured stderr from the git process.
        stderr: String,
    },

    /// The `git` executable is not on PATH and no fallback applies.
    #[error("git is not installed or not found in PATH")]
    GitNotFound,

    /// The lockfile references a missing source or has malformed entries.
    #[error("The lockfile is corrupt: {reason}")]
    LockFileCorrupt {
        /// What was wrong with the document.
        reason: String,
    },

    /// API misuse, e.g. a cache download of an uncacheable source.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the misuse.
        message: String,
    },

    /// An internal invariant was violated. A bug, not a user-facing
    /// condition.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML syntax error from a pubspec or lockfile document.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TavernError {
    /// Whether the version solver may recover from this failure by
    /// backtracking.
    ///
    /// Everything else aborts the current acquire and propagates to the
    /// top-level caller unchanged.
    #[must_use]
    pub const fn is_solver_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoVersionAvailable { .. }
                | Self::SourceMismatch { .. }
                | Self::SdkConstraintMismatch { .. }
        )
    }
}

/// Whether an error chain contains a solver-recoverable [`TavernError`].
#[must_use]
pub fn is_solver_recoverable(error: &anyhow::Error) -> bool {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<TavernError>())
        .is_some_and(TavernError::is_solver_recoverable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        let no_version = TavernError::NoVersionAvailable {
            package: "foo".into(),
            constraint: ">=1.0.0 <2.0.0".into(),
            chain: String::new(),
        };
        assert!(no_version.is_solver_recoverable());

        let timeout = TavernError::Timeout {
            url: "https://example.org".into(),
        };
        assert!(!timeout.is_solver_recoverable());
    }

    #[test]
    fn recoverable_through_context() {
        let err = anyhow::Error::new(TavernError::SourceMismatch {
            package: "foo".into(),
            first: "hosted".into(),
            second: "path".into(),
        })
        .context("while solving");
        assert!(is_solver_recoverable(&err));

        let err = anyhow::Error::new(TavernError::GitNotFound).context("while fetching");
        assert!(!is_solver_recoverable(&err));
    }
}
