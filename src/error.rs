//! Domain-specific error types for rsprovision.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! provides typed error variants for the failure modes of a provisioning
//! run. Component APIs return `Result<T, ProvisionError>` where the failure
//! is one of these kinds, while trait boundaries and the pipeline use
//! `anyhow::Result` so step context can be layered on top.
//!
//! Because `ProvisionError` converts into `anyhow::Error`, callers can
//! recover the typed variant with `downcast_ref::<ProvisionError>()`.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Gives consistent messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level text
/// (e.g., "No such file or directory (os error 2)").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        io::ErrorKind::AlreadyExists => "I/O error: already exists".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Which signature check rejected a signed artifact.
///
/// Each variant renders a distinct message so the log tells apart a broken
/// signature, a signature without a readable signer and a wrong signer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationFailure {
    /// `gpg --verify` itself reported the signature as invalid.
    #[error("invalid signature for {artifact}: {detail}")]
    BadSignature { artifact: String, detail: String },

    /// The verification output did not contain a signer fingerprint.
    #[error("no signer fingerprint could be extracted for {artifact}")]
    NoFingerprint { artifact: String },

    /// The signer fingerprint differs from the pinned one.
    #[error("wrong signer fingerprint for {artifact}: expected '{expected}', got '{actual}'")]
    FingerprintMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },
}

/// Domain-specific error type for rsprovision.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// A profile or step constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A profile could not be loaded or parsed, or a flag value is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The command is not available on the host.
    #[error("command not found in PATH: {command}")]
    CommandNotFound { command: String },

    /// An external command exited non-zero, timed out or could not be driven.
    #[error("command execution failed: {command}: {status}")]
    CommandFailure {
        /// The command line that was executed.
        command: String,
        /// Exit status, timeout or internal failure description.
        status: String,
    },

    /// A signed artifact was rejected.
    #[error("verification failure: {0}")]
    Verification(#[from] VerificationFailure),

    /// A package source descriptor is malformed or conflicts with an
    /// already registered one.
    #[error("registration error: {0}")]
    Registration(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// File path or operation description.
        context: String,
        /// Derived from [`io_error_kind_message`].
        message: String,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a `CommandFailure` for the given command line.
    pub(crate) fn command_failure(
        command: &str,
        args: &[String],
        status: impl Into<String>,
    ) -> Self {
        Self::CommandFailure {
            command: crate::executor::format_command_line(command, args),
            status: status.into(),
        }
    }
}
