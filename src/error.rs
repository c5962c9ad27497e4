//! Error taxonomy for kube2 operations.

use thiserror::Error;

/// Failures that kube2 detects or surfaces from the tools it wraps.
///
/// Validation variants are raised before any external call is made.
#[derive(Debug, Error)]
pub enum Kube2Error {
    #[error(
        "Name \"{0}\" is invalid. Names should contain only alphanumerics or dashes/underscores"
    )]
    InvalidName(String),

    #[error("There is already a {kind} named \"{name}\"")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("No {kind} named \"{name}\"")]
    NotFound { kind: &'static str, name: String },

    #[error("No kube2 cluster selected. Switch to or create a cluster first.")]
    NoClusterSelected,

    #[error("Command `{command}` failed with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Unexpected output from `{command}`:\n{output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Aborted by user")]
    Aborted,
}
