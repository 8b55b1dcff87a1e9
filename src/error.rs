//! Fatal discovery errors.
//!
//! These abort the whole run: once inventory or classification fails the
//! plan cannot be trusted. Failures during execution are not represented
//! here; they are logged per step and the run continues.

/// Discovery failure that terminates the process with exit code 1
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("storage pool {pool} cannot be confirmed on {host}: {reason}")]
    RemoteUnavailable {
        host: String,
        pool: String,
        reason: String,
    },

    #[error("remote command `{command}` on {host} failed: {stderr}")]
    RemoteCommand {
        host: String,
        command: String,
        stderr: String,
    },

    #[error("local command `{command}` failed: {stderr}")]
    LocalCommand { command: String, stderr: String },

    #[error("cannot classify {object}: {reason}")]
    Classification { object: String, reason: String },
}

impl DiscoveryError {
    pub fn classification(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Classification {
            object: object.into(),
            reason: reason.into(),
        }
    }
}
