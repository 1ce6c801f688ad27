//! Failure kinds of a single exec request.
//!
//! These never escape the channel that produced them; the channel decides
//! from the variant what, if anything, the client gets to read.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid git command")]
    InvalidCommand,

    #[error("command not authorized for key {key_id:?}")]
    Unauthorized { key_id: String },

    #[error("authorization check failed: {0:#}")]
    AuthorizationFailed(anyhow::Error),

    #[error("failed to initialise repository {repo}: {source:#}")]
    RepoInit {
        repo: String,
        source: anyhow::Error,
    },

    #[error("repository path escapes the repository root: {0}")]
    InvalidRepoPath(String),

    #[error("failed to start {program} in {}: {source}", dir.display())]
    Spawn {
        program: String,
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("{0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("failed to wait for service process: {0}")]
    Wait(#[source] std::io::Error),
}

impl ExecError {
    /// Text written on the channel's output stream, if the client is told
    /// anything at all.
    pub fn client_message(&self) -> Option<&'static str> {
        match self {
            Self::InvalidCommand => Some("Invalid command.\r\n"),
            Self::Unauthorized { .. } | Self::AuthorizationFailed(_) => {
                Some("The command is not authorized for this repository.\r\n")
            }
            Self::RepoInit { .. }
            | Self::InvalidRepoPath(_)
            | Self::Spawn { .. }
            | Self::MissingPipe(_)
            | Self::Wait(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_parse_and_auth_failures_reach_the_client() {
        assert!(ExecError::InvalidCommand.client_message().is_some());
        assert!(ExecError::Unauthorized { key_id: "k".into() }
            .client_message()
            .is_some());
        assert!(ExecError::AuthorizationFailed(anyhow::anyhow!("boom"))
            .client_message()
            .is_some());
        assert!(ExecError::RepoInit {
            repo: "r".into(),
            source: anyhow::anyhow!("boom"),
        }
        .client_message()
        .is_none());
        assert!(ExecError::InvalidRepoPath("../x".into())
            .client_message()
            .is_none());
        assert!(ExecError::MissingPipe("stdout").client_message().is_none());
    }
}
