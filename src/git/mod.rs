//! Git command parsing and the bridge to the git service binaries.
//!
//! Services run as child processes via `tokio::process::Command`; their
//! standard streams are wired straight to the SSH channel.

pub mod bridge;
pub mod command;
pub mod init;

pub use bridge::{ProcessBridge, ServiceProcess};
pub use command::{clean_exec_payload, parse_git_command, GitCommand};
pub use init::{BareRepoInitializer, RepoInitializer};
