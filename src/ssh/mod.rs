//! SSH front-end for git.
//!
//! Accepts SSH connections from git clients, authenticates them by public key
//! (unless client authentication is disabled) and runs the whitelisted git
//! service named by each channel's `exec` request against the local
//! repository tree.

pub mod channel;
pub mod hostkey;
pub mod server;
pub mod session;

pub use server::GitSshServer;
