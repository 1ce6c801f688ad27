//! Identity resolution and per-command authorization.
//!
//! Both concerns are capabilities injected into the SSH server at
//! construction: [`PublicKeyLookup`] maps an offered public key to an
//! [`Identity`], and [`Authorizer`] decides whether an identity may run a
//! given git command.  Implementations must be callable concurrently from
//! any number of connections and channels.

pub mod authorized_keys;
pub mod rules;

use std::sync::Arc;

use anyhow::Result;

use crate::git::GitCommand;

pub use authorized_keys::AuthorizedKeysLookup;
pub use rules::{AllowAll, RuleAuthorizer};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A known client key.  Only `id` travels further than the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    /// `SHA256:<base64>` fingerprint, as printed by `ssh-keygen -l`.
    pub fingerprint: String,
    /// Canonical `"<algorithm> <base64>"` key text.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Resolves a public key, given in canonical `"<algorithm> <base64>"` form.
///
/// `Ok(None)` means the key is unknown; an `Err` fails the credential just
/// the same but is logged as a lookup failure.
#[async_trait::async_trait]
pub trait PublicKeyLookup: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Identity>>;
}

/// Decides whether the holder of `key_id` may run `command`.
///
/// Anything but `Ok(true)` prevents the service process from being spawned.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, key_id: &str, command: &GitCommand) -> Result<bool>;
}

/// How clients authenticate during the handshake.
#[derive(Clone)]
pub enum ClientAuth {
    /// Accept every client; its key id is empty.
    Disabled,
    /// Require a public key that the lookup resolves.
    PublicKey(Arc<dyn PublicKeyLookup>),
}

impl ClientAuth {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::PublicKey(_))
    }
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::PublicKey(_) => f.write_str("PublicKey(..)"),
        }
    }
}
