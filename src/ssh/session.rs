//! SSH connection handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`GitSession`].  It
//! authenticates the client (by public key, unless authentication is
//! disabled), binds the resolved key id to the connection, and hands every
//! session channel to its own [`ChannelSession`] task.  All channel tasks of a
//! connection are cancelled when the connection goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet, Pty};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelSession, ExecContext};
use crate::auth::ClientAuth;
use crate::git::ProcessBridge;
use crate::AppState;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct GitSession {
    state: Arc<AppState>,
    bridge: ProcessBridge,
    tracker: TaskTracker,
    peer_addr: Option<SocketAddr>,
    /// Key id of the authenticated client; empty when authentication is
    /// disabled.  Never changes once the handshake is done.
    key_id: Arc<str>,
    /// Cancels every channel task of this connection.
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl GitSession {
    /// Create a new session for an incoming connection.  `cancel` should be a
    /// child of the server's shutdown token.
    pub fn new(
        state: Arc<AppState>,
        bridge: ProcessBridge,
        tracker: TaskTracker,
        cancel: CancellationToken,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state,
            bridge,
            tracker,
            peer_addr,
            key_id: Arc::from(""),
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// The context shared by every channel of this connection.
    pub fn exec_context(&self) -> ExecContext {
        ExecContext::new(
            Arc::clone(&self.key_id),
            Arc::clone(&self.state.authorizer),
            self.bridge.clone(),
        )
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

impl Drop for GitSession {
    fn drop(&mut self) {
        debug!(peer = ?self.peer_addr, "SSH connection closed");
    }
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Canonical `authorized_keys` text for a key, without comment.
pub fn canonical_key(key: &PublicKey) -> String {
    // RSA keys report the negotiated signature hash as their name.
    let algo = match key.name() {
        "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
        other => other,
    };
    format!("{algo} {}", key.public_key_base64())
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for GitSession {
    type Error = anyhow::Error;

    /// Accept anyone when client authentication is disabled.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.state.client_auth.is_enabled() {
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PUBLICKEY),
            });
        }
        info!(peer = ?self.peer_addr, user = %user, "accepting client without authentication");
        Ok(Auth::Accept)
    }

    /// Resolve the offered key through the configured lookup.
    ///
    /// A successful lookup binds the identity id to the connection.  If a git
    /// user is configured and the client logged in as someone else, the
    /// connection is dropped on the spot without any reply.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let ClientAuth::PublicKey(lookup) = &self.state.client_auth else {
            return Ok(Self::reject());
        };

        let canonical = canonical_key(key);
        info!(peer = ?self.peer_addr, user = %user, "SSH public-key auth attempt");

        let identity = match lookup.lookup(&canonical).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!(peer = ?self.peer_addr, user = %user, "SSH key not authorized");
                return Ok(Self::reject());
            }
            Err(e) => {
                error!(peer = ?self.peer_addr, error = %e, "failed to look up SSH key");
                return Ok(Self::reject());
            }
        };

        if let Some(expected) = self.state.config.auth.git_user.as_deref() {
            if user != expected {
                warn!(peer = ?self.peer_addr, user = %user, expected, "unexpected SSH user; closing connection");
                anyhow::bail!("unexpected SSH user {user:?}");
            }
        }

        info!(
            peer = ?self.peer_addr,
            key_id = %identity.id,
            name = %identity.name,
            fingerprint = %identity.fingerprint,
            "SSH key resolved"
        );
        self.key_id = Arc::from(identity.id);
        Ok(Auth::Accept)
    }

    /// Serve each session channel on its own task.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        debug!(peer = ?self.peer_addr, channel = ?id, "session channel opened");

        let worker = ChannelSession::new(id, session.handle(), self.exec_context());
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!(channel = ?id, "channel cancelled"),
                () = worker.run(channel) => {}
            }
        });
        Ok(true)
    }

    /// Only session channels are served; forwarding is refused with an
    /// open failure.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.peer_addr,
            channel = ?channel.id(),
            host = %host_to_connect,
            port = port_to_connect,
            "refusing direct-tcpip channel"
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(peer = ?self.peer_addr, channel = ?channel.id(), "refusing x11 channel");
        Ok(false)
    }

    // Channel requests are answered by the channel task, which receives them
    // as `ChannelMsg`s. The callbacks below must not reply on their own.

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn exec_request(
        &mut self,
        _channel: ChannelId,
        _data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn shell_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        _channel: ChannelId,
        _name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
