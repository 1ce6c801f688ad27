//! SSH server bootstrap and the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::{MethodSet, SshId};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::hostkey::ensure_host_key;
use super::session::GitSession;
use crate::git::ProcessBridge;
use crate::AppState;

/// Identification string sent during version exchange.
pub fn server_id() -> String {
    format!("SSH-2.0-gitsshd_{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Accepts TCP connections and runs one [`GitSession`] per connection.
pub struct GitSshServer {
    state: Arc<AppState>,
    bridge: ProcessBridge,
    config: Arc<server::Config>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl GitSshServer {
    /// Provision the host key and build the transport configuration.
    ///
    /// Every error here is fatal: the server must not accept connections
    /// without a usable host key.
    pub fn setup(state: Arc<AppState>) -> Result<Self> {
        anyhow::ensure!(
            state.config.auth.enabled == state.client_auth.is_enabled(),
            "public key lookup is not configured"
        );

        let host_key = ensure_host_key(&state.config.host_key_path())?;

        let methods = if state.client_auth.is_enabled() {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::NONE
        };

        let config = Arc::new(server::Config {
            server_id: SshId::Standard(server_id()),
            keys: vec![host_key],
            methods,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        });

        let bridge = ProcessBridge::new(
            Arc::clone(&state.config),
            Arc::clone(&state.initializer),
        );

        Ok(Self {
            state,
            bridge,
            config,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the accept loop and tears down every open
    /// connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let listen_addr: SocketAddr = self.state.config.listen.parse().with_context(|| {
            format!("invalid SSH listen address: {:?}", self.state.config.listen)
        })?;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until the shutdown token fires,
    /// then wait for every connection task to finish.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "SSH server listening");

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) => warn!(error = %e, "error accepting incoming connection"),
            }
        }

        info!("SSH server stopped accepting; waiting for open connections");
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let cancel = self.shutdown.child_token();
        let handler = GitSession::new(
            Arc::clone(&self.state),
            self.bridge.clone(),
            self.tracker.clone(),
            cancel.clone(),
            Some(peer),
        );
        let config = Arc::clone(&self.config);

        self.tracker.spawn(async move {
            debug!(%peer, "handshaking");
            let session = match server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%peer, error = %e, "error on handshaking");
                    return;
                }
            };
            tokio::select! {
                () = cancel.cancelled() => debug!(%peer, "connection cancelled"),
                result = session => match result {
                    Ok(()) => debug!(%peer, "connection finished"),
                    Err(e) => warn!(%peer, error = %e, "connection ended with error"),
                },
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, AuthorizedKeysLookup, Authorizer, ClientAuth, RuleAuthorizer};
    use crate::config::{AccessRule, Config};
    use crate::git::bridge::tests::{install_script, test_config, CountingInit};

    use russh::client;
    use russh::ChannelMsg;
    use russh_keys::key::{KeyPair, PublicKey};
    use russh_keys::PublicKeyBase64;

    struct Client;

    #[async_trait::async_trait]
    impl client::Handler for Client {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    /// What a client saw on one channel.
    #[derive(Debug, Default)]
    struct Transcript {
        accepted: bool,
        refused: bool,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_status: Option<u32>,
    }

    struct Harness {
        _root: tempfile::TempDir,
        _bin: tempfile::TempDir,
        addr: SocketAddr,
        shutdown: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start(
        config: Config,
        client_auth: ClientAuth,
        authorizer: Arc<dyn Authorizer>,
        bin: tempfile::TempDir,
        root: tempfile::TempDir,
    ) -> Harness {
        let state = Arc::new(AppState {
            config: Arc::new(config),
            client_auth,
            authorizer,
            initializer: Arc::new(CountingInit::default()),
        });
        let server = GitSshServer::setup(state).unwrap();
        let shutdown = server.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        Harness {
            _root: root,
            _bin: bin,
            addr,
            shutdown,
        }
    }

    fn dirs() -> (tempfile::TempDir, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_script(
            bin.path(),
            "git-upload-pack",
            r#"echo "key=$GITSSHD_KEY_ID proto=$GIT_PROTOCOL"
cat
echo "remote: done" >&2"#,
        );
        install_script(bin.path(), "git-receive-pack", "echo partial; exit 1");
        (root, bin)
    }

    async fn connect(addr: SocketAddr) -> client::Handle<Client> {
        client::connect(Arc::new(client::Config::default()), addr, Client)
            .await
            .unwrap()
    }

    async fn exec(
        handle: &client::Handle<Client>,
        env: &[(&str, &str)],
        command: &str,
        input: &[u8],
    ) -> Transcript {
        let mut channel = handle.channel_open_session().await.unwrap();
        for (name, value) in env {
            channel.set_env(false, *name, *value).await.unwrap();
        }
        channel.exec(true, command).await.unwrap();
        if !input.is_empty() {
            channel.data(input).await.unwrap();
        }
        let _ = channel.eof().await;
        transcript(channel).await
    }

    /// Read everything the server sends on `channel` until it is closed.
    async fn transcript(mut channel: russh::Channel<client::Msg>) -> Transcript {
        let mut transcript = Transcript::default();
        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Success => transcript.accepted = true,
                    ChannelMsg::Failure => transcript.refused = true,
                    ChannelMsg::Data { data } => transcript.stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, .. } => {
                        transcript.stderr.extend_from_slice(&data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        transcript.exit_status = Some(exit_status)
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), collect)
            .await
            .expect("channel never closed");
        transcript
    }

    #[tokio::test]
    async fn successful_exec_ends_with_exit_status_zero() {
        let (root, bin) = dirs();
        let config = test_config(root.path(), bin.path());
        let harness = start(config, ClientAuth::Disabled, Arc::new(AllowAll), bin, root).await;

        let mut handle = connect(harness.addr).await;
        assert!(handle.authenticate_none("git").await.unwrap());

        let t = exec(
            &handle,
            &[("GIT_PROTOCOL", "version=2"), ("", "ignored")],
            "git-upload-pack 'r.git'",
            b"want\n",
        )
        .await;
        assert!(t.accepted);
        assert_eq!(String::from_utf8(t.stdout).unwrap(), "key= proto=version=2\nwant\n");
        assert_eq!(String::from_utf8(t.stderr).unwrap(), "remote: done\n");
        assert_eq!(t.exit_status, Some(0));
    }

    #[tokio::test]
    async fn failed_exec_closes_without_exit_status() {
        let (root, bin) = dirs();
        let config = test_config(root.path(), bin.path());
        let harness = start(config, ClientAuth::Disabled, Arc::new(AllowAll), bin, root).await;

        let mut handle = connect(harness.addr).await;
        assert!(handle.authenticate_none("git").await.unwrap());

        let t = exec(&handle, &[], "git receive-pack 'r.git'", b"").await;
        assert!(t.accepted);
        assert_eq!(t.stdout, b"partial\n");
        assert_eq!(t.exit_status, None);
    }

    #[tokio::test]
    async fn invalid_and_unauthorized_commands_get_a_message() {
        let (root, bin) = dirs();
        let config = test_config(root.path(), bin.path());
        let read_only = RuleAuthorizer::new(vec![AccessRule {
            key_id: "*".into(),
            namespaces: vec![],
            write: false,
        }]);
        let harness = start(config, ClientAuth::Disabled, Arc::new(read_only), bin, root).await;

        let mut handle = connect(harness.addr).await;
        assert!(handle.authenticate_none("git").await.unwrap());

        let t = exec(&handle, &[], "rm -rf /'x'", b"").await;
        assert!(!t.accepted);
        assert_eq!(t.stdout, b"Invalid command.\r\n");
        assert_eq!(t.exit_status, None);

        let t = exec(&handle, &[], "git-receive-pack 'r.git'", b"").await;
        assert!(!t.accepted);
        assert_eq!(
            t.stdout,
            b"The command is not authorized for this repository.\r\n"
        );
        assert_eq!(t.exit_status, None);
    }

    #[tokio::test]
    async fn agent_forwarding_request_ends_the_channel() {
        let (root, bin) = dirs();
        let marker = root.path().join("spawned");
        install_script(
            bin.path(),
            "git-upload-pack",
            &format!("touch {}", marker.display()),
        );
        let config = test_config(root.path(), bin.path());
        let harness = start(config, ClientAuth::Disabled, Arc::new(AllowAll), bin, root).await;

        let mut handle = connect(harness.addr).await;
        assert!(handle.authenticate_none("git").await.unwrap());

        let mut channel = handle.channel_open_session().await.unwrap();
        channel.agent_forward(true).await.unwrap();
        // Sent before the server's close arrives; it must never be honoured.
        let _ = channel.exec(true, "git-upload-pack 'r.git'").await;

        let t = transcript(channel).await;
        assert!(t.refused);
        assert!(!t.accepted);
        assert_eq!(t.stdout, b"Unsupported request type.\r\n");
        assert_eq!(t.exit_status, None);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn only_session_channels_can_be_opened() {
        let (root, bin) = dirs();
        let config = test_config(root.path(), bin.path());
        let harness = start(config, ClientAuth::Disabled, Arc::new(AllowAll), bin, root).await;

        let mut handle = connect(harness.addr).await;
        assert!(handle.authenticate_none("git").await.unwrap());

        let forwarded = handle
            .channel_open_direct_tcpip("127.0.0.1", 22, "127.0.0.1", 40000)
            .await;
        assert!(forwarded.is_err());

        // The connection stays usable for session channels.
        let t = exec(&handle, &[], "git-upload-pack 'r.git'", b"").await;
        assert_eq!(t.exit_status, Some(0));
    }

    #[tokio::test]
    async fn channels_of_one_connection_share_the_key_id() {
        let (root, bin) = dirs();
        let client_key = KeyPair::generate_ed25519();
        let keys = root.path().join("authorized_keys");
        std::fs::write(
            &keys,
            format!("ssh-ed25519 {} alice\n", client_key.public_key_base64()),
        )
        .unwrap();

        let mut config = test_config(root.path(), bin.path());
        config.auth.enabled = true;
        config.auth.git_user = Some("git".into());
        config.auth.authorized_keys = Some(keys.clone());
        let lookup = ClientAuth::PublicKey(Arc::new(AuthorizedKeysLookup::new(keys)));
        let harness = start(config, lookup, Arc::new(AllowAll), bin, root).await;

        let client_key = Arc::new(client_key);
        let mut handle = connect(harness.addr).await;
        assert!(handle
            .authenticate_publickey("git", Arc::clone(&client_key))
            .await
            .unwrap());

        for _ in 0..3 {
            let t = exec(&handle, &[], "git upload-pack 'r.git'", b"").await;
            assert_eq!(t.exit_status, Some(0));
            assert_eq!(String::from_utf8(t.stdout).unwrap(), "key=alice proto=\n");
        }

        // Wrong user: the connection is dropped instead of accepted.
        let mut other = connect(harness.addr).await;
        let result = other.authenticate_publickey("mallory", client_key).await;
        assert!(!matches!(result, Ok(true)));
    }

    #[tokio::test]
    async fn auth_enabled_without_lookup_is_a_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path(), root.path());
        config.auth.enabled = true;
        let state = Arc::new(AppState {
            config: Arc::new(config),
            client_auth: ClientAuth::Disabled,
            authorizer: Arc::new(AllowAll),
            initializer: Arc::new(CountingInit::default()),
        });
        assert!(GitSshServer::setup(state).is_err());
        assert!(!root.path().join("keys").exists());
    }

    #[test]
    fn server_id_carries_product_and_version() {
        let id = server_id();
        assert!(id.starts_with("SSH-2.0-gitsshd_"));
        assert!(id.ends_with(env!("CARGO_PKG_VERSION")));
    }
}
