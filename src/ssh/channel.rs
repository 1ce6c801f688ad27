//! Per-channel request loop.
//!
//! A session channel accepts any number of `env` requests followed by exactly
//! one `exec`.  The exec is parsed, authorized and bridged to a git service
//! process; whatever happens, the channel is closed afterwards.  Any other
//! request type ends the channel immediately.

use std::process::ExitStatus;
use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::error::ExecError;
use crate::git::{clean_exec_payload, parse_git_command, GitCommand, ProcessBridge, ServiceProcess};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// The channel requests the loop distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    SetEnv { name: String, value: String },
    Execute { command: Vec<u8> },
    Other { kind: &'static str, want_reply: bool },
}

impl ChannelRequest {
    /// Classify a channel message.  Messages that are not requests (data,
    /// EOF, window adjustments, ...) yield `None`.
    pub fn from_msg(msg: ChannelMsg) -> Option<Self> {
        let request = match msg {
            ChannelMsg::SetEnv {
                variable_name,
                variable_value,
                ..
            } => Self::SetEnv {
                name: variable_name,
                value: variable_value,
            },
            ChannelMsg::Exec { command, .. } => Self::Execute { command },
            ChannelMsg::RequestPty { want_reply, .. } => Self::Other {
                kind: "pty-req",
                want_reply,
            },
            ChannelMsg::RequestShell { want_reply } => Self::Other {
                kind: "shell",
                want_reply,
            },
            ChannelMsg::RequestSubsystem { want_reply, .. } => Self::Other {
                kind: "subsystem",
                want_reply,
            },
            ChannelMsg::RequestX11 { want_reply, .. } => Self::Other {
                kind: "x11-req",
                want_reply,
            },
            ChannelMsg::AgentForward { want_reply } => Self::Other {
                kind: "auth-agent-req@openssh.com",
                want_reply,
            },
            ChannelMsg::WindowChange { .. } => Self::Other {
                kind: "window-change",
                want_reply: false,
            },
            ChannelMsg::Signal { .. } => Self::Other {
                kind: "signal",
                want_reply: false,
            },
            // Data, EOF, window adjustments and the like.
            _ => return None,
        };
        Some(request)
    }
}

/// Validate an environment assignment.  Both fields must be non-empty; the
/// name loses any leading control characters.
pub fn parse_env(name: &str, value: &str) -> Option<(String, String)> {
    let name = name.trim_start_matches(char::is_control);
    if name.is_empty() || value.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// `exit-status 0` for a clean exit, nothing otherwise.
///
/// Failed or rejected commands deliberately get no exit status at all; the
/// channel is just closed.
pub fn exit_status_for(outcome: &Result<ExitStatus, ExecError>) -> Option<u32> {
    match outcome {
        Ok(status) if status.success() => Some(0),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ExecContext
// ---------------------------------------------------------------------------

/// Everything an exec needs that is shared by all channels of a connection.
/// Read-only once the handshake has completed.
#[derive(Clone)]
pub struct ExecContext {
    key_id: Arc<str>,
    authorizer: Arc<dyn Authorizer>,
    bridge: ProcessBridge,
}

impl ExecContext {
    pub fn new(key_id: Arc<str>, authorizer: Arc<dyn Authorizer>, bridge: ProcessBridge) -> Self {
        Self {
            key_id,
            authorizer,
            bridge,
        }
    }

    pub fn key_id(&self) -> &Arc<str> {
        &self.key_id
    }

    /// Parse and authorize a raw exec payload.
    pub async fn authorize(&self, payload: &[u8]) -> Result<GitCommand, ExecError> {
        let raw = clean_exec_payload(payload);
        info!(key_id = %self.key_id, command = %raw, "exec request");

        let command = parse_git_command(&raw)?;
        match self.authorizer.authorize(&self.key_id, &command).await {
            Ok(true) => Ok(command),
            Ok(false) => Err(ExecError::Unauthorized {
                key_id: self.key_id.to_string(),
            }),
            Err(e) => Err(ExecError::AuthorizationFailed(e)),
        }
    }

    /// Authorize the payload and, only if allowed, start the service.
    pub async fn start(
        &self,
        payload: &[u8],
        env: &[(String, String)],
    ) -> Result<ServiceProcess, ExecError> {
        let command = self.authorize(payload).await?;
        info!(
            key_id = %self.key_id,
            service = %command.service(),
            namespace = %command.namespace,
            repo = %command.repo,
            "starting git service"
        );
        self.bridge.spawn(&command, &self.key_id, env).await
    }
}

// ---------------------------------------------------------------------------
// ChannelSession
// ---------------------------------------------------------------------------

pub struct ChannelSession {
    id: ChannelId,
    handle: Handle,
    ctx: ExecContext,
    env: Vec<(String, String)>,
}

impl ChannelSession {
    pub fn new(id: ChannelId, handle: Handle, ctx: ExecContext) -> Self {
        Self {
            id,
            handle,
            ctx,
            env: Vec::new(),
        }
    }

    /// Serve the channel until its exec request has been handled, an
    /// unsupported request arrives, or the client goes away.
    pub async fn run(mut self, mut channel: Channel<Msg>) {
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            let Some(request) = ChannelRequest::from_msg(msg) else {
                continue;
            };
            debug!(channel = ?self.id, request = ?request, "channel request");

            match request {
                ChannelRequest::SetEnv { name, value } => match parse_env(&name, &value) {
                    Some(pair) => self.env.push(pair),
                    None => warn!(channel = ?self.id, name = %name, "env: invalid env arguments"),
                },
                ChannelRequest::Execute { command } => {
                    exit_status = self.execute(&command, channel).await;
                    break;
                }
                ChannelRequest::Other { kind, want_reply } => {
                    warn!(channel = ?self.id, kind, "unsupported request type");
                    self.write(b"Unsupported request type.\r\n").await;
                    if want_reply {
                        let _ = self.handle.channel_failure(self.id).await;
                    }
                    break;
                }
            }
        }

        self.finish(exit_status).await;
    }

    async fn execute(&self, payload: &[u8], channel: Channel<Msg>) -> Option<u32> {
        let outcome = self.bridge_exec(payload, channel).await;
        match &outcome {
            Ok(status) if status.success() => {
                info!(channel = ?self.id, key_id = %self.ctx.key_id(), "git service finished")
            }
            Ok(status) => warn!(channel = ?self.id, %status, "git service failed"),
            Err(e) => {
                match e {
                    ExecError::InvalidCommand
                    | ExecError::Unauthorized { .. }
                    | ExecError::AuthorizationFailed(_) => warn!(channel = ?self.id, error = %e, "exec rejected"),
                    _ => error!(channel = ?self.id, error = %e, "exec failed"),
                }
                if let Some(message) = e.client_message() {
                    self.write(message.as_bytes()).await;
                }
            }
        }
        exit_status_for(&outcome)
    }

    async fn bridge_exec(
        &self,
        payload: &[u8],
        channel: Channel<Msg>,
    ) -> Result<ExitStatus, ExecError> {
        let process = self.ctx.start(payload, &self.env).await?;

        // The client starts sending pack data once it sees the reply.
        let _ = self.handle.channel_success(self.id).await;

        let errors = Box::pin(channel.make_writer_ext(Some(1)));
        let (input, output) = tokio::io::split(channel.into_stream());
        process
            .relay(input, output, errors)
            .await
            .map_err(ExecError::Wait)
    }

    async fn write(&self, text: &[u8]) {
        if self
            .handle
            .data(self.id, CryptoVec::from_slice(text))
            .await
            .is_err()
        {
            debug!(channel = ?self.id, "client went away before message was sent");
        }
    }

    /// exit-status (when there is one), then EOF, then close.
    async fn finish(&self, exit_status: Option<u32>) {
        if let Some(code) = exit_status {
            let _ = self.handle.exit_status_request(self.id, code).await;
        }
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
        debug!(channel = ?self.id, ?exit_status, "channel closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
