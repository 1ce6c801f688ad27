//! Spawning git service processes and relaying their stdio.
//!
//! [`ProcessBridge::spawn`] turns a validated [`GitCommand`] into a running
//! `git-<service>` child, creating the repository first when the push
//! auto-create rule applies.  [`ServiceProcess::relay`] then pumps the
//! channel's bytes into the child's stdin on its own task while stdout and
//! stderr are drained concurrently, so a full pipe in one direction can never
//! stall the other.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::command::GitCommand;
use super::init::RepoInitializer;
use crate::config::Config;
use crate::error::ExecError;

// ---------------------------------------------------------------------------
// ProcessBridge
// ---------------------------------------------------------------------------

/// Shared by every channel of every connection; holds only read-only state.
#[derive(Clone)]
pub struct ProcessBridge {
    config: Arc<Config>,
    initializer: Arc<dyn RepoInitializer>,
}

impl ProcessBridge {
    pub fn new(config: Arc<Config>, initializer: Arc<dyn RepoInitializer>) -> Self {
        Self {
            config,
            initializer,
        }
    }

    /// Directory the service runs in: the repository root joined with the
    /// command's namespace.
    pub fn working_dir(&self, command: &GitCommand) -> Result<PathBuf, ExecError> {
        resolve_under(&self.config.repo_root, &command.namespace)
    }

    fn program(&self, command: &GitCommand) -> PathBuf {
        let program = command.service().program();
        match &self.config.exec_path {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        }
    }

    /// Start the service process for `command`.
    ///
    /// The child inherits the server's environment, plus the client's `env`
    /// assignments and the identity variable carrying `key_id`.  Nothing is
    /// sent to the client here; the caller acknowledges the exec request once
    /// this returns `Ok`.
    #[instrument(skip(self, env), fields(service = %command.service(), repo = %command.repo, namespace = %command.namespace))]
    pub async fn spawn(
        &self,
        command: &GitCommand,
        key_id: &str,
        env: &[(String, String)],
    ) -> Result<ServiceProcess, ExecError> {
        check_repo_name(&command.repo)?;
        let dir = self.working_dir(command)?;

        if self.config.auto_create
            && command.service().is_write()
            && !dir.join(&command.repo).exists()
        {
            let repo = command.path();
            info!(repo = %repo, "auto-creating repository");
            self.initializer
                .init(&repo, &self.config)
                .await
                .map_err(|source| ExecError::RepoInit { repo, source })?;
        }

        let program = self.program(command);
        debug!(program = %program.display(), dir = %dir.display(), "spawning service");

        let mut cmd = Command::new(&program);
        cmd.arg(&command.repo)
            .current_dir(&dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(&self.config.identity_env, key_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.display().to_string(),
            dir: dir.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ExecError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ExecError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExecError::MissingPipe("stderr"))?;

        Ok(ServiceProcess {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// The repository argument names a directory inside the working directory;
/// it must not be empty or refer to the working directory or its parent.
fn check_repo_name(repo: &str) -> Result<(), ExecError> {
    match repo {
        "" | "." | ".." => Err(ExecError::InvalidRepoPath(repo.to_string())),
        _ => Ok(()),
    }
}

/// Join `namespace` onto `root`, refusing anything that would leave it.
fn resolve_under(root: &Path, namespace: &str) -> Result<PathBuf, ExecError> {
    let relative = Path::new(namespace.trim_start_matches('/'));
    let mut dir = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => dir.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExecError::InvalidRepoPath(namespace.to_string()));
            }
        }
    }
    Ok(dir)
}

// ---------------------------------------------------------------------------
// ServiceProcess
// ---------------------------------------------------------------------------

/// A started service process with all three pipes still attached.
#[derive(Debug)]
pub struct ServiceProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl ServiceProcess {
    /// Relay the process's stdio against a channel until it exits.
    ///
    /// `input` is copied into stdin on a separate task; stdout goes to
    /// `output` and stderr to `errors`.  Returns once the process has exited
    /// and both of its output streams are drained.  The input task is aborted
    /// at that point, since the client may keep its side open until it sees
    /// the channel close.
    pub async fn relay<R, W, E>(
        self,
        input: R,
        mut output: W,
        mut errors: E,
    ) -> std::io::Result<ExitStatus>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let Self {
            mut child,
            stdin,
            mut stdout,
            mut stderr,
        } = self;

        let mut pumps = JoinSet::new();
        pumps.spawn(pump_input(input, stdin));

        let (out, err) = tokio::join!(
            tokio::io::copy(&mut stdout, &mut output),
            tokio::io::copy(&mut stderr, &mut errors),
        );
        match (&out, &err) {
            (Ok(out), Ok(err)) => debug!(stdout_bytes = out, stderr_bytes = err, "output drained"),
            _ => {
                // The client side is gone; nobody will read what the process
                // still has to say.
                warn!(stdout = ?out.as_ref().err(), stderr = ?err.as_ref().err(), "output relay failed; killing service");
                let _ = child.start_kill();
            }
        }

        let status = child.wait().await;
        pumps.abort_all();
        status
    }
}

async fn pump_input<R>(mut input: R, mut stdin: ChildStdin)
where
    R: AsyncRead + Unpin,
{
    match tokio::io::copy(&mut input, &mut stdin).await {
        Ok(n) => debug!(bytes = n, "client input finished"),
        Err(e) => debug!(error = %e, "client input relay stopped"),
    }
    // Closing stdin tells the service the client is done.
    let _ = stdin.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
