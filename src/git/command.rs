//! Parsing of git-over-SSH exec requests.
//!
//! Only the three git transport services are accepted, in either their
//! hyphenated (`git-upload-pack`) or space-separated (`git upload-pack`)
//! spelling, followed by a single-quoted repository path.  Everything else is
//! rejected before it can reach a process.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::ExecError;

/// Compiled once, shared read-only by every channel.
static GIT_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(git[- ](?:upload-pack|upload-archive|receive-pack)) '(.*)'$")
        .expect("git command pattern is valid")
});

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The git transport service a command resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl Service {
    /// Name of the service binary (`git-upload-pack` etc.).
    pub fn program(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::UploadArchive => "git-upload-archive",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Whether the service writes to the repository.
    pub fn is_write(self) -> bool {
        matches!(self, Self::ReceivePack)
    }

    fn from_command(command: &str) -> Option<Self> {
        // Both spellings share everything after the "git-" / "git " prefix.
        match command.get(4..)? {
            "upload-pack" => Some(Self::UploadPack),
            "upload-archive" => Some(Self::UploadArchive),
            "receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

// ---------------------------------------------------------------------------
// GitCommand
// ---------------------------------------------------------------------------

/// A validated git exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// Every path segment before the repository, separators included
    /// (`"org/team/"`), or empty.
    pub namespace: String,
    /// The command exactly as the client spelled it.
    pub command: String,
    /// The last path segment, unmodified (`"project.git"`).
    pub repo: String,
    service: Service,
}

impl GitCommand {
    pub fn service(&self) -> Service {
        self.service
    }

    /// `namespace` followed by `repo`, i.e. the quoted path the client sent.
    pub fn path(&self) -> String {
        format!("{}{}", self.namespace, self.repo)
    }
}

/// Parse an exec command line into a [`GitCommand`].
pub fn parse_git_command(cmd: &str) -> Result<GitCommand, ExecError> {
    debug!(command = %cmd, "parsing git command");

    let caps = GIT_COMMAND_RE
        .captures(cmd)
        .ok_or(ExecError::InvalidCommand)?;
    let command = &caps[1];
    let path = &caps[2];
    let service = Service::from_command(command).ok_or(ExecError::InvalidCommand)?;

    // Split after each '/', so the separators stay with the segment before them.
    let (namespace, repo) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    };

    Ok(GitCommand {
        namespace: namespace.to_string(),
        command: command.to_string(),
        repo: repo.to_string(),
        service,
    })
}

/// Strip the noise some clients put in front of the actual command: locale
/// or environment text before `git`, stray quoting characters and a leading
/// NUL.
pub fn clean_exec_payload(payload: &[u8]) -> String {
    let raw = String::from_utf8_lossy(payload);
    let cmd = match raw.find("git") {
        Some(idx) => &raw[idx..],
        None => &raw[..],
    };
    let cmd = cmd.trim_start_matches(['\'', '(', ')']);

    if cmd.starts_with('\0') {
        let stripped: String = cmd.chars().filter(|c| *c != '\0').collect();
        let mut chars = stripped.chars();
        chars.next();
        return chars.as_str().to_string();
    }
    cmd.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
