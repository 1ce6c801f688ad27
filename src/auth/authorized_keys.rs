//! [`PublicKeyLookup`] backed by an OpenSSH `authorized_keys`-style file.
//!
//! Each non-comment line is `<algorithm> <base64 blob> [id]`.  The trailing
//! comment doubles as the key id handed to hooks and the authorizer; keys
//! without one are identified by their fingerprint.  The file is re-read on
//! every lookup so operators can add or revoke keys without a restart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::{Identity, PublicKeyLookup};

#[derive(Debug, Clone)]
pub struct AuthorizedKeysLookup {
    path: PathBuf,
}

impl AuthorizedKeysLookup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl PublicKeyLookup for AuthorizedKeysLookup {
    #[instrument(skip(self, key), fields(path = %self.path.display()))]
    async fn lookup(&self, key: &str) -> Result<Option<Identity>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let found = find_identity(&contents, key);
        match &found {
            Some(identity) => debug!(key_id = %identity.id, "matched authorized key"),
            None => debug!("offered key is not authorized"),
        }
        Ok(found)
    }
}

/// Find the entry in `contents` whose algorithm and blob equal `key`.
fn find_identity(contents: &str, key: &str) -> Option<Identity> {
    let (want_algo, want_blob) = split_key(key)?;

    contents
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let entry = parse_line(line);
            if entry.is_none() {
                warn!(line = idx + 1, "skipping malformed authorized_keys entry");
            }
            entry
        })
        .find(|(algo, blob, _)| *algo == want_algo && *blob == want_blob)
        .map(|(algo, blob, comment)| {
            let fingerprint = fingerprint_of(blob);
            let id = comment.unwrap_or(&fingerprint).to_string();
            Identity {
                name: comment.unwrap_or_default().to_string(),
                id,
                fingerprint,
                content: format!("{algo} {blob}"),
            }
        })
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

fn parse_line(line: &str) -> Option<(&str, &str, Option<&str>)> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let algo = parts.next()?;
    let blob = parts.next()?.trim();
    if algo.is_empty() || blob.is_empty() {
        return None;
    }
    let comment = parts.next().map(str::trim).filter(|c| !c.is_empty());
    Some((algo, blob, comment))
}

/// SHA-256 fingerprint of a base64 key blob, formatted like `ssh-keygen -l`.
pub fn fingerprint_of(blob_b64: &str) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
