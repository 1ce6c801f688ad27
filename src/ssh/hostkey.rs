//! Durable SSH host key provisioning.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tracing::info;

/// Load the host key at `path`, generating an Ed25519 key there first if the
/// file does not exist yet.  Any failure is fatal to startup.
pub fn ensure_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        let dir = path
            .parent()
            .with_context(|| format!("host key path has no parent: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create host key directory: {}", dir.display()))?;
        generate_host_key(path)?;
        info!(path = %path.display(), "generated new SSH host key");
    }

    let key = russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
    info!(path = %path.display(), "loaded SSH host key");
    Ok(key)
}

fn generate_host_key(path: &Path) -> Result<()> {
    let key = KeyPair::generate_ed25519();

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .with_context(|| format!("failed to create host key file: {}", path.display()))?;

    russh_keys::encode_pkcs8_pem(&key, file)
        .with_context(|| format!("failed to write host key: {}", path.display()))?;
    Ok(())
}
