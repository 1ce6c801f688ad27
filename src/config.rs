use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root directory under which every repository (and namespace) lives.
    pub repo_root: PathBuf,
    pub host_key: HostKeyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Create missing repositories on the first push.
    #[serde(default)]
    pub auto_create: bool,
    /// Directory holding `git-upload-pack` and friends.  When unset, the
    /// service binaries are resolved through `PATH`.
    #[serde(default)]
    pub exec_path: Option<PathBuf>,
    /// Environment variable through which the service process (and its
    /// hooks) learn the authenticated key id.
    #[serde(default = "default_identity_env")]
    pub identity_env: String,
    /// Per-key authorization rules.  No rules means every authenticated
    /// command is allowed.
    #[serde(default)]
    pub access: Vec<AccessRule>,
}

impl Config {
    /// Full path of the server's host key file.
    pub fn host_key_path(&self) -> PathBuf {
        self.host_key.dir.join(&self.host_key.name)
    }
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_identity_env() -> String {
    "GITSSHD_KEY_ID".to_string()
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HostKeyConfig {
    /// Directory for the host key; created on first start.
    pub dir: PathBuf,
    #[serde(default = "default_host_key_name")]
    pub name: String,
}

fn default_host_key_name() -> String {
    "gitsshd_host_key".to_string()
}

// ---------------------------------------------------------------------------
// Client authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Require public-key authentication.  When disabled every client is
    /// accepted and carries an empty key id.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Only this SSH username may connect (e.g. `git`).
    #[serde(default)]
    pub git_user: Option<String>,
    /// `authorized_keys`-style file used to resolve offered keys.
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            git_user: None,
            authorized_keys: None,
        }
    }
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Access rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRule {
    /// Key id this rule applies to, or `*` for every key.
    pub key_id: String,
    /// Namespace prefixes (e.g. `org/`) the rule covers.  Empty covers all.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Allow `git-receive-pack`.
    #[serde(default)]
    pub write: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.repo_root.as_os_str().is_empty(),
        "repo_root must not be empty"
    );
    anyhow::ensure!(
        !config.host_key.dir.as_os_str().is_empty(),
        "host_key.dir must not be empty"
    );
    anyhow::ensure!(
        !config.host_key.name.is_empty(),
        "host_key.name must not be empty"
    );
    anyhow::ensure!(
        !config.auth.enabled || config.auth.authorized_keys.is_some(),
        "auth.authorized_keys is required when auth is enabled"
    );
    anyhow::ensure!(
        !config.identity_env.is_empty() && !config.identity_env.contains('='),
        "identity_env must be a valid variable name"
    );
    anyhow::ensure!(
        config.access.iter().all(|r| !r.key_id.is_empty()),
        "every access rule needs a key_id"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
