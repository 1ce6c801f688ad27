//! Repository auto-creation on first push.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use anyhow::{ensure, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::Config;

/// Creates a repository that a push is about to target.
///
/// `repo` is the client-supplied path relative to the repository root
/// (namespace and repository name, e.g. `org/team/project.git`).
#[async_trait::async_trait]
pub trait RepoInitializer: Send + Sync {
    async fn init(&self, repo: &str, config: &Config) -> Result<()>;
}

/// Runs `git init --bare` beneath the configured repository root.
#[derive(Debug, Clone, Copy, Default)]
pub struct BareRepoInitializer;

#[async_trait::async_trait]
impl RepoInitializer for BareRepoInitializer {
    async fn init(&self, repo: &str, config: &Config) -> Result<()> {
        let path = init_bare_repo(&config.repo_root, repo).await?;
        info!(repo, path = %path.display(), "repository created");
        Ok(())
    }
}

/// Create the bare repository `repo` (namespace included) under `root` and
/// return its path.  Missing namespace directories are created; a directory
/// that already has a `HEAD` is left untouched.
#[instrument(skip(root))]
pub async fn init_bare_repo(root: &Path, repo: &str) -> Result<PathBuf> {
    let relative = Path::new(repo.trim_start_matches('/'));
    ensure!(
        relative.components().next().is_some()
            && relative.components().all(|c| matches!(c, Component::Normal(_))),
        "refusing to create repository {repo:?} outside {}",
        root.display()
    );
    let path = root.join(relative);

    if path.join("HEAD").is_file() {
        debug!("repository already initialised");
        return Ok(path);
    }
    if let Some(namespace) = path.parent() {
        tokio::fs::create_dir_all(namespace)
            .await
            .with_context(|| format!("cannot create namespace for {repo:?}"))?;
    }

    let output = Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(&path)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("cannot run git init for {repo:?}"))?;
    ensure!(
        output.status.success(),
        "git init for {repo:?} exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_git() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn existing_repo_is_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("org/r.git");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        // No git binary is needed for the early return.
        let path = init_bare_repo(root.path(), "org/r.git").await.unwrap();
        assert_eq!(path, repo);
        assert_eq!(
            std::fs::read_to_string(repo.join("HEAD")).unwrap(),
            "ref: refs/heads/main\n"
        );
    }

    #[tokio::test]
    async fn names_that_leave_the_root_are_refused() {
        let root = tempfile::tempdir().unwrap();
        for repo in ["..", "../x.git", "org/../../x.git", "./x.git", ""] {
            let err = init_bare_repo(root.path(), repo).await.unwrap_err();
            assert!(err.to_string().contains("refusing"), "{repo}: {err}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn creates_namespace_and_bare_repo() {
        if !has_git() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let config = crate::git::bridge::tests::test_config(root.path(), root.path());
        BareRepoInitializer
            .init("/org/team/new.git", &config)
            .await
            .unwrap();
        assert!(root.path().join("org/team/new.git/HEAD").is_file());
    }
}
