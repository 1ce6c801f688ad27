use anyhow::Result;
use tracing::debug;

use super::Authorizer;
use crate::config::AccessRule;
use crate::git::GitCommand;

/// Allows every command.  Installed when no access rules are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _key_id: &str, _command: &GitCommand) -> Result<bool> {
        Ok(true)
    }
}

/// Static allow-list built from the `access` section of the config.
///
/// A command is allowed when any rule matches the key (`*` matches all keys)
/// and covers the command's namespace; pushes additionally need a rule with
/// `write: true`.
#[derive(Debug, Clone)]
pub struct RuleAuthorizer {
    rules: Vec<AccessRule>,
}

impl RuleAuthorizer {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }

    fn allows(&self, key_id: &str, command: &GitCommand) -> bool {
        let write = command.service().is_write();
        self.rules.iter().any(|rule| {
            (rule.key_id == "*" || rule.key_id == key_id)
                && (rule.namespaces.is_empty()
                    || rule
                        .namespaces
                        .iter()
                        .any(|ns| command.namespace.starts_with(ns.as_str())))
                && (!write || rule.write)
        })
    }
}

#[async_trait::async_trait]
impl Authorizer for RuleAuthorizer {
    async fn authorize(&self, key_id: &str, command: &GitCommand) -> Result<bool> {
        let allowed = self.allows(key_id, command);
        debug!(
            key_id,
            namespace = %command.namespace,
            repo = %command.repo,
            service = %command.service(),
            allowed,
            "evaluated access rules"
        );
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::parse_git_command;

    fn rule(key_id: &str, namespaces: &[&str], write: bool) -> AccessRule {
        AccessRule {
            key_id: key_id.to_string(),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            write,
        }
    }

    #[tokio::test]
    async fn allow_all_allows() {
        let cmd = parse_git_command("git-receive-pack 'x.git'").unwrap();
        assert!(AllowAll.authorize("", &cmd).await.unwrap());
    }

    #[tokio::test]
    async fn read_rule_does_not_grant_push() {
        let authz = RuleAuthorizer::new(vec![rule("alice", &[], false)]);
        let fetch = parse_git_command("git-upload-pack 'org/x.git'").unwrap();
        let push = parse_git_command("git receive-pack 'org/x.git'").unwrap();
        assert!(authz.authorize("alice", &fetch).await.unwrap());
        assert!(!authz.authorize("alice", &push).await.unwrap());
    }

    #[tokio::test]
    async fn namespaces_restrict_scope() {
        let authz = RuleAuthorizer::new(vec![rule("alice", &["org/"], true)]);
        let inside = parse_git_command("git-receive-pack 'org/team/x.git'").unwrap();
        let outside = parse_git_command("git-receive-pack 'other/x.git'").unwrap();
        let root = parse_git_command("git-upload-pack 'x.git'").unwrap();
        assert!(authz.authorize("alice", &inside).await.unwrap());
        assert!(!authz.authorize("alice", &outside).await.unwrap());
        assert!(!authz.authorize("alice", &root).await.unwrap());
    }

    #[tokio::test]
    async fn wildcard_and_unknown_keys() {
        let authz = RuleAuthorizer::new(vec![rule("*", &["public/"], false)]);
        let cmd = parse_git_command("git-upload-archive 'public/x.git'").unwrap();
        assert!(authz.authorize("anyone", &cmd).await.unwrap());
        assert!(authz.authorize("", &cmd).await.unwrap());

        let none = RuleAuthorizer::new(vec![rule("bob", &[], true)]);
        assert!(!none.authorize("alice", &cmd).await.unwrap());
    }
}
