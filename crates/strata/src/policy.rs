//! Path-policy [`Authorizer`].
//!
//! A source may be registered when its canonical path lies under one of
//! `policy.allowed_roots`. The read scope granted is the matching root(s),
//! so a symlink inside the source that escapes every root is never read.
//! An empty list allows any readable path, scoped to the path itself.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use strata_core::capability::{AuthorizationDecision, Authorizer};

use crate::config::PolicyConfig;

#[derive(Debug, Clone)]
pub struct PathPolicy {
    roots: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(roots: &[PathBuf]) -> Self {
        let roots = roots
            .iter()
            .map(|r| {
                let expanded = expand_home(r);
                // Roots that do not exist yet are kept as written.
                std::fs::canonicalize(&expanded).unwrap_or(expanded)
            })
            .collect();
        Self { roots }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(&config.allowed_roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl Authorizer for PathPolicy {
    fn authorize(&self, path: &Path) -> AuthorizationDecision {
        if self.roots.is_empty() {
            return AuthorizationDecision {
                allowed: true,
                readonly_paths: vec![path.to_path_buf()],
            };
        }
        let matching: Vec<PathBuf> = self
            .roots
            .iter()
            .filter(|root| path.starts_with(root))
            .cloned()
            .collect();
        if matching.is_empty() {
            warn!(path = %path.display(), "path outside allowed roots");
            return AuthorizationDecision::deny();
        }
        debug!(path = %path.display(), roots = matching.len(), "path authorized");
        AuthorizationDecision {
            allowed: true,
            readonly_paths: matching,
        }
    }
}

/// Expand a leading `~/` using `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
