//! Enumerate the files of a source.
//!
//! Patterns are globs relative to the source root. Every walk excludes
//! `.git`, `target` and `node_modules`; include patterns default to
//! everything. Files resolving outside the source's allow-listed read paths
//! are never returned.
//!
//! A walk also reports the paths it could not read, so callers can tell a
//! file that is gone from one that was merely out of reach this time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::models::Source;

pub const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// A file found under a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub path: PathBuf,
    /// `/`-separated path relative to the source root.
    pub relative: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
}

/// Files found by [`walk_source`] plus the paths it could not read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Matching files sorted by relative path.
    pub files: Vec<WalkedFile>,
    /// `/`-separated paths relative to the root that could not be read. An
    /// empty string stands for the whole tree.
    pub unreadable: Vec<String>,
}

impl WalkOutcome {
    /// True when `relative` is, or lies below, a path the walk could not
    /// read: its absence from [`Self::files`] proves nothing.
    pub fn is_obscured(&self, relative: &str) -> bool {
        self.unreadable.iter().any(|u| {
            u.is_empty()
                || relative == u
                || relative
                    .strip_prefix(u.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

pub fn build_globset(patterns: &[String]) -> EngineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| EngineError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| EngineError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}

fn unreachable(path: &Path, reason: impl ToString) -> EngineError {
    EngineError::SourceUnreachable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn is_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    allowed.is_empty() || allowed.iter().any(|root| path.starts_with(root))
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `source` and return its matching files sorted by relative path.
///
/// A missing or unreadable root is [`EngineError::SourceUnreachable`].
/// Unreadable entries below the root are logged, skipped and listed in
/// [`WalkOutcome::unreadable`]; entries that vanished mid-walk are not.
pub fn walk_source(source: &Source) -> EngineResult<WalkOutcome> {
    let root = &source.root;
    let root_meta = std::fs::metadata(root).map_err(|e| unreachable(root, e))?;

    if root_meta.is_file() {
        let relative = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_allowed(root, &source.allowed_paths) {
            return Err(EngineError::PolicyDenied(root.clone()));
        }
        return Ok(WalkOutcome {
            files: vec![WalkedFile {
                path: root.clone(),
                relative,
                size: root_meta.len(),
                modified: modified_secs(&root_meta),
            }],
            unreadable: Vec::new(),
        });
    }

    std::fs::read_dir(root).map_err(|e| unreachable(root, e))?;

    let include = if source.include.is_empty() {
        build_globset(&["**".to_string()])?
    } else {
        build_globset(&source.include)?
    };
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(source.exclude.iter().cloned());
    let exclude = build_globset(&excludes)?;

    let mut files = Vec::new();
    let mut unreadable = Vec::new();
    let walker = WalkDir::new(root).follow_links(true).into_iter().filter_entry(|e| {
        e.depth() == 0 || !matches!(e.file_name().to_str(), Some(".git" | "target" | "node_modules"))
    });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let gone = e
                    .io_error()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                if !gone {
                    warn!(source_id = %source.id, error = %e, "skipping unreadable entry");
                    unreadable.push(e.path().map(|p| relative_to(root, p)).unwrap_or_default());
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel_str = relative_to(root, path);

        if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
            continue;
        }

        // Symlinks may point anywhere; check where the file really lives.
        let resolved = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) => {
                warn!(source_id = %source.id, path = %rel_str, error = %e, "cannot resolve");
                if e.kind() != std::io::ErrorKind::NotFound {
                    unreadable.push(rel_str);
                }
                continue;
            }
        };
        if !is_allowed(&resolved, &source.allowed_paths) {
            debug!(source_id = %source.id, path = %rel_str, "outside allowed paths");
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(source_id = %source.id, path = %rel_str, error = %e, "cannot stat");
                unreadable.push(rel_str);
                continue;
            }
        };
        files.push(WalkedFile {
            path: path.to_path_buf(),
            relative: rel_str,
            size: meta.len(),
            modified: modified_secs(&meta),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    unreadable.sort();
    unreadable.dedup();
    Ok(WalkOutcome { files, unreadable })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceState;

    fn source(root: &Path, include: &[&str], exclude: &[&str]) -> Source {
        let root = std::fs::canonicalize(root).unwrap();
        Source {
            id: "s".into(),
            root: root.clone(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            allowed_paths: vec![root],
            state: SourceState::NeverSynced,
            created_at: 0,
            last_synced_at: None,
        }
    }

    #[test]
    fn walks_sorted_with_default_and_custom_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("docs/b.md"), "b").unwrap();
        std::fs::write(dir.path().join("docs/sub/a.md"), "a").unwrap();
        std::fs::write(dir.path().join("docs/skip.log"), "x").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.path().join("node_modules/x/i.js"), "js").unwrap();

        let walk = walk_source(&source(dir.path(), &[], &["**/*.log"])).unwrap();
        assert!(walk.unreadable.is_empty());
        let files = walk.files;
        let rel: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(rel, vec!["docs/b.md", "docs/sub/a.md"]);

        let walk = walk_source(&source(dir.path(), &["**/sub/**"], &[])).unwrap();
        assert_eq!(walk.files.len(), 1);
    }

    #[test]
    fn single_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hello").unwrap();
        let files = walk_source(&source(&file, &[], &[])).unwrap().files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "notes.txt");
        assert_eq!(files[0].size, 5);
    }

    #[test]
    fn missing_root_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = source(dir.path(), &[], &[]);
        src.root = dir.path().join("gone");
        assert!(matches!(
            walk_source(&src),
            Err(EngineError::SourceUnreachable { .. })
        ));
    }

    #[test]
    fn obscured_paths_cover_their_subtree() {
        let walk = WalkOutcome {
            files: Vec::new(),
            unreadable: vec!["docs/private".into(), "notes.md".into()],
        };
        assert!(walk.is_obscured("docs/private"));
        assert!(walk.is_obscured("docs/private/plan.md"));
        assert!(walk.is_obscured("notes.md"));
        assert!(!walk.is_obscured("docs/private-ish.md"));
        assert!(!walk.is_obscured("docs/public/plan.md"));

        let whole = WalkOutcome {
            files: Vec::new(),
            unreadable: vec![String::new()],
        };
        assert!(whole.is_obscured("anything/at/all.md"));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("secret.md"), "s").unwrap();
        std::fs::write(dir.path().join("open.md"), "o").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not bind a privileged user.
        if std::fs::read_dir(&locked).is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let walk = walk_source(&source(dir.path(), &[], &[])).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let rel: Vec<&str> = walk.files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(rel, vec!["open.md"]);
        assert_eq!(walk.unreadable, vec!["locked".to_string()]);
        assert!(walk.is_obscured("locked/secret.md"));
    }

    #[test]
    fn bad_glob_is_rejected() {
        assert!(matches!(
            build_globset(&["a[".to_string()]),
            Err(EngineError::InvalidPattern { .. })
        ));
    }
}
