//! Attachment path validation.
//!
//! Attachments must resolve inside the permitted root. Paths are normalized
//! lexically first (they need not exist yet). The deepest existing ancestor
//! is then canonicalized, so a symlink anywhere along the path cannot point
//! outside the root.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

/// An attachment that resolves outside the permitted root.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid attachment path: {path}")]
pub struct InvalidAttachment {
    pub path: String,
}

/// Resolve `.` and `..` without touching the filesystem. A `..` that cannot
/// be popped is kept so the caller can see the escape.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => components.push(component),
            },
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

fn absolute_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| {
        let joined = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(root)
        };
        normalize_lexical(&joined)
    })
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components below it. A dangling symlink on the way is an error.
fn canonicalize_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut missing: Vec<OsString> = Vec::new();
    let mut current = path;
    loop {
        match current.canonicalize() {
            Ok(real) => {
                return Ok(missing.iter().rev().fold(real, |acc, part| acc.join(part)));
            }
            Err(e) if current.symlink_metadata().is_ok() => return Err(e),
            Err(e) => match (current.parent(), current.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    current = parent;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Resolve `raw` against `root`, rejecting anything that escapes it.
pub fn resolve_attachment(root: &Path, raw: &str) -> Result<PathBuf, InvalidAttachment> {
    let invalid = || InvalidAttachment {
        path: raw.to_string(),
    };
    if raw.trim().is_empty() {
        return Err(invalid());
    }

    let base = absolute_root(root);
    // Joining an absolute path replaces the base entirely.
    let resolved = normalize_lexical(&base.join(raw));
    if resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(invalid());
    }

    let check = canonicalize_existing_prefix(&resolved).map_err(|_| invalid())?;
    if !check.starts_with(&base) {
        return Err(invalid());
    }
    Ok(resolved)
}

/// Validate every attachment, stopping at the first bad one.
pub fn resolve_attachments(
    root: &Path,
    raw: &[String],
) -> Result<Vec<PathBuf>, InvalidAttachment> {
    raw.iter().map(|p| resolve_attachment(root, p)).collect()
}
