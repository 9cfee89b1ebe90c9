//! Workspace containment.
//!
//! Every path the sandbox touches is resolved to an absolute, symlink-free
//! form and must stay under the canonical workspace root. Error messages
//! never echo the offending path.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::schema::ErrorCode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContainmentError {
    #[error("path_escape: {what} resolves outside workspace_root")]
    Escape { what: &'static str },

    #[error("missing_input: {what} does not exist")]
    Missing { what: &'static str },

    #[error("path_escape: {what} could not be resolved")]
    Unresolvable { what: &'static str },
}

impl ContainmentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ContainmentError::Missing { .. } => ErrorCode::MissingInput,
            ContainmentError::Escape { .. } | ContainmentError::Unresolvable { .. } => {
                ErrorCode::PathEscape
            }
        }
    }
}

fn has_parent_segment(raw: &str) -> bool {
    // Checked on the raw string as well as on components so that both
    // separators are caught regardless of host platform.
    raw.split(['/', '\\']).any(|seg| seg == "..")
        || Path::new(raw).components().any(|c| matches!(c, Component::ParentDir))
}

fn canonicalize(path: &Path, what: &'static str) -> Result<PathBuf, ContainmentError> {
    std::fs::canonicalize(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ContainmentError::Missing { what },
        _ => ContainmentError::Unresolvable { what },
    })
}

/// Resolves the request's `workspace_root`. An empty value falls back to the
/// engine's configured root; a relative value is taken relative to it.
pub fn resolve_workspace_root(requested: &str, fallback: &Path) -> Result<PathBuf, ContainmentError> {
    let candidate = if requested.is_empty() {
        fallback.to_path_buf()
    } else {
        let p = Path::new(requested);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            fallback.join(p)
        }
    };
    let root = canonicalize(&candidate, "workspace_root")?;
    if !root.is_dir() {
        return Err(ContainmentError::Missing { what: "workspace_root" });
    }
    Ok(root)
}

/// Resolves `cwd` against a canonical workspace root.
pub fn resolve_cwd(root: &Path, cwd: &str) -> Result<PathBuf, ContainmentError> {
    if cwd.is_empty() || cwd == "." {
        return Ok(root.to_path_buf());
    }
    if has_parent_segment(cwd) {
        return Err(ContainmentError::Escape { what: "cwd" });
    }
    let p = Path::new(cwd);
    let candidate = if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    };
    let resolved = canonicalize(&candidate, "cwd")?;
    if !resolved.starts_with(root) {
        return Err(ContainmentError::Escape { what: "cwd" });
    }
    Ok(resolved)
}

/// Lexical check for a declared output, done before spawning.
pub fn check_output_path(output: &str) -> Result<(), ContainmentError> {
    if output.is_empty() || has_parent_segment(output) || Path::new(output).is_absolute() {
        return Err(ContainmentError::Escape { what: "output path" });
    }
    Ok(())
}

/// Post-run resolution of a declared output. `Ok(None)` when the command did
/// not produce the file.
pub fn resolve_output(root: &Path, cwd: &Path, output: &str) -> Result<Option<PathBuf>, ContainmentError> {
    check_output_path(output)?;
    let candidate = cwd.join(output);
    match std::fs::canonicalize(&candidate) {
        Ok(resolved) if resolved.starts_with(root) => Ok(Some(resolved)),
        Ok(_) => Err(ContainmentError::Escape { what: "output path" }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(_) => Err(ContainmentError::Unresolvable { what: "output path" }),
    }
}

/// `cwd` relative to the root, for trace events. Never absolute, so traces are
/// identical across machines.
pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => ".".to_string(),
    }
}
