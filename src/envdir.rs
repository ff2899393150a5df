//! Environment-file directory loading.
//!
//! The CLI accepts a directory of `KEY=VALUE` files whose variables are
//! applied to the process environment before the run. Files are read in
//! name-sorted order, so a key defined in a later file overrides earlier
//! definitions; variables already present in the process environment are
//! never overridden.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::channel::expand_tilde;

/// Errors raised while loading an environment directory.
#[derive(Debug, Error)]
pub enum EnvDirError {
    /// Raised when the path does not exist or is not a directory.
    #[error("environment directory `{path}` does not exist or is not a directory")]
    NotADirectory {
        /// Path that was expected to be a directory.
        path: String,
    },
    /// Raised when the directory or one of its files cannot be read.
    #[error("failed to read environment directory `{path}`: {message}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

/// Reads every file in `path` in name-sorted order and parses simple
/// `KEY=VALUE` lines into a flat mapping.
///
/// Double-quoted values unescape `\"`, `\n`, and `\\`; unquoted and
/// single-quoted values are taken literally. Blank lines, comments, and
/// lines without `=` are ignored.
///
/// # Errors
///
/// Returns [`EnvDirError`] when the directory is missing or unreadable.
pub fn load_env_dir(path: &str) -> Result<BTreeMap<String, String>, EnvDirError> {
    let expanded = expand_tilde(path);
    let meta = std::fs::metadata(&expanded).map_err(|_| EnvDirError::NotADirectory {
        path: expanded.clone(),
    })?;
    if !meta.is_dir() {
        return Err(EnvDirError::NotADirectory { path: expanded });
    }

    let mut files = Vec::new();
    let entries = std::fs::read_dir(&expanded).map_err(|err| EnvDirError::Read {
        path: expanded.clone(),
        message: err.to_string(),
    })?;
    for item in entries {
        let entry = item.map_err(|err| EnvDirError::Read {
            path: expanded.clone(),
            message: err.to_string(),
        })?;
        if entry.file_type().is_ok_and(|kind| kind.is_file()) {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut vars = BTreeMap::new();
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|err| EnvDirError::Read {
            path: file.to_string_lossy().into_owned(),
            message: err.to_string(),
        })?;
        for line in content.lines() {
            if let Some((key, value)) = parse_line(line) {
                vars.insert(key, value);
            }
        }
    }

    Ok(vars)
}

/// Applies `vars` to the process environment, skipping names that are
/// already set so operator overrides always win.
///
/// Must be called while the process is still single-threaded; `main` runs it
/// before the async runtime is constructed.
pub fn apply_missing(vars: &BTreeMap<String, String>) {
    for (key, value) in vars {
        if std::env::var_os(key).is_none() {
            // SAFETY: runs before the runtime's worker threads are spawned,
            // so no other thread can read the environment concurrently.
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let (key, raw_value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    Some((key.to_owned(), parse_value(raw_value.trim())))
}

fn parse_value(raw: &str) -> String {
    if let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return unescape_double_quoted(inner);
    }
    if let Some(inner) = raw
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return inner.to_owned();
    }
    raw.to_owned()
}

fn unescape_double_quoted(inner: &str) -> String {
    let mut result = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            match ch {
                'n' => result.push('\n'),
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                other => {
                    result.push('\\');
                    result.push(other);
                }
            }
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            result.push(ch);
        }
    }
    if escaped {
        result.push('\\');
    }
    result
}
