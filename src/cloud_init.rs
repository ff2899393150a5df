//! Cloud-init user-data validation.
//!
//! The provisioning call hands the provider CLI a user-data file path, so a
//! missing or empty payload would otherwise surface only after an instance
//! was already billed. This module validates the configured file up front and
//! returns the expanded path to pass on.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::channel::expand_tilde;

/// Errors raised while validating cloud-init user-data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when the configured file path is empty or only whitespace.
    #[error("cloud-init user-data file path must not be empty")]
    FilePathEmpty,
    /// Raised when the file resolves to empty or only whitespace.
    #[error("cloud-init user-data file `{path}` must not be empty")]
    FileEmpty {
        /// Expanded path of the empty file.
        path: String,
    },
    /// Raised when reading the file fails.
    #[error("failed to read cloud-init user-data file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Validates the configured cloud-init file and returns its expanded path.
///
/// The content is read only for the emptiness check; the path itself is what
/// the provider CLI consumes.
///
/// # Errors
///
/// Returns [`CloudInitError`] when the path is empty or the file is missing,
/// unreadable, or blank.
pub fn resolve_user_data_file(path: &str) -> Result<String, CloudInitError> {
    if path.trim().is_empty() {
        return Err(CloudInitError::FilePathEmpty);
    }

    let expanded = expand_tilde(path);
    let content =
        read_to_string_ambient(&expanded).map_err(|message| CloudInitError::FileRead {
            path: expanded.clone(),
            message,
        })?;

    if content.trim().is_empty() {
        return Err(CloudInitError::FileEmpty { path: expanded });
    }

    Ok(expanded)
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_path_is_rejected() {
        assert_eq!(
            resolve_user_data_file("   "),
            Err(CloudInitError::FilePathEmpty)
        );
    }

    #[test]
    fn missing_file_reports_read_failure() {
        let err = resolve_user_data_file("/definitely/not/here.yaml").expect_err("missing file");
        assert!(matches!(err, CloudInitError::FileRead { .. }));
    }

    #[test]
    fn blank_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cloud-init.yaml");
        std::fs::write(&path, "  \n\n").expect("write payload");

        let err =
            resolve_user_data_file(&path.to_string_lossy()).expect_err("blank payload");
        assert!(matches!(err, CloudInitError::FileEmpty { .. }));
    }

    #[test]
    fn valid_file_resolves_to_its_expanded_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cloud-init.yaml");
        let mut file = std::fs::File::create(&path).expect("create payload");
        file.write_all(b"#cloud-config\npackages:\n  - git\n")
            .expect("write payload");

        let resolved =
            resolve_user_data_file(&path.to_string_lossy()).expect("valid payload");
        assert_eq!(resolved, path.to_string_lossy());
    }
}
