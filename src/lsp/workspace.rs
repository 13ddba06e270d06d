// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Workspace root detection and path/URI conversion.

use lsp_types::Uri;
use std::path::{Path, PathBuf};

use crate::error::{LspError, Result};

/// Makes `path` absolute, resolving symlinks when the path exists.
#[must_use]
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}

/// Converts an absolute path into a `file://` URI.
///
/// # Errors
///
/// Returns [`LspError::InvalidPath`] for relative paths or paths that do not
/// form a valid URI.
pub fn path_to_uri(path: &Path) -> Result<Uri> {
    let url = url::Url::from_file_path(path)
        .map_err(|()| LspError::InvalidPath(path.to_path_buf()))?;
    url.as_str()
        .parse()
        .map_err(|_| LspError::InvalidPath(path.to_path_buf()))
}

/// Converts a `file://` URI back into a path. Returns `None` for other schemes.
#[must_use]
pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    url::Url::parse(uri.as_str()).ok()?.to_file_path().ok()
}

/// Finds the workspace root for `file`.
///
/// Walks from the file's directory upward and returns the first directory
/// containing any of `markers`. Falls back to the file's own directory.
#[must_use]
pub fn find_root(file: &Path, markers: &[String]) -> PathBuf {
    let file = absolutize(file);
    let start = if file.is_dir() {
        file.clone()
    } else {
        file.parent().map_or_else(|| file.clone(), Path::to_path_buf)
    };

    let found = start
        .ancestors()
        .find(|dir| markers.iter().any(|marker| dir.join(marker).exists()));

    found.map_or(start.clone(), Path::to_path_buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for clear failure messages")]
mod tests {
    use super::*;

    fn markers(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_finds_nearest_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("pyproject.toml"), "").unwrap();
        let nested = root.join("pkg").join("sub");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("mod.py");
        std::fs::write(&file, "x = 1\n").unwrap();

        assert_eq!(find_root(&file, &markers(&["pyproject.toml"])), root);
    }

    #[test]
    fn test_inner_marker_wins() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().canonicalize().unwrap();
        std::fs::create_dir(outer.join(".git")).unwrap();
        let inner = outer.join("crates").join("core");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join("Cargo.toml"), "").unwrap();
        let file = inner.join("lib.rs");
        std::fs::write(&file, "").unwrap();

        assert_eq!(find_root(&file, &markers(&["Cargo.toml", ".git"])), inner);
    }

    #[test]
    fn test_falls_back_to_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let file = base.join("lonely.py");
        std::fs::write(&file, "").unwrap();

        // A marker name nothing on disk will carry.
        let root = find_root(&file, &markers(&["lspool-no-such-marker.cfg"]));
        assert_eq!(root, base);
    }

    #[test]
    fn test_uri_roundtrip_escapes_spaces() {
        let path = Path::new("/tmp/my project/src/main.rs");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri.as_str(), "file:///tmp/my%20project/src/main.rs");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_relative_path_is_not_a_uri() {
        let err = path_to_uri(Path::new("src/main.rs")).unwrap_err();
        assert_eq!(err, LspError::InvalidPath(PathBuf::from("src/main.rs")));
    }

    #[test]
    fn test_missing_file_still_resolves() {
        let root = find_root(
            Path::new("/nonexistent/dir/file.py"),
            &markers(&["lspool-no-such-marker.cfg"]),
        );
        assert_eq!(root, PathBuf::from("/nonexistent/dir"));
    }
}
