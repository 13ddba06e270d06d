// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Extension-keyed lookup of language server descriptors.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::{LspError, Result};

/// Markers used when a descriptor does not list its own.
pub const DEFAULT_ROOT_MARKERS: &[&str] = &[".git"];

/// Everything needed to spawn and talk to one kind of language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Stable identifier, e.g. `"python"`.
    pub id: String,
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Language id sent in `didOpen` unless an extension overrides it.
    pub language_id: String,
    /// Handled extensions, lower case, with their leading dot.
    pub extensions: Vec<String>,
    /// Files or directories that mark a workspace root.
    pub root_markers: Vec<String>,
    /// Per-extension language id overrides (".tsx" -> "typescriptreact").
    pub extension_languages: BTreeMap<String, String>,
    /// Passed verbatim as `initializationOptions`.
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerDescriptor {
    /// Builds a descriptor from its configuration table entry.
    #[must_use]
    pub fn from_config(id: &str, config: &ServerConfig) -> Self {
        let root_markers = if config.root_markers.is_empty() {
            DEFAULT_ROOT_MARKERS.iter().map(ToString::to_string).collect()
        } else {
            config.root_markers.clone()
        };

        Self {
            id: id.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            language_id: config.language_id.clone().unwrap_or_else(|| id.to_string()),
            extensions: config.extensions.iter().map(|e| normalize_extension(e)).collect(),
            root_markers,
            extension_languages: config
                .extension_languages
                .iter()
                .map(|(ext, lang)| (normalize_extension(ext), lang.clone()))
                .collect(),
            initialization_options: config.initialization_options.clone(),
        }
    }

    /// Language id to announce for `path`.
    #[must_use]
    pub fn language_id_for(&self, path: &Path) -> &str {
        self.extension_languages
            .get(&extension_of(path))
            .map_or(self.language_id.as_str(), String::as_str)
    }
}

/// Static lookup table from file extension to server descriptor.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<Arc<ServerDescriptor>>,
}

impl ServerRegistry {
    /// Creates a registry. Earlier descriptors win when extensions overlap.
    #[must_use]
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Finds the server responsible for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::UnsupportedExtension`] listing every supported
    /// extension when no descriptor claims the file's extension.
    pub fn resolve(&self, path: &Path) -> Result<Arc<ServerDescriptor>> {
        let extension = extension_of(path);

        self.servers
            .iter()
            .find(|server| server.extensions.contains(&extension))
            .cloned()
            .ok_or_else(|| LspError::UnsupportedExtension {
                extension,
                supported: self.supported_extensions(),
            })
    }

    /// Every extension the registry handles, in registry order.
    #[must_use]
    pub fn supported_extensions(&self) -> Vec<String> {
        self.servers
            .iter()
            .flat_map(|server| server.extensions.iter().cloned())
            .collect()
    }

    /// All descriptors, in registry order.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().map(AsRef::as_ref)
    }
}

/// Lower-cased extension of `path` with a leading dot, or `""` if it has none.
#[must_use]
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;

    fn descriptor(id: &str, extensions: &[&str]) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            command: format!("{id}-ls"),
            args: vec![],
            language_id: id.to_string(),
            extensions: extensions.iter().map(ToString::to_string).collect(),
            root_markers: vec![".git".to_string()],
            extension_languages: BTreeMap::new(),
            initialization_options: None,
        }
    }

    fn registry() -> ServerRegistry {
        ServerRegistry::new(vec![
            descriptor("python", &[".py", ".pyi"]),
            descriptor("rust", &[".rs"]),
        ])
    }

    #[test]
    fn test_resolve_by_extension() {
        let reg = registry();
        assert_eq!(reg.resolve(Path::new("/a/b.py")).unwrap().id, "python");
        assert_eq!(reg.resolve(Path::new("/a/lib.rs")).unwrap().id, "rust");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let reg = registry();
        assert_eq!(reg.resolve(Path::new("/a/STUB.PYI")).unwrap().id, "python");
    }

    #[test]
    fn test_unsupported_lists_exact_extensions() {
        let reg = registry();
        for path in ["/a/b.xyz", "/a/Makefile", "/a/b.py.bak"] {
            let err = reg.resolve(Path::new(path)).unwrap_err();
            let LspError::UnsupportedExtension { supported, .. } = &err else {
                panic!("expected UnsupportedExtension, got {err:?}");
            };
            assert_eq!(supported, &reg.supported_extensions());
            assert!(err.to_string().ends_with("Supported: .py, .pyi, .rs"));
        }
    }

    #[test]
    fn test_extension_without_dot_is_normalized() {
        let config = ServerConfig {
            command: "gopls".to_string(),
            extensions: vec!["GO".to_string()],
            ..ServerConfig::default()
        };
        let desc = ServerDescriptor::from_config("go", &config);
        assert_eq!(desc.extensions, vec![".go".to_string()]);
        assert_eq!(desc.language_id, "go");
        assert_eq!(desc.root_markers, vec![".git".to_string()]);
    }

    #[test]
    fn test_language_id_override() {
        let mut desc = descriptor("typescript", &[".ts", ".tsx"]);
        desc.extension_languages
            .insert(".tsx".to_string(), "typescriptreact".to_string());

        assert_eq!(desc.language_id_for(Path::new("a.ts")), "typescript");
        assert_eq!(desc.language_id_for(Path::new("a.tsx")), "typescriptreact");
    }
}
