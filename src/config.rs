// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::lsp::registry::{ServerDescriptor, ServerRegistry};

/// Top-level configuration: pool limits plus the server table.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Time allowed for the `initialize` handshake, in milliseconds (default: 5000)
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Per-request timeout in milliseconds (default: 2000).
    /// Slow-starting servers are better served by 5000-10000.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum number of live server connections (default: 10)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Server definitions keyed by id (e.g., "rust", "python").
    /// Merged over the built-in table; an entry with the same id replaces it.
    #[serde(default)]
    pub server: BTreeMap<String, ServerConfig>,
}

/// One `[server.<id>]` table.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// The command to execute (e.g., "rust-analyzer")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Language id for `didOpen`; defaults to the server id
    #[serde(default)]
    pub language_id: Option<String>,

    /// File extensions handled by this server (".py" or "py")
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Marker files that identify a workspace root
    #[serde(default)]
    pub root_markers: Vec<String>,

    /// Language id overrides for individual extensions
    #[serde(default)]
    pub extension_languages: BTreeMap<String, String>,

    /// Initialization options to pass to the LSP server
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

/// Timeouts and capacity for the client pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Deadline for the `initialize` handshake.
    pub init_timeout: Duration,
    /// Default deadline for a single request.
    pub request_timeout: Duration,
    /// Maximum number of pooled connections.
    pub max_clients: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_millis(default_init_timeout_ms()),
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            max_clients: default_max_pool_size(),
        }
    }
}

const fn default_init_timeout_ms() -> u64 {
    5000
}

const fn default_request_timeout_ms() -> u64 {
    2000
}

const fn default_max_pool_size() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_pool_size: default_max_pool_size(),
            server: builtin_servers(),
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source cannot be read or parsed.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("init_timeout_ms", default_init_timeout_ms())?
            .set_default("request_timeout_ms", default_request_timeout_ms())?
            .set_default("max_pool_size", default_max_pool_size() as u64)?;

        // 2. Load from user config directory (~/.config/lspool/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("lspool").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (LSPOOL_REQUEST_TIMEOUT_MS, etc.)
        builder = builder.add_source(config::Environment::with_prefix("LSPOOL"));

        let loaded: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(loaded.with_builtin_servers())
    }

    /// Fills in built-in servers that the loaded configuration does not override.
    #[must_use]
    pub fn with_builtin_servers(mut self) -> Self {
        for (id, server) in builtin_servers() {
            self.server.entry(id).or_insert(server);
        }
        self
    }

    /// Pool timeouts and capacity derived from this configuration.
    #[must_use]
    pub const fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_clients: self.max_pool_size,
        }
    }

    /// Builds the extension registry from the server table.
    #[must_use]
    pub fn registry(&self) -> ServerRegistry {
        ServerRegistry::new(
            self.server
                .iter()
                .map(|(id, server)| ServerDescriptor::from_config(id, server))
                .collect(),
        )
    }
}

/// Install hint for a built-in server, shown when spawning it fails.
#[must_use]
pub fn install_hint(server_id: &str) -> Option<&'static str> {
    match server_id {
        "python" => Some("pip install python-lsp-server"),
        "typescript" => Some("npm install -g typescript-language-server typescript"),
        "go" => Some("go install golang.org/x/tools/gopls@latest"),
        "rust" => Some("rustup component add rust-analyzer"),
        _ => None,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn builtin_servers() -> BTreeMap<String, ServerConfig> {
    let mut servers = BTreeMap::new();

    servers.insert(
        "python".to_string(),
        ServerConfig {
            command: "pylsp".to_string(),
            extensions: strings(&[".py", ".pyi"]),
            root_markers: strings(&[
                "pyproject.toml",
                "setup.py",
                "setup.cfg",
                "requirements.txt",
                "Pipfile",
                ".git",
            ]),
            ..ServerConfig::default()
        },
    );

    servers.insert(
        "typescript".to_string(),
        ServerConfig {
            command: "typescript-language-server".to_string(),
            args: strings(&["--stdio"]),
            extensions: strings(&[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs"]),
            root_markers: strings(&["package.json", "tsconfig.json", "jsconfig.json", ".git"]),
            extension_languages: [
                (".tsx", "typescriptreact"),
                (".js", "javascript"),
                (".jsx", "javascriptreact"),
                (".mjs", "javascript"),
                (".cjs", "javascript"),
            ]
            .into_iter()
            .map(|(ext, lang)| (ext.to_string(), lang.to_string()))
            .collect(),
            ..ServerConfig::default()
        },
    );

    servers.insert(
        "go".to_string(),
        ServerConfig {
            command: "gopls".to_string(),
            extensions: strings(&[".go"]),
            root_markers: strings(&["go.mod", "go.work", ".git"]),
            ..ServerConfig::default()
        },
    );

    servers.insert(
        "rust".to_string(),
        ServerConfig {
            command: "rust-analyzer".to_string(),
            extensions: strings(&[".rs"]),
            root_markers: strings(&["Cargo.toml", ".git"]),
            ..ServerConfig::default()
        },
    );

    servers
}
