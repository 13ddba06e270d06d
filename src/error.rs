// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy for language server operations.
//!
//! Every failure a caller can observe is one of these variants. The manager
//! renders them into the `error` field of its structured results, so the
//! `Display` text is user-facing.

use std::path::PathBuf;
use std::time::Duration;

use crate::lsp::state::ConnectionState;

/// Errors produced while talking to a language server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LspError {
    /// The requested file does not exist or cannot be read.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// No configured server handles the file's extension.
    #[error("No server available for '{extension}' files. Supported: {}", .supported.join(", "))]
    UnsupportedExtension {
        /// The extension that was looked up, including its leading dot.
        extension: String,
        /// Every extension the registry knows about, in registry order.
        supported: Vec<String>,
    },

    /// The server process could not be started.
    #[error("Failed to spawn language server '{command}': {reason}")]
    ServerSpawnFailure {
        /// The command that was executed.
        command: String,
        /// Why spawning failed, including an install hint when one is known.
        reason: String,
    },

    /// The `initialize` handshake did not complete in time.
    #[error("Language server did not finish initializing within {}ms", .0.as_millis())]
    InitializationTimeout(Duration),

    /// The `initialize` handshake failed (error response or early exit).
    #[error("Language server failed to initialize: {0}")]
    InitializationFailed(String),

    /// A request did not receive a response in time.
    #[error("Request '{method}' timed out after {}ms", .timeout.as_millis())]
    RequestTimeout {
        /// The method of the timed-out request.
        method: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The server sent bytes that do not form a valid frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server process closed its output stream.
    #[error("Language server closed the connection")]
    ConnectionClosed,

    /// The server answered with a JSON-RPC error object.
    #[error("Language server error {code}: {message}")]
    ServerError {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the server.
        message: String,
    },

    /// The connection is not in a state that accepts the request.
    #[error("Connection is {0}, cannot send '{1}'")]
    NotReady(ConnectionState, String),

    /// The (server, workspace) pair failed before and is not retried.
    #[error("Server previously failed to initialize for this workspace")]
    BrokenServer,

    /// Every pooled connection is starting up or serving requests.
    #[error("All {0} pool slots are busy; retry once a request completes")]
    PoolExhausted(usize),

    /// A path could not be turned into a `file://` URI.
    #[error("Invalid path for URI: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl LspError {
    /// Returns true if this error means the connection can no longer be trusted
    /// and its key must not be retried.
    #[must_use]
    pub const fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::InitializationTimeout(_)
                | Self::InitializationFailed(_)
                | Self::ServerSpawnFailure { .. }
        )
    }
}

/// Result alias used across the LSP modules.
pub type Result<T, E = LspError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_extension_lists_everything() {
        let err = LspError::UnsupportedExtension {
            extension: ".xyz".to_string(),
            supported: vec![".py".to_string(), ".rs".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "No server available for '.xyz' files. Supported: .py, .rs"
        );
    }

    #[test]
    fn test_file_not_found_message() {
        let err = LspError::FileNotFound(PathBuf::from("/nonexistent/file.ext"));
        assert_eq!(err.to_string(), "File not found: /nonexistent/file.ext");
    }

    #[test]
    fn test_timeout_is_not_poisoning() {
        let err = LspError::RequestTimeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert!(!err.poisons_connection());
        assert_eq!(
            err.to_string(),
            "Request 'textDocument/hover' timed out after 250ms"
        );
        assert!(LspError::ProtocolViolation("bad header".to_string()).poisons_connection());
    }
}
