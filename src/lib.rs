// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! lspool spawns language servers on demand and answers position queries
//! (hover, definition, diagnostics) against them.
//!
//! One server process is kept per (server, workspace root) pair, up to a
//! configurable pool size. Requests to the same server run concurrently over
//! its single stdio channel.

/// Configuration loading and the built-in server table.
pub mod config;
/// Error taxonomy shared by the LSP modules.
pub mod error;
/// LSP client implementation and server management.
pub mod lsp;

pub use error::LspError;
