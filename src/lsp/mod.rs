// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Typed queries over a connection, with open-document tracking.
pub mod client;
/// Server process ownership, framing and dispatch.
pub mod connection;
/// Request/response correlation by id.
pub mod correlator;
/// Hover content normalization and results.
pub mod hover;
/// Pool of clients keyed by server and workspace root.
pub mod manager;
/// LSP message protocol definitions.
pub mod protocol;
/// Extension-keyed server lookup.
pub mod registry;
/// Connection lifecycle state.
pub mod state;
/// Workspace root detection and URI conversion.
pub mod workspace;

pub use client::{DefinitionResult, DiagnosticsResult, LspClient, ReferencesResult};
pub use hover::{HoverContent, HoverResult, NO_HOVER_INFORMATION};
pub use manager::{ClientManager, ConnectionKey};
pub use registry::{ServerDescriptor, ServerRegistry};
pub use state::{ConnectionState, ServerStatus};
