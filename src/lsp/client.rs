// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Typed queries over a [`Connection`], with open-document tracking.

use lsp_types::{
    Diagnostic, DiagnosticSeverity, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    GotoDefinitionParams, GotoDefinitionResponse, HoverParams, Location, Position, Range,
    ReferenceContext, ReferenceParams, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, Uri,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::Connection;
use super::hover::{self, HoverResult};
use super::registry::ServerDescriptor;
use super::state::ConnectionState;
use super::workspace::{path_to_uri, uri_to_path};
use crate::error::{LspError, Result};

/// One source location reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionLocation {
    /// File containing the target, or the raw URI for non-file schemes.
    pub path: String,
    /// Range of the target.
    pub range: Range,
}

/// Outcome of a go-to-definition query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionResult {
    /// False only when the query itself failed.
    pub success: bool,
    /// Every target the server reported; empty when there is none.
    pub locations: Vec<DefinitionLocation>,
    /// Why the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DefinitionResult {
    /// A failed result.
    #[must_use]
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            locations: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of a find-references query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferencesResult {
    /// False only when the query itself failed.
    pub success: bool,
    /// Every reference the server reported.
    pub references: Vec<DefinitionLocation>,
    /// Number of references.
    pub count: usize,
    /// Distinct files containing references, sorted.
    pub files: Vec<String>,
    /// Why the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReferencesResult {
    fn from_locations(locations: Vec<Location>) -> Self {
        let references: Vec<DefinitionLocation> =
            locations.into_iter().map(DefinitionLocation::from).collect();
        let files: BTreeSet<&str> = references.iter().map(|r| r.path.as_str()).collect();
        let files = files.into_iter().map(ToString::to_string).collect();

        Self {
            success: true,
            count: references.len(),
            references,
            files,
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            references: Vec::new(),
            count: 0,
            files: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// One published diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEntry {
    /// Where the problem is.
    pub range: Range,
    /// `error`, `warning`, `information` or `hint`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// The message.
    pub message: String,
    /// Tool that produced it, e.g. `pyflakes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl From<Diagnostic> for DiagnosticEntry {
    fn from(diagnostic: Diagnostic) -> Self {
        let severity = diagnostic.severity.map(|s| {
            match s {
                DiagnosticSeverity::ERROR => "error",
                DiagnosticSeverity::WARNING => "warning",
                DiagnosticSeverity::INFORMATION => "information",
                _ => "hint",
            }
            .to_string()
        });

        Self {
            range: diagnostic.range,
            severity,
            message: diagnostic.message,
            source: diagnostic.source,
        }
    }
}

/// Outcome of a diagnostics query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsResult {
    /// False only when the query itself failed.
    pub success: bool,
    /// Diagnostics published for the file.
    pub diagnostics: Vec<DiagnosticEntry>,
    /// Number of error-severity entries.
    pub error_count: usize,
    /// Number of warning-severity entries.
    pub warning_count: usize,
    /// Why the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiagnosticsResult {
    fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let count = |severity: DiagnosticSeverity| {
            diagnostics
                .iter()
                .filter(|d| d.severity == Some(severity))
                .count()
        };
        let error_count = count(DiagnosticSeverity::ERROR);
        let warning_count = count(DiagnosticSeverity::WARNING);

        Self {
            success: true,
            diagnostics: diagnostics.into_iter().map(DiagnosticEntry::from).collect(),
            error_count,
            warning_count,
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            diagnostics: Vec::new(),
            error_count: 0,
            warning_count: 0,
            error: Some(error.to_string()),
        }
    }
}

/// An initialized language server plus the documents opened on it.
pub struct LspClient {
    connection: Connection,
    root: PathBuf,
    documents: Mutex<HashMap<PathBuf, i32>>,
}

impl LspClient {
    /// Spawns the server for `root` and completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns the spawn or initialization error; the process is already
    /// gone when this fails.
    pub async fn start(
        descriptor: &ServerDescriptor,
        root: &Path,
        init_timeout: Duration,
    ) -> Result<Self> {
        let connection = Connection::spawn(descriptor, root)?;
        connection
            .initialize(root, descriptor.initialization_options.clone(), init_timeout)
            .await?;

        Ok(Self {
            connection,
            root: root.to_path_buf(),
            documents: Mutex::new(HashMap::new()),
        })
    }

    /// Opens `path` on the server unless it is already open.
    ///
    /// The document table stays locked while `didOpen` is written, so no
    /// query for the file can reach the server ahead of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no URI form or the write fails.
    pub async fn ensure_open(&self, path: &Path, content: &str, language_id: &str) -> Result<Uri> {
        let uri = path_to_uri(path)?;

        let mut documents = self.documents.lock().await;
        if documents.contains_key(path) {
            return Ok(uri);
        }

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 1,
                text: content.to_string(),
            },
        };
        self.notify("textDocument/didOpen", params).await?;
        documents.insert(path.to_path_buf(), 1);
        drop(documents);

        debug!("Opened {} as {}", path.display(), language_id);
        Ok(uri)
    }

    /// Hover information at a zero-indexed position.
    ///
    /// An empty answer is a success carrying the "no information" text.
    ///
    /// # Errors
    ///
    /// Returns transport and server errors; see [`Connection::request`].
    pub async fn hover(
        &self,
        path: &Path,
        content: &str,
        language_id: &str,
        line: u32,
        character: u32,
        timeout: Duration,
    ) -> Result<HoverResult> {
        let uri = self.ensure_open(path, content, language_id).await?;
        let params = HoverParams {
            text_document_position_params: position_params(uri, line, character),
            work_done_progress_params: Default::default(),
        };

        let raw: serde_json::Value = self.request("textDocument/hover", params, timeout).await?;
        if raw.is_null() {
            return Ok(HoverResult::empty(Some(language_id.to_string())));
        }

        let normalized = hover::normalize_value(raw.get("contents"));
        if normalized.is_empty() {
            return Ok(HoverResult::empty(Some(language_id.to_string())));
        }

        let range = raw
            .get("range")
            .and_then(|r| serde_json::from_value::<Range>(r.clone()).ok());
        let language = normalized
            .language
            .unwrap_or_else(|| language_id.to_string());

        Ok(HoverResult::found(normalized.text, Some(language), range))
    }

    /// Definition targets of the symbol at a zero-indexed position.
    ///
    /// # Errors
    ///
    /// Returns transport and server errors; see [`Connection::request`].
    pub async fn definition(
        &self,
        path: &Path,
        content: &str,
        language_id: &str,
        line: u32,
        character: u32,
        timeout: Duration,
    ) -> Result<DefinitionResult> {
        let uri = self.ensure_open(path, content, language_id).await?;
        let params = GotoDefinitionParams {
            text_document_position_params: position_params(uri, line, character),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let response: Option<GotoDefinitionResponse> = self
            .request("textDocument/definition", params, timeout)
            .await?;

        let locations = match response {
            None => Vec::new(),
            Some(GotoDefinitionResponse::Scalar(location)) => vec![location.into()],
            Some(GotoDefinitionResponse::Array(locations)) => {
                locations.into_iter().map(DefinitionLocation::from).collect()
            }
            Some(GotoDefinitionResponse::Link(links)) => links
                .into_iter()
                .map(|link| DefinitionLocation {
                    path: display_uri(&link.target_uri),
                    range: link.target_selection_range,
                })
                .collect(),
        };

        Ok(DefinitionResult {
            success: true,
            locations,
            error: None,
        })
    }

    /// Every reference to the symbol at `position`.
    ///
    /// # Errors
    ///
    /// Returns transport and server errors; see [`Connection::request`].
    pub async fn references(
        &self,
        path: &Path,
        content: &str,
        language_id: &str,
        position: Position,
        include_declaration: bool,
        timeout: Duration,
    ) -> Result<ReferencesResult> {
        let uri = self.ensure_open(path, content, language_id).await?;
        let params = ReferenceParams {
            text_document_position: position_params(uri, position.line, position.character),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };

        let response: Option<Vec<Location>> = self
            .request("textDocument/references", params, timeout)
            .await?;
        Ok(ReferencesResult::from_locations(response.unwrap_or_default()))
    }

    /// Diagnostics the server publishes for `path`.
    ///
    /// Opens the file and waits up to `timeout` for a publication. A server
    /// that publishes nothing yields an empty, successful result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened on the server.
    pub async fn diagnostics(
        &self,
        path: &Path,
        content: &str,
        language_id: &str,
        timeout: Duration,
    ) -> Result<DiagnosticsResult> {
        let uri = self.ensure_open(path, content, language_id).await?;
        let diagnostics = self.connection.wait_for_diagnostics(&uri, timeout).await;
        Ok(DiagnosticsResult::from_diagnostics(diagnostics))
    }

    /// Closes `path` on the server. Does nothing if it is not open.
    ///
    /// # Errors
    ///
    /// Returns an error if the `didClose` write fails; the document is
    /// forgotten either way.
    pub async fn close(&self, path: &Path) -> Result<()> {
        if self.documents.lock().await.remove(path).is_none() {
            return Ok(());
        }

        let uri = path_to_uri(path)?;
        self.connection.clear_diagnostics(&uri).await;
        self.notify(
            "textDocument/didClose",
            DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri },
            },
        )
        .await
    }

    /// Closes every open document, logging failures.
    pub async fn close_all(&self) {
        let paths: Vec<PathBuf> = self.documents.lock().await.keys().cloned().collect();
        for path in paths {
            if let Err(e) = self.close(&path).await {
                debug!("Failed to close {}: {}", path.display(), e);
            }
        }
    }

    /// Closes all documents and runs the shutdown sequence.
    pub async fn shutdown(&self) {
        if self.connection.is_ready() {
            self.close_all().await;
        }
        self.connection.shutdown().await;
    }

    /// Kills the server without ceremony.
    pub async fn abandon(&self) {
        warn!(
            "Abandoning {} for {}",
            self.connection.server_id(),
            self.root.display()
        );
        self.connection.abandon().await;
    }

    /// Lifecycle state of the underlying connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Workspace root the server was started for.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of documents currently open.
    pub async fn open_document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// Version of an open document, if it is open.
    pub async fn document_version(&self, path: &Path) -> Option<i32> {
        self.documents.lock().await.get(path).copied()
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R> {
        let params = serde_json::to_value(params)
            .map_err(|e| LspError::ProtocolViolation(format!("cannot encode {method}: {e}")))?;
        let value = self.connection.request(method, params, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| LspError::ProtocolViolation(format!("invalid {method} result: {e}")))
    }

    async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let params = serde_json::to_value(params)
            .map_err(|e| LspError::ProtocolViolation(format!("cannot encode {method}: {e}")))?;
        self.connection.notify(method, params).await
    }
}

impl From<Location> for DefinitionLocation {
    fn from(location: Location) -> Self {
        Self {
            path: display_uri(&location.uri),
            range: location.range,
        }
    }
}

fn position_params(uri: Uri, line: u32, character: u32) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri },
        position: Position { line, character },
    }
}

fn display_uri(uri: &Uri) -> String {
    uri_to_path(uri).map_or_else(
        || uri.as_str().to_string(),
        |path| path.display().to_string(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for clear failure messages")]
mod tests {
    use super::*;

    fn diagnostic(severity: DiagnosticSeverity, message: &str) -> Diagnostic {
        Diagnostic {
            severity: Some(severity),
            message: message.to_string(),
            source: Some("mockls".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_diagnostics_counts() {
        let result = DiagnosticsResult::from_diagnostics(vec![
            diagnostic(DiagnosticSeverity::ERROR, "undefined name"),
            diagnostic(DiagnosticSeverity::WARNING, "unused import"),
            diagnostic(DiagnosticSeverity::WARNING, "line too long"),
            diagnostic(DiagnosticSeverity::HINT, "consider"),
        ]);

        assert!(result.success);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.warning_count, 2);
        assert_eq!(result.diagnostics[3].severity.as_deref(), Some("hint"));
    }

    #[test]
    fn test_location_uses_file_path() {
        let location = Location {
            uri: "file:///src/my%20lib.rs".parse().unwrap(),
            range: Range::default(),
        };
        assert_eq!(DefinitionLocation::from(location).path, "/src/my lib.rs");
    }

    #[test]
    fn test_references_list_each_file_once() {
        let at = |uri: &str, line: u32| Location {
            uri: uri.parse().unwrap(),
            range: Range {
                start: Position { line, character: 0 },
                end: Position { line, character: 3 },
            },
        };
        let result = ReferencesResult::from_locations(vec![
            at("file:///b.py", 4),
            at("file:///a.py", 1),
            at("file:///b.py", 9),
        ]);

        assert!(result.success);
        assert_eq!(result.count, 3);
        assert_eq!(result.files, vec!["/a.py", "/b.py"]);
        assert_eq!(result.references[0].path, "/b.py");
    }

    #[test]
    fn test_non_file_uri_is_kept() {
        let uri: Uri = "untitled:Untitled-1".parse().unwrap();
        assert_eq!(display_uri(&uri), "untitled:Untitled-1");
    }

    #[test]
    fn test_failure_serialization() {
        let value = serde_json::to_value(DefinitionResult::failure("boom")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "success": false, "locations": [], "error": "boom" })
        );
    }
}
