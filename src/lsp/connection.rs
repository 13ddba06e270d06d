// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! One language server process and the framed channel to it.
//!
//! A [`Connection`] owns the child process, serializes writes to its stdin,
//! and runs a single reader task that decodes frames from its stdout. Each
//! response is routed through the [`Correlator`] to whichever caller is
//! waiting for its id, so any number of requests can be in flight at once.

use bytes::BytesMut;
use lsp_types::{
    ClientCapabilities, Diagnostic, DynamicRegistrationClientCapabilities, GotoCapability,
    HoverClientCapabilities, InitializeParams, InitializeResult, InitializedParams, MarkupKind,
    PublishDiagnosticsClientCapabilities, PublishDiagnosticsParams,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, Uri, WorkspaceFolder,
};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::correlator::Correlator;
use super::protocol::{
    self, Incoming, NotificationMessage, RequestId, RequestMessage, ResponseError,
    ResponseMessage,
};
use super::registry::ServerDescriptor;
use super::state::{ConnectionState, StateCell};
use super::workspace::path_to_uri;
use crate::error::{LspError, Result};

/// Cached diagnostics published by the server, keyed by document URI.
pub type DiagnosticsCache = Arc<Mutex<HashMap<Uri, Vec<Diagnostic>>>>;

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// How long `shutdown` waits for the server to answer.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the process gets to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// JSON-RPC `MethodNotFound`.
const METHOD_NOT_FOUND: i64 = -32601;

/// A live connection to one language server process.
pub struct Connection {
    server_id: String,
    next_id: AtomicI64,
    stdin: SharedStdin,
    correlator: Arc<Correlator>,
    state: Arc<StateCell>,
    diagnostics: DiagnosticsCache,
    diagnostics_published: Arc<Notify>,
    child: Mutex<Child>,
    reader_handle: JoinHandle<()>,
}

impl Connection {
    /// Spawns the server process in `root` and starts the reader task.
    ///
    /// The connection is left in [`ConnectionState::Created`]; call
    /// [`Connection::initialize`] before issuing requests.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::ServerSpawnFailure`] if the process cannot be
    /// started or its pipes cannot be captured.
    pub fn spawn(descriptor: &ServerDescriptor, root: &Path) -> Result<Self> {
        let spawn_failure = |reason: String| LspError::ServerSpawnFailure {
            command: descriptor.command.clone(),
            reason,
        };

        let mut child = Command::new(&descriptor.command)
            .args(&descriptor.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failure(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failure("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failure("stdout not captured".to_string()))?;

        debug!(
            "Spawned {} (pid {:?}) in {}",
            descriptor.command,
            child.id(),
            root.display()
        );

        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let correlator = Arc::new(Correlator::new());
        let state = Arc::new(StateCell::new(ConnectionState::Created));
        let diagnostics: DiagnosticsCache = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics_published = Arc::new(Notify::new());

        let reader_handle = tokio::spawn(Self::reader_task(
            descriptor.id.clone(),
            stdout,
            stdin.clone(),
            correlator.clone(),
            state.clone(),
            diagnostics.clone(),
            diagnostics_published.clone(),
        ));

        Ok(Self {
            server_id: descriptor.id.clone(),
            next_id: AtomicI64::new(1),
            stdin,
            correlator,
            state,
            diagnostics,
            diagnostics_published,
            child: Mutex::new(child),
            reader_handle,
        })
    }

    /// Background task that reads frames and routes them.
    async fn reader_task(
        server_id: String,
        stdout: ChildStdout,
        stdin: SharedStdin,
        correlator: Arc<Correlator>,
        state: Arc<StateCell>,
        diagnostics: DiagnosticsCache,
        diagnostics_published: Arc<Notify>,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = BytesMut::with_capacity(8192);

        let outcome = 'read: loop {
            let mut temp = [0u8; 4096];
            match reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("{} stdout closed", server_id);
                    break LspError::ConnectionClosed;
                }
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
                Err(e) => {
                    error!("Error reading from {} stdout: {}", server_id, e);
                    break LspError::ConnectionClosed;
                }
            }

            loop {
                let body = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(body)) => body,
                    Ok(None) => break,
                    Err(e) => break 'read e,
                };
                trace!("Received LSP message: {}", body);

                let message = match Incoming::parse(&body) {
                    Ok(message) => message,
                    Err(e) => break 'read e,
                };

                match message {
                    Incoming::Response(response) => {
                        correlator.fulfill(response).await;
                    }
                    Incoming::Request(request) => {
                        Self::reject_server_request(&stdin, request).await;
                    }
                    Incoming::Notification(notification) => {
                        Self::handle_notification(
                            &notification,
                            &diagnostics,
                            &diagnostics_published,
                        )
                        .await;
                    }
                }
            }
        };

        let next = match outcome {
            LspError::ProtocolViolation(ref reason) => {
                warn!("{} violated the protocol: {}", server_id, reason);
                state
                    .transition(
                        &[ConnectionState::Initializing, ConnectionState::Ready],
                        ConnectionState::Broken,
                    )
                    .map(|_| ConnectionState::Broken)
            }
            _ => None,
        };
        if next.is_none() && !state.get().is_terminal() {
            state.set(ConnectionState::Closed);
        }

        correlator.fail_all(&outcome).await;
        diagnostics_published.notify_waiters();
        warn!(
            "{} reader task exiting - connection {}",
            server_id,
            state.get()
        );
    }

    /// Answers a server-originated request with `MethodNotFound` so the
    /// server does not block waiting for us.
    async fn reject_server_request(stdin: &SharedStdin, request: RequestMessage) {
        debug!(
            "Received server request: {} (id: {:?})",
            request.method, request.id
        );

        let response = ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(request.id),
            result: None,
            error: Some(ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method '{}' not supported by client", request.method),
                data: None,
            }),
        };

        match protocol::encode_message(&response) {
            Ok(frame) => {
                if let Err(e) = write_frame(stdin, &frame).await {
                    warn!("Failed to answer server request: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode response: {}", e),
        }
    }

    /// Handles incoming LSP notifications.
    async fn handle_notification(
        notification: &NotificationMessage,
        diagnostics: &DiagnosticsCache,
        diagnostics_published: &Notify,
    ) {
        match notification.method.as_str() {
            "textDocument/publishDiagnostics" => {
                if let Ok(params) =
                    serde_json::from_value::<PublishDiagnosticsParams>(notification.params.clone())
                {
                    debug!(
                        "Received {} diagnostics for {:?}",
                        params.diagnostics.len(),
                        params.uri.as_str()
                    );
                    diagnostics
                        .lock()
                        .await
                        .insert(params.uri, params.diagnostics);
                    diagnostics_published.notify_waiters();
                } else {
                    warn!("Failed to parse publishDiagnostics params");
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(message) = notification.params.get("message").and_then(|m| m.as_str()) {
                    debug!("LSP server message: {}", message);
                }
            }
            _ => {
                trace!(
                    "Ignoring notification: {} params={}",
                    notification.method, notification.params
                );
            }
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`LspError::NotReady`] if the connection does not accept `method` in
    ///   its current state.
    /// - [`LspError::RequestTimeout`] if no response arrives within `timeout`.
    ///   The server is not told to cancel the work.
    /// - [`LspError::ServerError`] if the server answers with an error object.
    /// - [`LspError::ConnectionClosed`] or [`LspError::ProtocolViolation`] if
    ///   the connection dies while the request is pending.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let state = self.state.get();
        let accepted = match method {
            "initialize" => state == ConnectionState::Initializing,
            "shutdown" => matches!(
                state,
                ConnectionState::Ready | ConnectionState::ShuttingDown
            ),
            _ => state == ConnectionState::Ready,
        };
        if !accepted {
            return Err(LspError::NotReady(state, method.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame =
            protocol::encode_message(&RequestMessage::new(RequestId::Number(id), method, params))?;

        let rx = self.correlator.register(id, method, timeout).await;

        // The reader may have failed everything just before we registered.
        if self.state.get().is_terminal() {
            self.correlator.forget(id).await;
            return Err(LspError::ConnectionClosed);
        }

        if let Err(e) = write_frame(&self.stdin, &frame).await {
            self.correlator.forget(id).await;
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => completion?,
            Ok(Err(_)) => return Err(LspError::ConnectionClosed),
            Err(_) => {
                self.correlator.forget(id).await;
                return Err(LspError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(LspError::ServerError {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Sends a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`LspError::NotReady`] before the process is spawned or after it
    /// is gone, and [`LspError::ConnectionClosed`] if the write fails.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let state = self.state.get();
        if state == ConnectionState::Created || state.is_terminal() {
            return Err(LspError::NotReady(state, method.to_string()));
        }

        let frame = protocol::encode_message(&NotificationMessage::new(method, params))?;
        write_frame(&self.stdin, &frame).await
    }

    /// Performs the `initialize` handshake and sends `initialized`.
    ///
    /// On any failure the connection is marked [`ConnectionState::Broken`] and
    /// the process is killed.
    ///
    /// # Errors
    ///
    /// - [`LspError::InitializationTimeout`] if the server does not answer in
    ///   time.
    /// - [`LspError::InitializationFailed`] for error responses, early exits
    ///   and unparseable results.
    /// - [`LspError::ProtocolViolation`] if the server sends garbage.
    pub async fn initialize(
        &self,
        root: &Path,
        initialization_options: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<InitializeResult> {
        if self
            .state
            .transition(&[ConnectionState::Created], ConnectionState::Initializing)
            .is_none()
        {
            // The server may already have exited before the handshake began.
            return Err(LspError::InitializationFailed(format!(
                "connection is {}",
                self.state.get()
            )));
        }

        match self.handshake(root, initialization_options, timeout).await {
            Ok(result) => {
                info!("{} ready for {}", self.server_id, root.display());
                Ok(result)
            }
            Err(e) => {
                warn!("{} failed to initialize: {}", self.server_id, e);
                if !self.state.get().is_terminal() {
                    self.state.set(ConnectionState::Broken);
                }
                self.kill().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        root: &Path,
        initialization_options: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<InitializeResult> {
        let params = initialize_params(root, initialization_options)?;
        let params = serde_json::to_value(params)
            .map_err(|e| LspError::InitializationFailed(format!("cannot encode params: {e}")))?;

        let value = self
            .request("initialize", params, timeout)
            .await
            .map_err(|e| match e {
                LspError::RequestTimeout { .. } => LspError::InitializationTimeout(timeout),
                LspError::ProtocolViolation(_) => e,
                other => LspError::InitializationFailed(other.to_string()),
            })?;

        let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
            LspError::InitializationFailed(format!("invalid initialize result: {e}"))
        })?;

        if self
            .state
            .transition(&[ConnectionState::Initializing], ConnectionState::Ready)
            .is_none()
        {
            return Err(LspError::InitializationFailed(format!(
                "connection became {} during handshake",
                self.state.get()
            )));
        }

        self.notify("initialized", serde_json::to_value(InitializedParams {}).unwrap_or_default())
            .await?;

        Ok(result)
    }

    /// Sends `shutdown` and `exit`, closes stdin, and waits for the process.
    ///
    /// Never fails: a server that does not cooperate is killed after a grace
    /// period.
    pub async fn shutdown(&self) {
        let previous = self.state.transition(
            &[
                ConnectionState::Created,
                ConnectionState::Initializing,
                ConnectionState::Ready,
            ],
            ConnectionState::ShuttingDown,
        );

        if previous == Some(ConnectionState::Ready) {
            if let Err(e) = self
                .request("shutdown", serde_json::Value::Null, SHUTDOWN_TIMEOUT)
                .await
            {
                warn!("{} did not acknowledge shutdown: {}", self.server_id, e);
            }
            if let Err(e) = self.notify("exit", serde_json::Value::Null).await {
                debug!("Failed to send exit to {}: {}", self.server_id, e);
            }
        }

        // Closing stdin tells well-behaved servers to go away.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("{} exited with {}", self.server_id, status),
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.server_id, e),
            Err(_) => {
                warn!("{} did not exit in time, killing it", self.server_id);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.server_id, e);
                }
            }
        }
        drop(child);

        if !self.state.get().is_terminal() {
            self.state.set(ConnectionState::Closed);
        }
    }

    /// Kills the process without the shutdown handshake.
    async fn kill(&self) {
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!("Failed to kill {}: {}", self.server_id, e);
        }
    }

    /// Tears down a connection the manager no longer trusts.
    pub async fn abandon(&self) {
        if !self.state.get().is_terminal() {
            self.state.set(ConnectionState::Broken);
        }
        self.kill().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Returns true while the connection can serve requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.get() == ConnectionState::Ready
    }

    /// Id of the server descriptor this connection was spawned from.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Diagnostics most recently published for `uri`, if any.
    pub async fn diagnostics(&self, uri: &Uri) -> Option<Vec<Diagnostic>> {
        self.diagnostics.lock().await.get(uri).cloned()
    }

    /// Waits until the server has published diagnostics for `uri`.
    ///
    /// Returns whatever is cached once they arrive, or an empty list if
    /// `timeout` elapses or the connection dies first.
    pub async fn wait_for_diagnostics(&self, uri: &Uri, timeout: Duration) -> Vec<Diagnostic> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.diagnostics_published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.diagnostics(uri).await {
                return found;
            }
            if self.state.get().is_terminal() {
                return Vec::new();
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Forgets cached diagnostics for `uri`.
    pub async fn clear_diagnostics(&self, uri: &Uri) {
        self.diagnostics.lock().await.remove(uri);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Writes one pre-encoded frame. Writes are serialized by the stdin lock.
async fn write_frame(stdin: &SharedStdin, frame: &[u8]) -> Result<()> {
    let mut guard = stdin.lock().await;
    let Some(stdin) = guard.as_mut() else {
        return Err(LspError::ConnectionClosed);
    };

    if let Err(e) = stdin.write_all(frame).await {
        debug!("Write to server failed: {}", e);
        return Err(LspError::ConnectionClosed);
    }
    if let Err(e) = stdin.flush().await {
        debug!("Flush to server failed: {}", e);
        return Err(LspError::ConnectionClosed);
    }
    Ok(())
}

fn initialize_params(
    root: &Path,
    initialization_options: Option<serde_json::Value>,
) -> Result<InitializeParams> {
    let root_uri = path_to_uri(root)?;

    let capabilities = ClientCapabilities {
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(false),
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(true),
            }),
            references: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        ..Default::default()
    };

    #[allow(
        deprecated,
        reason = "rootUri is deprecated but still read by servers that ignore workspaceFolders"
    )]
    let params = InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: Some(root_uri.clone()),
        initialization_options,
        capabilities,
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root_uri,
            name: root
                .file_name()
                .map_or_else(|| "workspace".to_string(), |s| s.to_string_lossy().to_string()),
        }]),
        ..Default::default()
    };

    Ok(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for clear failure messages")]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_carry_root_and_capabilities() {
        let params = initialize_params(Path::new("/work/project"), None).unwrap();
        let value = serde_json::to_value(&params).unwrap();

        assert_eq!(value["rootUri"], "file:///work/project");
        assert_eq!(value["workspaceFolders"][0]["name"], "project");
        assert_eq!(
            value["capabilities"]["textDocument"]["hover"]["contentFormat"],
            serde_json::json!(["markdown", "plaintext"])
        );
        assert_eq!(
            value["capabilities"]["textDocument"]["references"]["dynamicRegistration"],
            false
        );
    }

    #[test]
    fn test_initialize_params_pass_options_through() {
        let options = serde_json::json!({ "cargo": { "features": "all" } });
        let params = initialize_params(Path::new("/work"), Some(options.clone())).unwrap();
        assert_eq!(params.initialization_options, Some(options));
    }
}
