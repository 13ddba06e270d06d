//! Integration tests for a single client talking to the mock server.
//!
//! Every test spawns the `mockls` binary built alongside this crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lspool::LspError;
use lspool::lsp::{ConnectionState, LspClient, NO_HOVER_INFORMATION, ServerDescriptor};
use tempfile::tempdir;

const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

fn mock_descriptor(args: &[&str]) -> ServerDescriptor {
    ServerDescriptor {
        id: "mock".to_string(),
        command: env!("CARGO_BIN_EXE_mockls").to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        language_id: "python".to_string(),
        extensions: vec![".py".to_string()],
        root_markers: vec!["mock.root".to_string()],
        extension_languages: BTreeMap::new(),
        initialization_options: None,
    }
}

fn write_file(root: &Path, name: &str, content: &str) -> (PathBuf, String) {
    let path = root.join(name);
    std::fs::write(&path, content).unwrap();
    (path, content.to_string())
}

#[tokio::test]
async fn test_start_and_hover() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "words.py", "alpha = 1\nbeta = 2\n");

    let client = LspClient::start(&mock_descriptor(&[]), &root, INIT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);

    let result = client
        .hover(&path, &content, "python", 1, 0, REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.contents.as_deref(), Some("```python\nbeta\n```"));
    assert_eq!(result.language.as_deref(), Some("python"));
    assert_eq!(result.range.unwrap().start.line, 1);

    client.shutdown().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_ensure_open_is_idempotent() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "a.py", "x = 1\n");

    let client = LspClient::start(&mock_descriptor(&[]), &root, INIT_TIMEOUT)
        .await
        .unwrap();

    let first = client.ensure_open(&path, &content, "python").await.unwrap();
    let second = client.ensure_open(&path, &content, "python").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.open_document_count().await, 1);
    assert_eq!(client.document_version(&path).await, Some(1));

    client.close(&path).await.unwrap();
    assert_eq!(client.open_document_count().await, 0);
    assert_eq!(client.document_version(&path).await, None);

    client.shutdown().await;
}

#[tokio::test]
async fn test_hover_past_end_of_file_is_sentinel() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "short.py", "a = 1\nb = 2\n");

    let client = LspClient::start(&mock_descriptor(&[]), &root, INIT_TIMEOUT)
        .await
        .unwrap();

    let result = client
        .hover(&path, &content, "python", 1000, 0, REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.contents.as_deref(), Some(NO_HOVER_INFORMATION));
    assert!(result.error.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_hovers_answered_out_of_order() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "many.py", "alpha = 1\nbeta = 2\ngamma = 3\n");

    // Line 0 waits longest, so responses arrive in reverse order.
    let client = Arc::new(
        LspClient::start(&mock_descriptor(&["--hover-stagger", "300"]), &root, INIT_TIMEOUT)
            .await
            .unwrap(),
    );
    client.ensure_open(&path, &content, "python").await.unwrap();

    let hover = |line: u32| {
        let client = client.clone();
        let path = path.clone();
        let content = content.clone();
        async move {
            client
                .hover(&path, &content, "python", line, 0, REQUEST_TIMEOUT)
                .await
                .unwrap()
        }
    };

    let (a, b, c) = tokio::join!(hover(0), hover(1), hover(2));
    assert_eq!(a.contents.as_deref(), Some("```python\nalpha\n```"));
    assert_eq!(b.contents.as_deref(), Some("```python\nbeta\n```"));
    assert_eq!(c.contents.as_deref(), Some("```python\ngamma\n```"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_timeout_leaves_connection_usable() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "slow.py", "def f():\n    pass\n");

    let client = LspClient::start(
        &mock_descriptor(&["--hang-on", "textDocument/definition"]),
        &root,
        INIT_TIMEOUT,
    )
    .await
    .unwrap();

    let err = client
        .definition(&path, &content, "python", 0, 4, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LspError::RequestTimeout {
            method: "textDocument/definition".to_string(),
            timeout: Duration::from_millis(200),
        }
    );

    let result = client
        .hover(&path, &content, "python", 1, 4, REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(client.state(), ConnectionState::Ready);

    client.shutdown().await;
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "err.py", "x = 1\n");

    let client = LspClient::start(
        &mock_descriptor(&["--fail-on", "textDocument/hover"]),
        &root,
        INIT_TIMEOUT,
    )
    .await
    .unwrap();

    let err = client
        .hover(&path, &content, "python", 0, 0, REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::ServerError { code: -32603, .. }));
    assert_eq!(client.state(), ConnectionState::Ready);

    client.shutdown().await;
}

#[tokio::test]
async fn test_server_requests_do_not_block() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "cfg.py", "value = 1\n");

    let client = LspClient::start(
        &mock_descriptor(&["--send-configuration-request"]),
        &root,
        INIT_TIMEOUT,
    )
    .await
    .unwrap();

    let result = client
        .hover(&path, &content, "python", 0, 0, REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result.contents.as_deref(), Some("```python\nvalue\n```"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_initialization_timeout() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let result = LspClient::start(
        &mock_descriptor(&["--init-delay", "3000"]),
        &root,
        Duration::from_millis(300),
    )
    .await;

    assert_eq!(
        result.err(),
        Some(LspError::InitializationTimeout(Duration::from_millis(300)))
    );
}

#[tokio::test]
async fn test_server_exiting_at_start_fails_initialization() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let result =
        LspClient::start(&mock_descriptor(&["--exit-on-start"]), &root, INIT_TIMEOUT).await;

    assert!(
        matches!(result, Err(LspError::InitializationFailed(_))),
        "unexpected outcome: {:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_diagnostics_wait_for_publication() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (path, content) = write_file(&root, "bad.py", "import os\nprint(undefined)\n");

    let client = LspClient::start(
        &mock_descriptor(&["--diagnostics-delay", "100"]),
        &root,
        INIT_TIMEOUT,
    )
    .await
    .unwrap();

    let result = client
        .diagnostics(&path, &content, "python", REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.warning_count, 1);
    assert_eq!(result.diagnostics[1].range.start.line, 1);
    assert_eq!(result.diagnostics[1].source.as_deref(), Some("mockls"));

    client.shutdown().await;
}
