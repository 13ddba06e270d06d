// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock LSP server for testing.
//!
//! Speaks the LSP protocol over stdin/stdout using Content-Length framed
//! JSON-RPC. CLI flags control timing and failure modes.
//! Deferred messages are sent from plain `std::thread`s, so no async runtime is needed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mock LSP server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "CLI flags are inherently boolean"
)]
struct Args {
    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Sleep before answering `initialize` (milliseconds).
    #[arg(long, default_value_t = 0)]
    init_delay: u64,

    /// Delay hover replies by `stagger / (line + 1)` milliseconds, so hovers
    /// on later lines are answered first.
    #[arg(long, default_value_t = 0)]
    hover_stagger: u64,

    /// Delay before publishing diagnostics (milliseconds).
    #[arg(long, default_value_t = 0)]
    diagnostics_delay: u64,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,

    /// Exit after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Answer this method with a frame whose header is garbage (repeatable).
    #[arg(long)]
    malformed_on: Vec<String>,

    /// Exit with status 1 before reading anything.
    #[arg(long)]
    exit_on_start: bool,

    /// Send workspace/configuration request after initialize.
    #[arg(long)]
    send_configuration_request: bool,
}

/// A JSON-RPC message from the client.
#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code, reason = "Required by JSON-RPC protocol")]
    jsonrpc: String,
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            // `null` results must still be sent, so keep `Some(Null)`.
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production,
/// or a shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

/// Create a writer that forwards to stdout.
fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

/// Write adapter for `Arc<Mutex<Vec<u8>>>` used in tests.
#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An opened document.
struct Document {
    language_id: String,
    text: String,
}

/// Shared state for the mock server.
struct MockServer {
    args: Args,
    documents: HashMap<String, Document>,
    response_count: u64,
    writer: Writer,
    next_request_id: Arc<AtomicU64>,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            documents: HashMap::new(),
            response_count: 0,
            writer,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run the server, reading from the given reader.
    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);

                let Ok(request) = serde_json::from_str::<Request>(&message) else {
                    continue;
                };

                if !self.handle_message(request) {
                    return;
                }
            }
        }
    }

    /// Returns false once the client has sent `exit`.
    fn handle_message(&mut self, request: Request) -> bool {
        let Some(method) = request.method.clone() else {
            // Responses to our own requests are ignored.
            return true;
        };

        if let Some(id) = request.id {
            self.handle_request(&method, id, &request.params);
            true
        } else {
            self.handle_notification(&method, &request.params)
        }
    }

    fn handle_request(&mut self, method: &str, id: Value, params: &Value) {
        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }

        if method == "initialize" && self.args.init_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.init_delay));
        }
        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.malformed_on.iter().any(|m| m == method) {
            write_raw(&self.writer, b"Content-Length: lots\r\n\r\n{}");
            return;
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_response(&Response::err(
                id,
                -32603,
                format!("mockls: configured to fail on {method}"),
            ));
            return;
        }

        let result = match method {
            "initialize" => handle_initialize(),
            "shutdown" => Value::Null,
            "textDocument/hover" => {
                let result = self.handle_hover(params).unwrap_or(Value::Null);
                if self.args.hover_stagger > 0 {
                    self.send_staggered(id, result, params);
                    return;
                }
                result
            }
            "textDocument/definition" => self.handle_definition(params).unwrap_or(Value::Null),
            "textDocument/references" => self.handle_references(params).unwrap_or(Value::Null),
            _ => {
                self.send_response(&Response::err(
                    id,
                    -32601,
                    format!("mockls: method not found: {method}"),
                ));
                return;
            }
        };

        self.send_response(&Response::ok(id, result));

        if method == "initialize" && self.args.send_configuration_request {
            self.send_configuration_request();
        }
    }

    fn handle_notification(&mut self, method: &str, params: &Value) -> bool {
        match method {
            "textDocument/didOpen" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    let language_id = td
                        .get("languageId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let text = td.get("text").and_then(Value::as_str).unwrap_or_default();
                    self.documents.insert(
                        uri.to_string(),
                        Document {
                            language_id: language_id.to_string(),
                            text: text.to_string(),
                        },
                    );

                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri, text);
                    }
                }
            }
            "textDocument/didClose" => {
                if let Some(uri) = params
                    .get("textDocument")
                    .and_then(|td| td.get("uri"))
                    .and_then(Value::as_str)
                {
                    self.documents.remove(uri);
                }
            }
            "exit" => return false,
            // initialized and all others are silently accepted
            _ => {}
        }
        true
    }

    /// Hover over a `def` line shows its signature and the docstring on the
    /// following line; anything else shows the word under the cursor.
    fn handle_hover(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let doc = self.documents.get(uri)?;
        let word = extract_word(&doc.text, line, col)?;
        let line_text = doc.text.lines().nth(line)?;

        if let Some(signature) = python_signature(line_text) {
            let mut value = format!("```{}\ndef {signature}\n```", doc.language_id);
            if let Some(doc_text) = doc.text.lines().nth(line + 1).and_then(docstring) {
                value.push_str("\n\n");
                value.push_str(&doc_text);
            }
            return Some(serde_json::json!({
                "contents": { "kind": "markdown", "value": value }
            }));
        }

        let start = line_text.find(&word).unwrap_or(col);
        Some(serde_json::json!({
            "contents": { "language": doc.language_id, "value": word },
            "range": {
                "start": { "line": line, "character": start },
                "end": { "line": line, "character": start + word.len() }
            }
        }))
    }

    fn handle_definition(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let content = &self.documents.get(uri)?.text;
        let word = extract_word(content, line, col)?;

        let (line_idx, name_start) = find_declaration(content, &word)?;
        Some(location_json(
            uri,
            line_idx,
            name_start,
            name_start + word.len(),
        ))
    }

    /// Every whole-word occurrence of the symbol in the same document.
    fn handle_references(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let content = &self.documents.get(uri)?.text;
        let word = extract_word(content, line, col)?;
        let include_declaration = params
            .pointer("/context/includeDeclaration")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let declaration = find_declaration(content, &word);

        let mut locations = Vec::new();
        for (line_idx, line_text) in content.lines().enumerate() {
            for (start, _) in line_text.match_indices(word.as_str()) {
                let end = start + word.len();
                let bytes = line_text.as_bytes();
                let bounded = (start == 0 || !is_word_char(bytes[start - 1]))
                    && (end == bytes.len() || !is_word_char(bytes[end]));
                if !bounded || (!include_declaration && declaration == Some((line_idx, start))) {
                    continue;
                }
                locations.push(location_json(uri, line_idx, start, end));
            }
        }

        Some(Value::Array(locations))
    }

    /// Answers a hover from a thread after a line-dependent delay.
    fn send_staggered(&self, id: Value, result: Value, params: &Value) {
        let line = extract_position(params).map_or(0, |(_, line, _)| line as u64);
        let delay = self.args.hover_stagger / (line + 1);
        let writer = self.writer.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(delay));
            if let Ok(json) = serde_json::to_string(&Response::ok(id, result)) {
                write_framed(&writer, &json);
            }
        });
    }

    fn publish_diagnostics(&self, uri: &str, text: &str) {
        let delay = self.args.diagnostics_delay;
        let params = diagnostics_params(uri, text);
        let writer = self.writer.clone();

        if delay > 0 {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                send_diagnostics_notification(&writer, params);
            });
        } else {
            send_diagnostics_notification(&self.writer, params);
        }
    }

    fn send_configuration_request(&self) {
        let req_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        send_message(
            &self.writer,
            &serde_json::json!({
                "jsonrpc": "2.0",
                "id": req_id,
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "mockls" }] }
            }),
        );
    }

    fn send_response(&mut self, response: &Response) {
        let Ok(json) = serde_json::to_string(response) else {
            return;
        };

        write_framed(&self.writer, &json);

        self.response_count += 1;

        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            std::process::exit(1);
        }
    }
}

fn handle_initialize() -> Value {
    serde_json::json!({
        "capabilities": {
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "textDocumentSync": { "openClose": true, "change": 1 }
        },
        "serverInfo": { "name": "mockls", "version": env!("CARGO_PKG_VERSION") }
    })
}

/// `add_numbers(x, y) -> int` for a line like `def add_numbers(x, y) -> int:`.
fn python_signature(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("def ")?;
    Some(rest.strip_suffix(':').unwrap_or(rest).trim_end())
}

/// The text of a one-line `"""docstring"""`.
fn docstring(line: &str) -> Option<String> {
    let inner = line
        .trim()
        .strip_prefix("\"\"\"")?
        .strip_suffix("\"\"\"")?
        .trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

/// One warning for the document, plus an error for every line mentioning
/// `undefined`.
fn diagnostics_params(uri: &str, text: &str) -> Value {
    let mut diagnostics = vec![serde_json::json!({
        "range": {
            "start": { "line": 0, "character": 0 },
            "end": { "line": 0, "character": 1 }
        },
        "severity": 2,
        "source": "mockls",
        "message": "mockls: mock diagnostic"
    })];

    for (idx, line) in text.lines().enumerate() {
        if let Some(col) = line.find("undefined") {
            diagnostics.push(serde_json::json!({
                "range": {
                    "start": { "line": idx, "character": col },
                    "end": { "line": idx, "character": col + "undefined".len() }
                },
                "severity": 1,
                "source": "mockls",
                "message": "mockls: undefined name"
            }));
        }
    }

    serde_json::json!({ "uri": uri, "diagnostics": diagnostics })
}

/// Extract `(uri, line, col)` from a `textDocument/position` params object.
fn extract_position(params: &Value) -> Option<(&str, usize, usize)> {
    let uri = params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(Value::as_str)?;
    let position = params.get("position")?;
    let line = usize::try_from(position.get("line").and_then(Value::as_u64)?).ok()?;
    let col = usize::try_from(position.get("character").and_then(Value::as_u64)?).ok()?;
    Some((uri, line, col))
}

/// Line and column of the name in the first `def`/`fn`/`function`/`class`
/// declaration of `word`.
fn find_declaration(content: &str, word: &str) -> Option<(usize, usize)> {
    let patterns = [
        format!("def {word}"),
        format!("fn {word}"),
        format!("function {word}"),
        format!("class {word}"),
    ];

    content.lines().enumerate().find_map(|(line_idx, line_text)| {
        patterns.iter().find_map(|pattern| {
            line_text
                .find(pattern.as_str())
                .map(|col_idx| (line_idx, col_idx + pattern.len() - word.len()))
        })
    })
}

/// Build a JSON `Location` object.
fn location_json(uri: &str, line: usize, start: usize, end: usize) -> Value {
    serde_json::json!({
        "uri": uri,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        }
    })
}

/// Write raw bytes, unframed.
fn write_raw(writer: &Writer, bytes: &[u8]) {
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(bytes);
    let _ = w.flush();
}

/// Write a Content-Length framed JSON string.
fn write_framed(writer: &Writer, json: &str) {
    let mut frame = format!("Content-Length: {}\r\n\r\n", json.len()).into_bytes();
    frame.extend_from_slice(json.as_bytes());
    write_raw(writer, &frame);
}

/// Send a JSON-RPC message to the client.
fn send_message(writer: &Writer, value: &Value) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };
    write_framed(writer, &json);
}

/// Send a `publishDiagnostics` notification.
fn send_diagnostics_notification(writer: &Writer, params: Value) {
    send_message(
        writer,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": params
        }),
    );
}

/// Parse a Content-Length framed message from a buffer.
/// Returns the message string and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let content_length: usize = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())
            .flatten()
    })?;
    let total = header_end + 4 + content_length;

    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

/// Extract the word at a given line and column from content.
fn extract_word(content: &str, line: usize, col: usize) -> Option<String> {
    let line_text = content.lines().nth(line)?;

    if col >= line_text.len() {
        return None;
    }

    let bytes = line_text.as_bytes();

    let start = (0..=col)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);

    let end = (col..bytes.len())
        .find(|&i| !is_word_char(bytes[i]))
        .unwrap_or(bytes.len());

    if start >= end {
        return None;
    }

    Some(line_text[start..end].to_string())
}

const fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn main() {
    let args = Args::parse();
    if args.exit_on_start {
        std::process::exit(1);
    }

    let writer = stdout_writer();
    let mut server = MockServer::new(args, writer);
    let mut stdin = std::io::stdin().lock();
    server.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args::parse_from(["mockls"])
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn extract_messages(data: &[u8]) -> Vec<Value> {
        let mut messages = Vec::new();
        let mut buf = data.to_vec();
        while let Some((msg, consumed)) = try_parse_message(&buf) {
            if let Ok(v) = serde_json::from_str::<Value>(&msg) {
                messages.push(v);
            }
            buf.drain(..consumed);
        }
        messages
    }

    fn run_server_wait(args: Args, input: &[u8], wait_ms: u64) -> (Vec<Value>, Vec<u8>) {
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        let mut reader = Cursor::new(input.to_vec());
        server.run(&mut reader);
        std::thread::sleep(Duration::from_millis(wait_ms));
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        (extract_messages(&data), data)
    }

    fn run_server_with(args: Args, input: &[u8]) -> Vec<Value> {
        run_server_wait(args, input, 0).0
    }

    fn request(id: u64, method: &str, params: Value) -> Vec<u8> {
        frame(
            &serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
                .to_string(),
        )
    }

    fn did_open(uri: &str, language_id: &str, text: &str) -> Vec<u8> {
        frame(
            &serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/didOpen",
                "params": {
                    "textDocument": {
                        "uri": uri,
                        "languageId": language_id,
                        "version": 1,
                        "text": text
                    }
                }
            })
            .to_string(),
        )
    }

    fn position(uri: &str, line: u64, character: u64) -> Value {
        serde_json::json!({
            "textDocument": { "uri": uri },
            "position": { "line": line, "character": character }
        })
    }

    fn response(messages: &[Value], id: u64) -> &Value {
        messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(id) && m.get("method").is_none())
            .expect("response with matching id")
    }

    const PYTHON: &str =
        "def add_numbers(x, y) -> int:\n    \"\"\"Add two numbers together.\"\"\"\n    return x + y\n";

    #[test]
    fn test_initialize_response_valid() {
        let input = request(1, "initialize", serde_json::json!({ "capabilities": {} }));
        let messages = run_server_with(default_args(), &input);

        let caps = &response(&messages, 1)["result"]["capabilities"];
        assert_eq!(caps["hoverProvider"], true);
        assert_eq!(caps["definitionProvider"], true);
    }

    #[test]
    fn test_hover_on_def_shows_signature_and_docstring() {
        let uri = "file:///tmp/calc.py";
        let mut input = request(1, "initialize", Value::Null);
        input.extend(did_open(uri, "python", PYTHON));
        input.extend(request(2, "textDocument/hover", position(uri, 0, 6)));

        let messages = run_server_with(default_args(), &input);
        let contents = &response(&messages, 2)["result"]["contents"];

        assert_eq!(contents["kind"], "markdown");
        assert_eq!(
            contents["value"],
            "```python\ndef add_numbers(x, y) -> int\n```\n\nAdd two numbers together."
        );
    }

    #[test]
    fn test_hover_out_of_range_is_null() {
        let uri = "file:///tmp/calc.py";
        let mut input = did_open(uri, "python", PYTHON);
        input.extend(request(2, "textDocument/hover", position(uri, 1000, 0)));

        let messages = run_server_with(default_args(), &input);
        let hover = response(&messages, 2);
        assert!(hover["result"].is_null());
        assert!(hover.get("error").is_none());
    }

    #[test]
    fn test_hover_on_word_is_marked_code() {
        let uri = "file:///tmp/calc.py";
        let mut input = did_open(uri, "python", PYTHON);
        input.extend(request(2, "textDocument/hover", position(uri, 2, 6)));

        let messages = run_server_with(default_args(), &input);
        let result = &response(&messages, 2)["result"];
        assert_eq!(result["contents"]["language"], "python");
        assert_eq!(result["contents"]["value"], "return");
        assert_eq!(result["range"]["start"]["character"], 4);
    }

    #[test]
    fn test_hover_stagger_reverses_order() {
        let mut args = default_args();
        args.hover_stagger = 200;

        let uri = "file:///tmp/calc.py";
        let mut input = did_open(uri, "python", PYTHON);
        input.extend(request(10, "textDocument/hover", position(uri, 0, 4)));
        input.extend(request(11, "textDocument/hover", position(uri, 2, 4)));

        let (messages, _) = run_server_wait(args, &input, 400);
        let ids: Vec<u64> = messages
            .iter()
            .filter_map(|m| m.get("id").and_then(Value::as_u64))
            .collect();
        assert_eq!(ids, vec![11, 10]);
    }

    #[test]
    fn test_definition_points_at_name() {
        let uri = "file:///tmp/calc.py";
        let text = format!("{PYTHON}\nprint(add_numbers(1, 2))\n");
        let mut input = did_open(uri, "python", &text);
        input.extend(request(2, "textDocument/definition", position(uri, 4, 8)));

        let messages = run_server_with(default_args(), &input);
        let result = &response(&messages, 2)["result"];
        assert_eq!(result["uri"], uri);
        assert_eq!(result["range"]["start"]["line"], 0);
        assert_eq!(result["range"]["start"]["character"], 4);
    }

    #[test]
    fn test_references_find_whole_words() {
        let uri = "file:///tmp/calc.py";
        let text = format!("{PYTHON}\nprint(add_numbers(1, 2))\nadd_numbers_total = 0\n");
        let mut input = did_open(uri, "python", &text);
        input.extend(request(2, "textDocument/references", position(uri, 4, 8)));
        let mut without_decl = position(uri, 4, 8);
        without_decl["context"] = serde_json::json!({ "includeDeclaration": false });
        input.extend(request(3, "textDocument/references", without_decl));

        let messages = run_server_with(default_args(), &input);
        let all = response(&messages, 2)["result"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["range"]["start"]["line"], 0);
        assert_eq!(all[1]["range"]["start"]["line"], 4);

        let usages = response(&messages, 3)["result"].as_array().unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0]["range"]["start"]["character"], 6);
    }

    #[test]
    fn test_diagnostics_flag_undefined_names() {
        let uri = "file:///tmp/bad.py";
        let input = did_open(uri, "python", "x = 1\nprint(undefined)\n");

        let messages = run_server_with(default_args(), &input);
        let diag = messages
            .iter()
            .find(|m| {
                m.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics")
            })
            .expect("publishDiagnostics notification");

        let diagnostics = diag["params"]["diagnostics"].as_array().unwrap();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[1]["severity"], 1);
        assert_eq!(diagnostics[1]["range"]["start"]["line"], 1);
    }

    #[test]
    fn test_fail_on_returns_internal_error() {
        let mut args = default_args();
        args.fail_on = vec!["initialize".to_string()];

        let messages = run_server_with(args, &request(1, "initialize", Value::Null));
        assert_eq!(response(&messages, 1)["error"]["code"], -32603);
    }

    #[test]
    fn test_malformed_on_writes_bad_header() {
        let mut args = default_args();
        args.malformed_on = vec!["textDocument/hover".to_string()];

        let uri = "file:///tmp/calc.py";
        let mut input = did_open(uri, "python", PYTHON);
        input.extend(request(2, "textDocument/hover", position(uri, 0, 4)));

        let (_, raw) = run_server_wait(args, &input, 0);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.ends_with("Content-Length: lots\r\n\r\n{}"));
    }

    #[test]
    fn test_exit_stops_the_loop() {
        let mut input = frame(r#"{"jsonrpc":"2.0","method":"exit"}"#);
        input.extend(request(1, "initialize", Value::Null));

        let messages = run_server_with(default_args(), &input);
        assert!(messages.is_empty());
    }
}
