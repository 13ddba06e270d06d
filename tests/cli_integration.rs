// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the `lspool` binary.
//!
//! Each test points the python server at `mockls` through a configuration
//! file and isolates the run from any user-level configuration.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    root: PathBuf,
    config: PathBuf,
}

impl Fixture {
    fn new(mock_args: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().canonicalize()?.join("project");
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join("pyproject.toml"), "")?;

        let args: Vec<String> = mock_args.iter().map(|a| format!("\"{a}\"")).collect();
        let config = dir.path().join("lspool.toml");
        std::fs::write(
            &config,
            format!(
                "request_timeout_ms = 3000\n\n[server.python]\ncommand = \"{}\"\nargs = [{}]\nextensions = [\".py\"]\nroot_markers = [\"pyproject.toml\"]\n",
                env!("CARGO_BIN_EXE_mockls"),
                args.join(", ")
            ),
        )?;

        Ok(Self { dir, root, config })
    }

    fn write(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new(env!("CARGO_BIN_EXE_lspool"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            // Isolate from user-level config
            .env("XDG_CONFIG_HOME", self.dir.path().join("xdg"))
            .output()
            .context("Failed to run lspool")
    }
}

fn stdout_json(output: &Output) -> Result<Value> {
    serde_json::from_slice(&output.stdout).context("stdout is not JSON")
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().context("non-UTF-8 temp path")
}

#[test]
fn test_hover_prints_result() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let file = fixture.write(
        "calc.py",
        "def add_numbers(x, y) -> int:\n    \"\"\"Add two numbers together.\"\"\"\n    return x + y\n",
    )?;

    let output = fixture.run(&["hover", path_arg(&file)?, "0", "6"])?;
    assert!(output.status.success());

    let json = stdout_json(&output)?;
    assert_eq!(json["success"], true);
    assert_eq!(json["language"], "python");
    let contents = json["contents"].as_str().context("contents missing")?;
    assert!(contents.contains("def add_numbers(x, y) -> int"));
    assert!(contents.contains("Add two numbers together."));
    assert!(json.get("error").is_none());
    Ok(())
}

#[test]
fn test_missing_file_fails() -> Result<()> {
    let fixture = Fixture::new(&[])?;

    let output = fixture.run(&["hover", "/nonexistent/file.ext", "0", "0"])?;
    assert!(!output.status.success());

    let json = stdout_json(&output)?;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "File not found: /nonexistent/file.ext");
    Ok(())
}

#[test]
fn test_definition_and_diagnostics() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let file = fixture.write(
        "use.py",
        "def helper():\n    pass\n\nhelper()\nprint(undefined)\n",
    )?;

    let output = fixture.run(&["definition", path_arg(&file)?, "3", "0"])?;
    let json = stdout_json(&output)?;
    assert_eq!(json["success"], true);
    assert_eq!(json["locations"][0]["path"], path_arg(&file)?);
    assert_eq!(json["locations"][0]["range"]["start"]["line"], 0);

    let output = fixture.run(&["diagnostics", path_arg(&file)?])?;
    let json = stdout_json(&output)?;
    assert_eq!(json["success"], true);
    assert_eq!(json["error_count"], 1);
    assert_eq!(json["warning_count"], 1);
    Ok(())
}

#[test]
fn test_references_exclude_declaration() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let file = fixture.write("refs.py", "def helper():\n    pass\n\nhelper()\nhelper()\n")?;

    let output = fixture.run(&["references", path_arg(&file)?, "3", "0"])?;
    assert!(output.status.success());
    let json = stdout_json(&output)?;
    assert_eq!(json["count"], 3);
    assert_eq!(json["files"][0], path_arg(&file)?);

    let output = fixture.run(&[
        "references",
        path_arg(&file)?,
        "3",
        "0",
        "--exclude-declaration",
    ])?;
    let json = stdout_json(&output)?;
    assert_eq!(json["count"], 2);
    assert_eq!(json["references"][0]["range"]["start"]["line"], 3);
    Ok(())
}

#[test]
fn test_request_timeout_flag() -> Result<()> {
    let fixture = Fixture::new(&["--hang-on", "textDocument/hover"])?;
    let file = fixture.write("hang.py", "x = 1\n")?;

    let output = fixture.run(&["hover", path_arg(&file)?, "0", "0", "--timeout-ms", "250"])?;
    assert!(!output.status.success());

    let json = stdout_json(&output)?;
    assert_eq!(
        json["error"],
        "Request 'textDocument/hover' timed out after 250ms"
    );
    Ok(())
}

#[test]
fn test_servers_lists_merged_table() -> Result<()> {
    let fixture = Fixture::new(&[])?;

    let output = fixture.run(&["servers"])?;
    assert!(output.status.success());

    let json = stdout_json(&output)?;
    let servers = json.as_array().context("expected an array")?;
    let find = |id: &str| servers.iter().find(|s| s["id"] == id);

    let python = find("python").context("python missing")?;
    assert_eq!(python["command"], env!("CARGO_BIN_EXE_mockls"));
    assert_eq!(python["root_markers"][0], "pyproject.toml");

    let rust = find("rust").context("built-in rust server missing")?;
    assert_eq!(rust["command"], "rust-analyzer");
    assert_eq!(rust["extensions"][0], ".rs");
    Ok(())
}

#[test]
fn test_user_config_directory_is_read() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let user_dir = dir.path().join("xdg").join("lspool");
    std::fs::create_dir_all(&user_dir)?;
    std::fs::write(
        user_dir.join("config.toml"),
        "[server.go]\ncommand = \"gopls-custom\"\nextensions = [\".go\"]\n",
    )?;

    let output = Command::new(env!("CARGO_BIN_EXE_lspool"))
        .arg("servers")
        .env("XDG_CONFIG_HOME", dir.path().join("xdg"))
        .output()
        .context("Failed to run lspool")?;
    let json = stdout_json(&output)?;
    let go = json
        .as_array()
        .and_then(|servers| servers.iter().find(|s| s["id"] == "go"))
        .context("go missing")?;

    assert_eq!(go["command"], "gopls-custom");
    // Servers without their own markers fall back to `.git`.
    assert_eq!(go["root_markers"][0], ".git");
    Ok(())
}
