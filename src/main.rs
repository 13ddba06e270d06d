// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! lspool CLI.
//!
//! Runs a single query against the language server responsible for a file
//! and prints the structured result as JSON.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lspool::config::Config;
use lspool::lsp::ClientManager;

/// Command-line arguments for lspool.
#[derive(Parser, Debug)]
#[command(name = "lspool")]
#[command(about = "Query language servers for hover, definitions, references and diagnostics")]
#[command(version = env!("LSPOOL_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Subcommands supported by lspool.
#[derive(Subcommand, Debug)]
enum Command {
    /// Show hover information at a position.
    Hover {
        /// Source file.
        file: PathBuf,
        /// Zero-indexed line.
        line: u32,
        /// Zero-indexed character offset.
        character: u32,
        /// Request timeout in milliseconds (defaults to `request_timeout_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show where the symbol at a position is defined.
    Definition {
        /// Source file.
        file: PathBuf,
        /// Zero-indexed line.
        line: u32,
        /// Zero-indexed character offset.
        character: u32,
        /// Request timeout in milliseconds (defaults to `request_timeout_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List every reference to the symbol at a position.
    References {
        /// Source file.
        file: PathBuf,
        /// Zero-indexed line.
        line: u32,
        /// Zero-indexed character offset.
        character: u32,
        /// Leave the declaration itself out of the list.
        #[arg(long)]
        exclude_declaration: bool,
        /// Request timeout in milliseconds (defaults to `request_timeout_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show diagnostics the server publishes for a file.
    Diagnostics {
        /// Source file.
        file: PathBuf,
        /// How long to wait for diagnostics, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List configured language servers.
    Servers,
}

#[derive(Serialize)]
struct ServerListing<'a> {
    id: &'a str,
    command: &'a str,
    args: &'a [String],
    extensions: &'a [String],
    root_markers: &'a [String],
}

/// Entry point for the lspool binary.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or output cannot be
/// serialized.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.clone())?;
    debug!(
        "Loaded configuration with {} servers, pool size {}",
        config.server.len(),
        config.max_pool_size
    );

    let manager = ClientManager::from_config(&config);
    let (json, success) = match args.command {
        Command::Servers => return run_servers(&config),
        Command::Hover {
            file,
            line,
            character,
            timeout_ms,
        } => {
            let result = manager
                .hover(&file, line, character, timeout_ms.map(Duration::from_millis))
                .await;
            (to_json(&result)?, result.success)
        }
        Command::Definition {
            file,
            line,
            character,
            timeout_ms,
        } => {
            let result = manager
                .definition(&file, line, character, timeout_ms.map(Duration::from_millis))
                .await;
            (to_json(&result)?, result.success)
        }
        Command::References {
            file,
            line,
            character,
            exclude_declaration,
            timeout_ms,
        } => {
            let result = manager
                .references(
                    &file,
                    line,
                    character,
                    !exclude_declaration,
                    timeout_ms.map(Duration::from_millis),
                )
                .await;
            (to_json(&result)?, result.success)
        }
        Command::Diagnostics { file, timeout_ms } => {
            let result = manager
                .diagnostics(&file, timeout_ms.map(Duration::from_millis))
                .await;
            (to_json(&result)?, result.success)
        }
    };

    manager.shutdown_all().await;
    println!("{json}");

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_servers(config: &Config) -> Result<ExitCode> {
    let registry = config.registry();
    let listing: Vec<_> = registry
        .servers()
        .map(|server| ServerListing {
            id: &server.id,
            command: &server.command,
            args: &server.args,
            extensions: &server.extensions,
            root_markers: &server.root_markers,
        })
        .collect();

    println!("{}", to_json(&listing)?);
    Ok(ExitCode::SUCCESS)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize result")
}
