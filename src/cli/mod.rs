// SPDX-License-Identifier: MIT
//! CLI front end (spec §6 "CLI surface"): wires the ten subcommands onto
//! `clap::Parser`/`Subcommand`, in the teacher's `main.rs` style — one
//! `Args` struct with CLI/env-dual-sourced global flags, one `Command`
//! enum. Subcommand bodies are thin calls into `AppContext`, `Pool`,
//! `ControlClient`, and `warmup::scan`; argument parsing itself carries
//! no correctness property of its own (spec.md is silent on it).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lux", about = "A local LSP multiplexer with an MCP bridge", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration directory (default: `$XDG_CONFIG_HOME/lux`).
    #[arg(long, env = "LUX_CONFIG_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Data directory (default: `$XDG_DATA_HOME/lux`).
    #[arg(long, env = "LUX_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Control socket path (default: `$XDG_RUNTIME_DIR/lux.sock`).
    #[arg(long, env = "LUX_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LUX_LOG", global = true)]
    pub log: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the LSP-multiplexer server on stdio (the default editor-facing mode).
    Serve,

    /// Run an MCP bridge transport.
    Mcp {
        #[command(subcommand)]
        transport: McpTransport,
    },

    /// Register a new backend in `lsps.toml` (appends; does not start it).
    Add {
        /// Backend name.
        name: String,
        /// Opaque package reference passed to the Builder (e.g. a flake ref).
        package_ref: String,
        /// Relative path or executable name within the built tree.
        #[arg(long)]
        binary_hint: Option<String>,
    },

    /// List configured backends and their route coverage.
    List,

    /// Show the running state of every backend (via the control socket).
    Status,

    /// Start a backend by name (via the control socket).
    Start {
        name: String,
    },

    /// Stop a backend by name (via the control socket).
    Stop {
        name: String,
    },

    /// Scan a directory and pre-start every backend it needs (via the control socket).
    Warmup {
        dir: PathBuf,
    },

    /// Format a file, via its configured external formatter if one matches, else its LSP backend.
    Fmt {
        path: PathBuf,
    },

    /// Scaffold a `lux` configuration directory with empty `lsps.toml`/`formatters.toml`.
    Init {
        /// Directory to scaffold (default: the configuration directory).
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum McpTransport {
    /// Newline-delimited JSON over stdin/stdout.
    Stdio,
    /// Server-Sent Events: `GET /sse` + `POST /message`.
    Sse {
        #[arg(long, default_value = "127.0.0.1:7890")]
        bind: String,
    },
    /// Streamable HTTP: a single `POST /mcp` endpoint.
    Http {
        #[arg(long, default_value = "127.0.0.1:7891")]
        bind: String,
    },
}
