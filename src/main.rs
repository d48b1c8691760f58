// SPDX-License-Identifier: MIT
//! `lux` binary entrypoint: parses the CLI, sets up logging, and
//! dispatches to the subcommand bodies. Grounded in the teacher's
//! `main.rs` shape (`tracing_subscriber::fmt().with_env_filter(...)`,
//! `clap::Parser::parse()`, a `match` over the `Command` enum) minus its
//! optional file-logging branch — this crate carries no
//! `tracing-appender` dependency, so stdout-only logging is the whole
//! story here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lux::cli::{Args, Command, McpTransport};
use lux::config::{self, LuxConfig};
use lux::control::{self, ControlClient};
use lux::handler::ClientHandler;
use lux::mcp::{self, McpServer};
use lux::rpc::connection::Connection;
use lux::warmup;
use lux::AppContext;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(args.log.as_deref().unwrap_or("info"));

    if let Err(e) = run(args).await {
        error!(err = %e, "lux exited with an error");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config_dir = args.config_dir.clone().unwrap_or_else(config::default_config_dir);
    let data_dir = args.data_dir.clone().unwrap_or_else(config::default_data_dir);
    let socket_path = args.socket.clone().unwrap_or_else(config::default_socket_path);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(&config_dir, data_dir, &socket_path).await,
        Command::Mcp { transport } => run_mcp(&config_dir, data_dir, transport).await,
        Command::Add { name, package_ref, binary_hint } => run_add(&config_dir, &name, &package_ref, binary_hint),
        Command::List => run_list(&config_dir, data_dir),
        Command::Status => run_status(&socket_path).await,
        Command::Start { name } => run_start(&socket_path, &name).await,
        Command::Stop { name } => run_stop(&socket_path, &name).await,
        Command::Warmup { dir } => run_warmup(&socket_path, &dir).await,
        Command::Fmt { path } => run_fmt(&config_dir, data_dir, &path).await,
        Command::Init { path } => run_init(path.unwrap_or(config_dir)),
    }
}

/// `lux serve`: the editor-facing entrypoint. Speaks LSP framing on
/// stdin/stdout, drives the Pool/Router hub, and runs the control socket
/// alongside it until stdin closes (spec §4.7, §4.11).
async fn run_serve(config_dir: &Path, data_dir: PathBuf, socket_path: &Path) -> Result<()> {
    let config = LuxConfig::load(config_dir, data_dir).context("loading configuration")?;
    let ctx = AppContext::build(config);

    let cancel = CancellationToken::new();
    let control_handle = {
        let pool = ctx.server.pool.clone();
        let router = ctx.server.router.clone();
        let cancel = cancel.clone();
        let socket_path = socket_path.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = control::serve(&socket_path, pool, router, cancel).await {
                error!(err = %e, "control socket exited");
            }
        })
    };

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let handler = Arc::new(ClientHandler::new(ctx.server.clone()));
    let (conn, reader_task) = Connection::spawn(stdin, stdout, handler);
    ctx.server.attach_client(conn).await;

    info!("lux serve: ready on stdio");
    let _ = reader_task.await;

    ctx.server.pool.stop_all().await;
    cancel.cancel();
    let _ = control_handle.await;
    Ok(())
}

/// `lux mcp stdio|sse|http`: runs one MCP transport in the foreground.
async fn run_mcp(config_dir: &Path, data_dir: PathBuf, transport: McpTransport) -> Result<()> {
    let config = LuxConfig::load(config_dir, data_dir).context("loading configuration")?;
    let ctx = AppContext::build(config);
    let mcp_server = Arc::new(McpServer::new(ctx.bridge.clone(), ctx.diagnostics.clone()));

    match transport {
        McpTransport::Stdio => {
            let stdin = tokio::io::stdin();
            let stdout = tokio::io::stdout();
            mcp::stdio::run(mcp_server, stdin, stdout).await?;
        }
        McpTransport::Sse { bind } => {
            let addr: std::net::SocketAddr = bind.parse().context("parsing --bind")?;
            let router = mcp::sse::router(mcp_server, ctx.document_manager.clone(), ctx.server.clone());
            info!(%addr, "mcp sse listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
        }
        McpTransport::Http { bind } => {
            let addr: std::net::SocketAddr = bind.parse().context("parsing --bind")?;
            mcp::http::serve(addr, mcp_server).await?;
        }
    }
    Ok(())
}

fn run_add(config_dir: &Path, name: &str, package_ref: &str, binary_hint: Option<String>) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let path = config_dir.join("lsps.toml");
    let mut existing = std::fs::read_to_string(&path).unwrap_or_default();

    existing.push_str(&format!(
        "\n[[backend]]\nname = \"{name}\"\npackage_ref = \"{package_ref}\"\n"
    ));
    if let Some(hint) = binary_hint {
        existing.push_str(&format!("binary_hint = \"{hint}\"\n"));
    }

    std::fs::write(&path, existing)?;
    println!("added backend {name:?} to {}", path.display());
    Ok(())
}

fn run_list(config_dir: &Path, data_dir: PathBuf) -> Result<()> {
    let config = LuxConfig::load(config_dir, data_dir).context("loading configuration")?;
    for backend in &config.backends {
        println!("{}\t{}", backend.name, backend.package_ref);
    }
    for route in &config.routes {
        let exts: Vec<&str> = route.extensions.iter().map(String::as_str).collect();
        println!(
            "route {} -> {} ({})",
            route.name,
            route.backend.as_deref().unwrap_or("-"),
            exts.join(",")
        );
    }
    Ok(())
}

async fn run_status(socket_path: &Path) -> Result<()> {
    let status = ControlClient::status(socket_path).await.context("contacting control socket")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_start(socket_path: &Path, name: &str) -> Result<()> {
    let result = ControlClient::start(socket_path, name).await.context("contacting control socket")?;
    print_control_result(&result)
}

async fn run_stop(socket_path: &Path, name: &str) -> Result<()> {
    let result = ControlClient::stop(socket_path, name).await.context("contacting control socket")?;
    print_control_result(&result)
}

async fn run_warmup(socket_path: &Path, dir: &Path) -> Result<()> {
    match ControlClient::warmup(socket_path, dir).await {
        Ok(result) => print_control_result(&result),
        Err(_) => {
            info!("control socket unreachable — running warmup scan directly");
            let config = LuxConfig::load(&config::default_config_dir(), config::default_data_dir())
                .context("loading configuration")?;
            let ctx = AppContext::build(config);
            warmup::warmup(dir.to_path_buf(), &ctx.server.router, &ctx.server.pool).await;
            Ok(())
        }
    }
}

async fn run_fmt(config_dir: &Path, data_dir: PathBuf, path: &Path) -> Result<()> {
    let config = LuxConfig::load(config_dir, data_dir).context("loading configuration")?;
    let ctx = AppContext::build(config);
    let uri = lux::document_manager::path_to_uri(path);
    let result = ctx.bridge.format(&uri).await;
    if result.is_error {
        anyhow::bail!(result.text);
    }
    tokio::io::stdout().write_all(result.text.as_bytes()).await?;
    Ok(())
}

fn run_init(path: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&path)?;
    std::fs::create_dir_all(path.join("filetype"))?;

    let lsps = path.join("lsps.toml");
    if !lsps.exists() {
        std::fs::write(&lsps, "# [[backend]]\n# name = \"gopls\"\n# package_ref = \"nixpkgs#gopls\"\n")?;
    }
    let formatters = path.join("formatters.toml");
    if !formatters.exists() {
        std::fs::write(&formatters, "# [[formatter]]\n# name = \"gofmt\"\n# command = \"gofmt\"\n")?;
    }

    println!("initialized lux configuration at {}", path.display());
    Ok(())
}

fn print_control_result(result: &serde_json::Value) -> Result<()> {
    if let Some(err) = result.get("error").and_then(serde_json::Value::as_str) {
        anyhow::bail!(err.to_string());
    }
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}
