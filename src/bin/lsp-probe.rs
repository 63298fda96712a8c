//! Diagnostic probe for language servers
//!
//! Spawns a server, runs the initialize handshake against a workspace
//! root, logs the traffic the server sends on its own, then shuts the
//! session down. Useful for checking that a server binary and its flags
//! work before wiring them into an editor.
//!
//! ```text
//! lsp-probe --root ~/src/project -- gopls serve
//! lsp-probe --watch 30 -- clangd --background-index
//! ```

use clap::Parser;
use lsp_link::client::{Client, ServerConfig};
use lsp_link::logging::{LogConfig, init_logging};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// CLI arguments for the probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server executable and its arguments
    #[arg(required = true, num_args = 1.., value_name = "COMMAND", last = true)]
    server: Vec<String>,

    /// Workspace root to initialize against (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Seconds to keep observing server traffic after the handshake
    #[arg(long, default_value_t = 10)]
    watch: u64,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides LSP_LINK_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn text_of(params: Option<&Value>) -> String {
    params
        .and_then(|p| p.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("<no message>")
        .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    info!("probing server {:?} against {}", args.server, root.display());
    let client = Client::new(ServerConfig::new(args.server));

    client.register_handler("initialize", |message| {
        match message.error() {
            Some(err) => error!("initialize failed: {err}"),
            None => info!(
                "server capabilities: {}",
                message.result().cloned().unwrap_or_default()
            ),
        }
        Ok(None)
    });
    client.register_handler("window/logMessage", |message| {
        info!("server log: {}", text_of(message.params()));
        Ok(None)
    });
    client.register_handler("window/showMessage", |message| {
        warn!("server says: {}", text_of(message.params()));
        Ok(None)
    });
    client.register_handler("textDocument/publishDiagnostics", |message| {
        let count = message
            .params()
            .and_then(|p| p.get("diagnostics"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        info!("diagnostics published: {count}");
        Ok(None)
    });

    client.run_server().await?;
    client.initialize(&root, json!({})).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !client.is_ready().await {
        if tokio::time::Instant::now() >= deadline {
            error!("server did not complete the initialize handshake");
            client.terminate_server().await;
            std::process::exit(1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("session ready; watching traffic for {}s", args.watch);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.watch)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    client.terminate_server().await;
    info!("session closed");
    Ok(())
}
