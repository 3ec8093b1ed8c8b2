// f2f-node: demo servent. Listens, dials configured peers and takes commands on stdin.

mod commands;
mod config;
mod demo;
mod logging;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use f2f_core::Router;
use tokio::sync::oneshot;
use tracing::info;

use crate::config::Config;
use crate::demo::DemoProtocol;
use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "f2f-node", version, about = "Friend-to-friend demo servent")]
struct Cli {
    /// Port to listen on (overrides config and F2F_LISTEN_PORT).
    port: Option<u16>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level or filter directive, e.g. "debug" or "f2f_core=trace".
    #[arg(long)]
    log_level: Option<String>,

    /// Emit newline-delimited JSON logs.
    #[arg(long)]
    json_logs: bool,

    /// Servent to dial at startup. Repeatable.
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,
}

impl Cli {
    fn apply(self, c: &mut Config) {
        if let Some(port) = self.port {
            c.listen_port = port;
        }
        if let Some(level) = self.log_level {
            c.log_level = level;
        }
        if self.json_logs {
            c.log_format = LogFormat::Json;
        }
        c.peers.extend(self.connect);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);
    logging::init_logging(cfg.log_format, &cfg.log_level)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let demo = Arc::new(DemoProtocol::default());
    let router = Router::bind(
        ("0.0.0.0", cfg.listen_port),
        demo.clone(),
        cfg.router.clone(),
    )
    .await
    .with_context(|| format!("listening on port {}", cfg.listen_port))?;
    demo.attach(&router);
    info!(port = cfg.listen_port, "listening");

    for peer in &cfg.peers {
        drop(router.connect_to_remote(*peer, HashMap::new()));
    }

    let (quit_tx, quit_rx) = oneshot::channel();
    commands::spawn(router.clone(), quit_tx)?;

    tokio::select! {
        res = shutdown_signal() => res?,
        _ = quit_rx => {}
    }
    info!("shutting down");
    router.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
