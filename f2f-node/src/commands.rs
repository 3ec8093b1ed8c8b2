//! Interactive command loop. Runs on its own thread reading stdin lines.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use f2f_core::{Message, Router};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(SocketAddr),
    PingAll,
    Peers,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: connect <ip> <port>")]
    ConnectUsage,
    #[error("invalid address: {0}")]
    BadAddress(String),
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        return Ok(None);
    };
    let parsed = match cmd {
        "connect" => {
            let [ip, port] = args else {
                return Err(CommandError::ConnectUsage);
            };
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| CommandError::BadAddress(ip.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| CommandError::BadAddress(port.to_string()))?;
            Command::Connect(SocketAddr::new(ip, port))
        }
        "pingall" => Command::PingAll,
        "peers" => Command::Peers,
        "quit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(parsed))
}

/// Run a command against the router. Returns `false` when the loop should end.
pub fn execute(cmd: Command, router: &Router, out: &mut impl Write) -> std::io::Result<bool> {
    match cmd {
        Command::Connect(addr) => {
            writeln!(out, "....")?;
            // Outcome is logged by the router.
            drop(router.connect_to_remote(addr, HashMap::new()));
        }
        Command::PingAll => match Message::ping(router.gen_uuid()) {
            Ok(ping) => {
                debug!(peers = router.len(), "pinging all peers");
                router.broadcast(Arc::new(ping));
            }
            Err(e) => warn!(error = %e, "could not build ping"),
        },
        Command::Peers => writeln!(out, "{}", router.connections_str())?,
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read and execute commands until `quit` or EOF, then fire `quit`.
pub fn run(router: Router, input: impl BufRead, mut out: impl Write, quit: oneshot::Sender<()>) {
    let mut lines = input.lines();
    loop {
        if write!(out, "> ").and_then(|_| out.flush()).is_err() {
            break;
        }
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "reading command failed");
                break;
            }
            None => break,
        };
        let keep_going = match parse(&line) {
            Ok(Some(cmd)) => execute(cmd, &router, &mut out).unwrap_or(false),
            Ok(None) => true,
            Err(e) => writeln!(out, "{e}").is_ok(),
        };
        if !keep_going {
            break;
        }
    }
    info!("command loop finished");
    let _ = quit.send(());
}

/// Start [`run`] on a dedicated stdin thread.
pub fn spawn(router: Router, quit: oneshot::Sender<()>) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("f2f-commands".to_string())
        .spawn(move || run(router, std::io::stdin().lock(), std::io::stdout(), quit))
}
