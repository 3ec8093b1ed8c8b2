//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use f2f_core::RouterConfig;
use serde::Deserialize;

use crate::logging::LogFormat;

/// Node configuration. File: ~/.config/f2f/config.toml or /etc/f2f/config.toml.
/// Env overrides: F2F_LISTEN_PORT, F2F_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 5555).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Servents dialed at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default)]
    pub router: RouterConfig,
}

fn default_listen_port() -> u16 {
    5555
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            peers: Vec::new(),
            router: RouterConfig::default(),
        }
    }
}

/// Load config: default, then config file, then env vars.
///
/// An explicit path must exist and parse. Without one, the first well-known path that
/// exists is used, and a file that fails to load falls back to defaults.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => from_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn from_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config file {}", path.display()))
}

/// Apply `F2F_*` overrides. Values that do not parse are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("F2F_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(level) = var("F2F_LOG_LEVEL").filter(|s| !s.is_empty()) {
        c.log_level = level;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/f2f/config.toml"));
    }
    out.push(PathBuf::from("/etc/f2f/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    from_file(&path).ok()
}
