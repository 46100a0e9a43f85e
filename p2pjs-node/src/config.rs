//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration. File: ~/.config/p2pjs/config.toml or /etc/p2pjs/config.toml.
/// Env overrides: P2PJS_PORT, P2PJS_MAX_RUNNING_JOBS, P2PJS_INTERPRETER, P2PJS_ADVERTISE_IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listening TCP port (default 2096).
    #[serde(default = "default_port")]
    pub port: u16,
    /// First peer to contact, as `ip#port`.
    #[serde(default)]
    pub seed_peer: Option<String>,
    /// Address advertised to other peers; detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<String>,
    /// Received jobs (plus outstanding offers) this node holds at once (default 4).
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,
    /// Ticks an unanswered offer keeps its slot (default 30).
    #[serde(default = "default_offer_timeout_ticks")]
    pub offer_timeout_ticks: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Program that runs job scripts (default "sh").
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments for a syntax-only run before execution; empty disables the check.
    #[serde(default = "default_syntax_check")]
    pub syntax_check: Vec<String>,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_port() -> u16 {
    2096
}
fn default_max_running_jobs() -> usize {
    p2pjs_core::ledger::DEFAULT_MAX_RUNNING_JOBS
}
fn default_offer_timeout_ticks() -> u64 {
    p2pjs_core::ledger::DEFAULT_OFFER_TIMEOUT_TICKS
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_interpreter() -> String {
    "sh".to_owned()
}
fn default_syntax_check() -> Vec<String> {
    vec!["-n".to_owned()]
}
fn default_job_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            seed_peer: None,
            advertise_ip: None,
            max_running_jobs: default_max_running_jobs(),
            offer_timeout_ticks: default_offer_timeout_ticks(),
            tick_interval_ms: default_tick_interval_ms(),
            interpreter: default_interpreter(),
            syntax_check: default_syntax_check(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

/// Load config: merge default, then config file (explicit path, or the first that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_path(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("P2PJS_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid P2PJS_PORT"),
        }
    }
    if let Some(s) = var("P2PJS_MAX_RUNNING_JOBS") {
        match s.parse::<usize>() {
            Ok(n) => c.max_running_jobs = n,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid P2PJS_MAX_RUNNING_JOBS"),
        }
    }
    if let Some(s) = var("P2PJS_INTERPRETER") {
        if !s.is_empty() {
            c.interpreter = s;
        }
    }
    if let Some(s) = var("P2PJS_ADVERTISE_IP") {
        if !s.is_empty() {
            c.advertise_ip = Some(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pjs/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pjs/config.toml"));
    out
}

fn load_path(p: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(p)
        .with_context(|| format!("reading config {}", p.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", p.display()))
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match load_path(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "using default config"),
            }
            break;
        }
    }
    None
}
