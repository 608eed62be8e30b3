//! TOML configuration for udpmeter.
//!
//! Every field has a compiled-in default, so a partial file (or none at all)
//! is fine. The file is looked up from an explicit path, then the
//! `UDPMETER_CONFIG` environment variable, then `./udpmeter.toml`. Command
//! line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::ClientSettings;
use crate::server::ServerSettings;
use crate::wire::FlowOptions;

/// Port appended to addresses that do not name one.
pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "UDPMETER_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeterConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Find the config file to use, if any.
    ///
    /// 1. `explicit`, when given.
    /// 2. The path in `UDPMETER_CONFIG`.
    /// 3. `./udpmeter.toml`, if it exists.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(env_path));
        }
        let local = Path::new("udpmeter.toml");
        local.exists().then(|| local.to_path_buf())
    }

    /// Server settings with the default port applied.
    pub fn server_settings(&self) -> Result<ServerSettings> {
        if self.flow.read_size == 0 {
            anyhow::bail!("flow.read_size must be non-zero");
        }
        let sweep_interval = parse_duration(&self.network.sweep_interval)
            .context("invalid network.sweep_interval")?;
        if sweep_interval.is_zero() {
            anyhow::bail!("network.sweep_interval must be non-zero");
        }
        Ok(ServerSettings {
            listen: append_port_if_missing(&self.network.listen_address, self.network.default_port),
            duplex: self.flow.duplex,
            read_size: self.flow.read_size,
            sweep_interval,
        })
    }

    /// Client settings for a session against `host`.
    pub fn client_settings(&self, host: &str) -> Result<ClientSettings> {
        let options = self.flow.options()?;
        options.validate().context("invalid flow settings")?;
        if self.flow.connections == 0 {
            anyhow::bail!("flow.connections must be at least 1");
        }
        Ok(ClientSettings {
            target: append_port_if_missing(host, self.network.default_port),
            local: self.network.local_address.clone(),
            connections: self.flow.connections,
            duplex: self.flow.duplex,
            options,
        })
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server listens on; the default port is added if missing.
    pub listen_address: String,
    /// Port used when an address does not name one.
    pub default_port: u16,
    /// Local address client connections bind to.
    pub local_address: Option<String>,
    /// How often the server sweeps expired flows.
    pub sweep_interval: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            default_port: DEFAULT_PORT,
            local_address: None,
            sweep_interval: "1s".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Time between interval reports; a bare number is seconds.
    pub report_interval: String,
    /// Total flow duration; a bare number is seconds.
    pub total_duration: String,
    /// Receive buffer size in bytes.
    pub read_size: usize,
    /// Send buffer size in bytes.
    pub write_size: usize,
    /// Send rate cap in megabits per second; `0` means unlimited.
    pub max_speed_mbps: f64,
    /// Parallel client connections.
    pub connections: usize,
    /// Run both directions.
    pub duplex: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            report_interval: "2s".to_string(),
            total_duration: "10s".to_string(),
            read_size: 65_507,
            write_size: 1470,
            max_speed_mbps: 0.0,
            connections: 1,
            duplex: false,
        }
    }
}

impl FlowConfig {
    /// The options a client negotiates.
    pub fn options(&self) -> Result<FlowOptions> {
        if !(self.max_speed_mbps >= 0.0 && self.max_speed_mbps.is_finite()) {
            anyhow::bail!("max_speed_mbps must be a non-negative number");
        }
        Ok(FlowOptions {
            report_interval: parse_duration(&self.report_interval)
                .context("invalid flow.report_interval")?,
            total_duration: parse_duration(&self.total_duration)
                .context("invalid flow.total_duration")?,
            read_size: self.read_size,
            write_size: self.write_size,
            max_speed_bps: (self.max_speed_mbps * 1_000_000.0) as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Runtime / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for the async runtime; defaults to one per core.
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Append `:port` unless `host` already ends in a port.
///
/// A bracketed IPv6 literal such as `[::1]` only counts as having a port if
/// a colon follows the closing bracket.
pub fn append_port_if_missing(host: &str, port: u16) -> String {
    for c in host.chars().rev() {
        match c {
            ']' => break,
            ':' => return host.to_string(),
            _ => {}
        }
    }
    format!("{}:{}", host, port)
}

/// Parse `250ms`, `1.5s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid duration: {:?}", s))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => anyhow::bail!("unknown duration unit {:?} in {:?}", other, s),
    };
    Duration::try_from_secs_f64(secs).with_context(|| format!("duration out of range: {:?}", s))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
