//! Configuration system for the hub server.
//!
//! Layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/hub-core/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading hub configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubConfigFile {
    server: ServerFileConfig,
    limits: LimitsFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LimitsFileConfig {
    max_frame_bytes: Option<usize>,
    rate_limit_per_sec: Option<u32>,
    rate_limit_burst: Option<u32>,
    read_idle_timeout_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the hub server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time collaboration hub")]
pub struct HubCliArgs {
    /// Address to bind the hub server to.
    #[arg(short, long, env = "HUB_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/hub-core/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum WebSocket frame size in bytes.
    #[arg(long)]
    pub max_frame_bytes: Option<usize>,

    /// Sustained inbound frames per second allowed per connection.
    #[arg(long)]
    pub rate_limit_per_sec: Option<u32>,

    /// Burst capacity for the per-connection rate limiter.
    #[arg(long)]
    pub rate_limit_burst: Option<u32>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUB_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved hub server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:8080`).
    pub bind_addr: String,
    /// Maximum allowed WebSocket frame size in bytes.
    pub max_frame_bytes: usize,
    /// Sustained token bucket refill rate, tokens per second.
    pub rate_limit_per_sec: u32,
    /// Token bucket burst capacity.
    pub rate_limit_burst: u32,
    /// Read deadline reset on every inbound frame or pong.
    pub read_idle_timeout_secs: u64,
    /// Server ping cadence, must stay below `read_idle_timeout_secs`.
    pub ping_interval_secs: u64,
    /// Deadline for a single outbound write.
    pub write_timeout_secs: u64,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_frame_bytes: 512 * 1024,
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            read_idle_timeout_secs: 60,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicitly named config file cannot be
    /// read or parsed.
    pub fn load(cli: &HubCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `HubConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &HubCliArgs, file: &HubConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_bytes: cli
                .max_frame_bytes
                .or(file.limits.max_frame_bytes)
                .unwrap_or(defaults.max_frame_bytes),
            rate_limit_per_sec: cli
                .rate_limit_per_sec
                .or(file.limits.rate_limit_per_sec)
                .unwrap_or(defaults.rate_limit_per_sec),
            rate_limit_burst: cli
                .rate_limit_burst
                .or(file.limits.rate_limit_burst)
                .unwrap_or(defaults.rate_limit_burst),
            read_idle_timeout_secs: file
                .limits
                .read_idle_timeout_secs
                .unwrap_or(defaults.read_idle_timeout_secs),
            ping_interval_secs: file
                .limits
                .ping_interval_secs
                .unwrap_or(defaults.ping_interval_secs),
            write_timeout_secs: file
                .limits
                .write_timeout_secs
                .unwrap_or(defaults.write_timeout_secs),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<HubConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(HubConfigFile::default());
        };
        config_dir.join("hub-core").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
