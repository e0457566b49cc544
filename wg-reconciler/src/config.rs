//! Layered configuration for the reconciler binary, following the same
//! CLI > env > TOML file > default priority as `termchat-relay::config`
//! (and `hub-core::config`).

use std::path::PathBuf;

/// Errors that can occur when loading reconciler configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconcilerConfigFile {
    device: DeviceFileConfig,
    metrics: MetricsFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeviceFileConfig {
    interface: Option<String>,
    private_key: Option<String>,
    listen_port: Option<u16>,
    reconcile_interval_secs: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MetricsFileConfig {
    bind_addr: Option<String>,
}

/// CLI arguments for the reconciler binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "WireGuard control-plane reconciler")]
pub struct ReconcilerCliArgs {
    /// WireGuard interface name to manage.
    #[arg(long, env = "WG_INTERFACE")]
    pub interface: Option<String>,

    /// Base64-encoded device private key.
    #[arg(long, env = "WG_PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// UDP listen port for the device.
    #[arg(long, env = "WG_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Seconds between reconcile ticks.
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    /// Address the `/metrics` endpoint binds to.
    #[arg(long, env = "WG_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Path to config file (default: `~/.config/wg-reconciler/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "WG_LOG")]
    pub log_level: String,
}

/// Fully resolved reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interface: String,
    /// Base64-encoded private key; validated (and turned into a [`crate::device::WgKey`])
    /// by the caller, since key parsing can fail and config loading should
    /// not conflate "missing field" with "invalid key material".
    pub private_key: Option<String>,
    pub listen_port: u16,
    pub reconcile_interval_secs: u64,
    pub metrics_addr: String,
    pub log_level: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            private_key: None,
            listen_port: 51820,
            reconcile_interval_secs: 30,
            metrics_addr: "0.0.0.0:9586".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Loads configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicitly-given config file cannot be
    /// read or parsed.
    pub fn load(cli: &ReconcilerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    #[must_use]
    fn resolve(cli: &ReconcilerCliArgs, file: &ReconcilerConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            interface: cli.interface.clone().or_else(|| file.device.interface.clone()).unwrap_or(defaults.interface),
            private_key: cli.private_key.clone().or_else(|| file.device.private_key.clone()),
            listen_port: cli.listen_port.or(file.device.listen_port).unwrap_or(defaults.listen_port),
            reconcile_interval_secs: cli
                .reconcile_interval_secs
                .or(file.device.reconcile_interval_secs)
                .unwrap_or(defaults.reconcile_interval_secs),
            metrics_addr: cli
                .metrics_addr
                .clone()
                .or_else(|| file.metrics.bind_addr.clone())
                .unwrap_or(defaults.metrics_addr),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ReconcilerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents =
            std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile { path: p.to_path_buf(), source: e })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ReconcilerConfigFile::default());
        };
        config_dir.join("wg-reconciler").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReconcilerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
