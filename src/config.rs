//! Broker configuration
//!
//! Settings come from an optional TOML file (`--config <path>`) with
//! command-line flags layered on top. Every key has a default, so an empty
//! file (or none at all) is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::reconnect::{with_reconnect_suffix, RECONNECT_SUFFIX};

// ============================================================================
// Constants
// ============================================================================

/// Default broker port
pub const DEFAULT_PORT: u16 = 9618;

/// Default kernel buffer size for brokered connections
const DEFAULT_BUFFER_SIZE: usize = 2 * 1024;

/// Default reconnect sweep interval (20 minutes)
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 1200;

// ============================================================================
// Types
// ============================================================================

/// How target connections are watched for readability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Use a readiness watcher if the platform provides one
    Auto,
    /// Always scan targets on the polling timer
    Scan,
}

impl PollMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(PollMode::Auto),
            "scan" => Some(PollMode::Scan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Address to accept registrations and requests on
    pub listen: SocketAddr,
    /// Address placed in contact strings (defaults to the bound address)
    pub advertise_address: Option<String>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Records unseen for twice this long are expired
    pub sweep_interval_secs: u64,
    /// Let a target reclaim its ccbid from a different IP
    pub reconnect_allow_any_ip: bool,
    pub reconnect_file: Option<PathBuf>,
    /// Directory for the default reconnect log
    pub spool_dir: PathBuf,
    /// Fraction of wall time the polling timer may use
    pub polling_timeslice: f64,
    pub polling_interval_secs: u64,
    pub polling_max_interval_secs: u64,
    /// Broker-initiated keepalive period; 0 disables
    pub heartbeat_interval_secs: u64,
    /// Read/write timeout on every brokered socket
    pub io_timeout_ms: u64,
    /// How long an accepted connection may stay silent
    pub command_timeout_secs: u64,
    pub poll_mode: PollMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_address: None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            reconnect_allow_any_ip: false,
            reconnect_file: None,
            spool_dir: PathBuf::from("."),
            polling_timeslice: 0.05,
            polling_interval_secs: 20,
            polling_max_interval_secs: 600,
            heartbeat_interval_secs: 300,
            io_timeout_ms: 1000,
            command_timeout_secs: 20,
            poll_mode: PollMode::Auto,
        }
    }
}

impl BrokerConfig {
    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: BrokerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from command-line arguments
    ///
    /// ```text
    /// --config <path>             TOML file with defaults for everything below
    /// --listen <addr:port>        Listen address
    /// --advertise <addr:port>     Address published in contact strings
    /// --reconnect-file <path>     Reconnect log
    /// --spool <dir>               Directory for the default reconnect log
    /// --sweep-interval <secs>     Reconnect record sweep interval
    /// --heartbeat-interval <secs> Keepalive period (0 disables)
    /// --poll-mode <auto|scan>     Target readiness mechanism
    /// --allow-any-ip              Allow reconnects from a different IP
    /// ```
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(listen) = parse_arg(args, "--listen") {
            config.listen = listen
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad listen address '{}'", listen)))?;
        }
        if let Some(addr) = parse_arg(args, "--advertise") {
            config.advertise_address = Some(addr);
        }
        if let Some(path) = parse_arg(args, "--reconnect-file") {
            config.reconnect_file = Some(PathBuf::from(path));
        }
        if let Some(dir) = parse_arg(args, "--spool") {
            config.spool_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_arg(args, "--sweep-interval") {
            config.sweep_interval_secs = parse_number(&secs, "--sweep-interval")?;
        }
        if let Some(secs) = parse_arg(args, "--heartbeat-interval") {
            config.heartbeat_interval_secs = parse_number(&secs, "--heartbeat-interval")?;
        }
        if let Some(mode) = parse_arg(args, "--poll-mode") {
            config.poll_mode = PollMode::parse(&mode)
                .ok_or_else(|| ConfigError::Invalid(format!("bad poll mode '{}'", mode)))?;
        }
        if has_flag(args, "--allow-any-ip") {
            config.reconnect_allow_any_ip = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".into()));
        }
        if self.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid("polling_interval_secs must be positive".into()));
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("io_timeout_ms must be positive".into()));
        }
        if !(self.polling_timeslice > 0.0 && self.polling_timeslice <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "polling_timeslice {} outside (0, 1]",
                self.polling_timeslice
            )));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn polling_max_interval(&self) -> Duration {
        Duration::from_secs(self.polling_max_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Path of the reconnect log for a broker advertised at `address`
    pub fn reconnect_path(&self, address: &str) -> PathBuf {
        match &self.reconnect_file {
            Some(path) => with_reconnect_suffix(path.clone()),
            None => {
                let (host, port) = match address.rsplit_once(':') {
                    Some((host, port)) => (host, port),
                    None => (address, "0"),
                };
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let host = if host.is_empty() { "localhost" } else { host };
                self.spool_dir
                    .join(format!("{}-{}{}", host, port, RECONNECT_SUFFIX))
            }
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_number(value: &str, flag: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} expects a number, got '{}'", flag, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ccb-broker")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.sweep_interval_secs, 1200);
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.poll_mode, PollMode::Auto);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_flags_override() {
        let config = BrokerConfig::from_args(&args(&[
            "--listen",
            "127.0.0.1:7000",
            "--sweep-interval",
            "60",
            "--heartbeat-interval",
            "0",
            "--poll-mode",
            "scan",
            "--allow-any-ip",
        ]))
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.poll_mode, PollMode::Scan);
        assert!(config.reconnect_allow_any_ip);
    }

    #[test]
    fn test_bad_flags_rejected() {
        assert!(BrokerConfig::from_args(&args(&["--listen", "nowhere"])).is_err());
        assert!(BrokerConfig::from_args(&args(&["--poll-mode", "select"])).is_err());
        assert!(BrokerConfig::from_args(&args(&["--sweep-interval", "0"])).is_err());
    }

    #[test]
    fn test_toml_file_then_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccb.toml");
        std::fs::write(
            &path,
            "sweep_interval_secs = 90\n\
             reconnect_allow_any_ip = true\n\
             poll_mode = \"scan\"\n\
             polling_timeslice = 0.1\n",
        )
        .unwrap();

        let config = BrokerConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--sweep-interval",
            "30",
        ]))
        .unwrap();
        assert_eq!(config.sweep_interval_secs, 30);
        assert!(config.reconnect_allow_any_ip);
        assert_eq!(config.poll_mode, PollMode::Scan);
        assert_eq!(config.polling_timeslice, 0.1);
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccb.toml");
        std::fs::write(&path, "sweep_intervall = 5\n").unwrap();
        assert!(matches!(BrokerConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_polling_interval_rejected() {
        let config = BrokerConfig {
            polling_interval_secs: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccb.toml");
        std::fs::write(&path, "polling_interval_secs = 0\n").unwrap();
        assert!(BrokerConfig::load(&path).is_err());
    }

    #[test]
    fn test_timeslice_validation() {
        let config = BrokerConfig {
            polling_timeslice: 1.5,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_path() {
        let config = BrokerConfig {
            spool_dir: PathBuf::from("/var/spool/ccb"),
            ..BrokerConfig::default()
        };
        assert_eq!(
            config.reconnect_path("10.0.0.1:9618"),
            PathBuf::from("/var/spool/ccb/10.0.0.1-9618.ccb_reconnect")
        );
        assert_eq!(
            config.reconnect_path("[::1]:9618"),
            PathBuf::from("/var/spool/ccb/::1-9618.ccb_reconnect")
        );

        let explicit = BrokerConfig {
            reconnect_file: Some(PathBuf::from("/tmp/ccb")),
            ..BrokerConfig::default()
        };
        assert_eq!(
            explicit.reconnect_path("ignored:1"),
            PathBuf::from("/tmp/ccb.ccb_reconnect")
        );
    }
}
