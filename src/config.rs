//! `serve` configuration: an optional TOML file overlaid by flags and env.
//!
//! Priority, highest first: command line flags, `DISPATCH_*` environment
//! variables, the `--config` file, built-in defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_BIND: &str = "0.0.0.0:4456";
pub const DEFAULT_ROUTE_PREFIX: &str = "/dispatch";
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: u64 = 120;

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// TOML file with server settings
    #[arg(long, env = "DISPATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one snapshot directory per area
    #[arg(long, env = "DISPATCH_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "DISPATCH_BIND")]
    pub bind: Option<SocketAddr>,

    /// Path prefix for every route; empty serves at the root
    #[arg(long, env = "DISPATCH_ROUTE_PREFIX")]
    pub route_prefix: Option<String>,

    /// Robot firmware source served on /kernel
    #[arg(long, env = "DISPATCH_FIRMWARE")]
    pub firmware: Option<PathBuf>,

    /// Seconds of silence before a robot is reported offline
    #[arg(long, env = "DISPATCH_OFFLINE_TIMEOUT_SECS")]
    pub offline_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub bind: Option<SocketAddr>,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default)]
    pub firmware: Option<PathBuf>,
    #[serde(default)]
    pub offline_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    pub state_dir: PathBuf,
    pub bind: SocketAddr,
    pub route_prefix: String,
    pub firmware: PathBuf,
    pub offline_timeout: Duration,
}

impl ServeConfig {
    pub fn resolve(args: &ServeArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args.clone(), file)
    }

    fn merge(args: ServeArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let state_dir = args
            .state_dir
            .or(file.state_dir)
            .ok_or_else(|| ConfigError::Invalid("state_dir is required".to_string()))?;
        let firmware = args
            .firmware
            .or(file.firmware)
            .ok_or_else(|| ConfigError::Invalid("firmware is required".to_string()))?;
        let bind = match args.bind.or(file.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND
                .parse()
                .map_err(|err| ConfigError::Invalid(format!("default bind: {err}")))?,
        };
        let route_prefix = normalize_prefix(
            args.route_prefix
                .or(file.route_prefix)
                .as_deref()
                .unwrap_or(DEFAULT_ROUTE_PREFIX),
        )?;
        let timeout_secs = args
            .offline_timeout_secs
            .or(file.offline_timeout_secs)
            .unwrap_or(DEFAULT_OFFLINE_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "offline_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(Self {
            state_dir,
            bind,
            route_prefix,
            firmware,
            offline_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// `""` or `/segment[/segment...]` without a trailing slash.
fn normalize_prefix(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if !trimmed.starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "route_prefix must start with '/': {raw}"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dispatch.toml");
        fs::write(
            &path,
            r#"
state_dir = "/var/lib/dispatch"
firmware = "/etc/dispatch/kernel.lua"
bind = "127.0.0.1:9000"
route_prefix = "/72ceda8b/"
"#,
        )
        .expect("write config");
        let args = ServeArgs {
            config: Some(path),
            bind: Some("127.0.0.1:9100".parse().expect("addr")),
            ..ServeArgs::default()
        };
        let config = ServeConfig::resolve(&args).expect("resolve");
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/dispatch"));
        assert_eq!(config.bind.port(), 9100);
        assert_eq!(config.route_prefix, "/72ceda8b");
        assert_eq!(
            config.offline_timeout,
            Duration::from_secs(DEFAULT_OFFLINE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn defaults_fill_optional_values() {
        let args = ServeArgs {
            state_dir: Some("state".into()),
            firmware: Some("kernel.lua".into()),
            route_prefix: Some(String::new()),
            ..ServeArgs::default()
        };
        let config = ServeConfig::resolve(&args).expect("resolve");
        assert_eq!(config.bind, DEFAULT_BIND.parse().expect("addr"));
        assert_eq!(config.route_prefix, "");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let missing = ServeConfig::resolve(&ServeArgs::default()).expect_err("no state dir");
        assert!(matches!(missing, ConfigError::Invalid(_)));

        let args = ServeArgs {
            state_dir: Some("state".into()),
            firmware: Some("kernel.lua".into()),
            route_prefix: Some("api".into()),
            ..ServeArgs::default()
        };
        assert!(ServeConfig::resolve(&args).is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "listen = 3\n").expect("write config");
        let args = ServeArgs {
            config: Some(path),
            ..ServeArgs::default()
        };
        assert!(matches!(
            ServeConfig::resolve(&args),
            Err(ConfigError::Parse { .. })
        ));
    }
}
