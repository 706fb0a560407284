use anyhow::{Context, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use pickaxe_core::MinerConfig;
use pickaxe_stratum::{PoolConfig, ProtocolVersion, StratumConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Contents of `config.toml`. Every field is optional; flags fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub pool: PoolSection,
    pub mining: MiningSection,
    pub connection: ConnectionSection,
}

/// `[pool]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<ProtocolVersion>,
    /// Hex pool authority key for the binary protocol
    pub public_key: Option<String>,
}

/// `[mining]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiningSection {
    pub threads: Option<usize>,
    pub check_interval: Option<u64>,
    pub share_queue: Option<usize>,
}

/// `[connection]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSection {
    pub connect_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub retry_initial_ms: Option<u64>,
    pub retry_max_secs: Option<u64>,
}

/// Values given on the command line; they win over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<ProtocolVersion>,
    pub threads: Option<usize>,
}

/// Delay policy between sessions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff that never gives up; the loop ends on ctrl-c only
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Fully resolved settings for `pickaxe run`
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub miner: MinerConfig,
    pub retry: RetryPolicy,
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pickaxe")
        .join("config.toml")
}

/// Load the config file.
///
/// An explicit path must exist. A missing file at the default location
/// yields an empty configuration.
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    if !path.exists() {
        if explicit {
            anyhow::bail!("Configuration file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Merge the file with command-line overrides
pub fn resolve(file: FileConfig, overrides: &Overrides) -> Result<RunSettings> {
    let url = overrides
        .url
        .clone()
        .or(file.pool.url)
        .context("Pool URL must be given with --url or [pool].url")?;
    let username = overrides
        .user
        .clone()
        .or(file.pool.user)
        .context("Pool user must be given with --user or [pool].user")?;
    let password = overrides
        .password
        .clone()
        .or(file.pool.password)
        .unwrap_or_else(|| "x".to_string());

    let mut stratum = StratumConfig::new(PoolConfig {
        url,
        username,
        password,
        protocol: overrides.protocol.or(file.pool.protocol),
    });
    stratum.pool_public_key = file.pool.public_key;
    if let Some(secs) = file.connection.connect_timeout_secs {
        stratum.connection_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.connection.handshake_timeout_secs {
        stratum.handshake_timeout = Duration::from_secs(secs);
    }
    stratum.validate().map_err(anyhow::Error::msg)?;

    let mut miner = MinerConfig::new(stratum);
    if let Some(threads) = overrides.threads.or(file.mining.threads) {
        miner.workers = threads;
    }
    if let Some(interval) = file.mining.check_interval {
        miner.check_interval = interval.max(1);
    }
    if let Some(queue) = file.mining.share_queue {
        miner.share_queue = queue;
    }

    let mut retry = RetryPolicy::default();
    if let Some(ms) = file.connection.retry_initial_ms {
        retry.initial = Duration::from_millis(ms);
    }
    if let Some(secs) = file.connection.retry_max_secs {
        retry.max = Duration::from_secs(secs);
    }
    if retry.max < retry.initial {
        retry.max = retry.initial;
    }

    Ok(RunSettings { miner, retry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[pool]
url = "stratum2+tcp://pool.example.com:34254"
user = "wallet.rig1"

[mining]
threads = 4
check_interval = 1024

[connection]
handshake_timeout_secs = 5
retry_initial_ms = 250
"#;

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.pool.user.as_deref(), Some("wallet.rig1"));
        assert_eq!(config.mining.threads, Some(4));
        assert_eq!(config.connection.retry_initial_ms, Some(250));
        assert_eq!(config.connection.retry_max_secs, None);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[pool]\nwallet = \"abc\"\n").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let overrides = Overrides {
            url: Some("stratum+tcp://other.example.com:3333".to_string()),
            threads: Some(2),
            ..Default::default()
        };

        let settings = resolve(file, &overrides).unwrap();
        let pool = &settings.miner.stratum.pool;
        assert_eq!(pool.url, "stratum+tcp://other.example.com:3333");
        assert_eq!(pool.protocol_version(), ProtocolVersion::V1);
        assert_eq!(pool.username, "wallet.rig1");
        assert_eq!(pool.password, "x");
        assert_eq!(settings.miner.workers, 2);
        assert_eq!(settings.miner.check_interval, 1024);
        assert_eq!(settings.miner.stratum.handshake_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry.initial, Duration::from_millis(250));
        assert_eq!(settings.retry.max, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_url_or_user() {
        assert!(resolve(FileConfig::default(), &Overrides::default()).is_err());

        let overrides = Overrides {
            url: Some("stratum+tcp://pool.example.com:3333".to_string()),
            ..Default::default()
        };
        assert!(resolve(FileConfig::default(), &overrides).is_err());
    }

    #[test]
    fn test_invalid_url_fails_validation() {
        let overrides = Overrides {
            url: Some("stratum+tcp://pool.example.com".to_string()),
            user: Some("wallet".to_string()),
            ..Default::default()
        };
        assert!(resolve(FileConfig::default(), &overrides).is_err());
    }
}
