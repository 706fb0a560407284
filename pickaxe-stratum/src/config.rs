use crate::protocol::MAX_EXTRANONCE2_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire format spoken with the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// Line-delimited JSON-RPC (Stratum V1)
    #[default]
    V1,

    /// Fixed-header binary frames (Stratum V2)
    V2,
}

/// Pool configuration for Stratum connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool URL (hostname:port, stratum+tcp://hostname:port or
    /// stratum2+tcp://hostname:port)
    pub url: String,

    /// Worker username (usually wallet.worker_name)
    pub username: String,

    /// Worker password (often just 'x' for most pools)
    #[serde(default = "default_password")]
    pub password: String,

    /// Protocol override; inferred from the URL scheme when absent
    #[serde(default)]
    pub protocol: Option<ProtocolVersion>,
}

/// Stratum session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumConfig {
    /// Pool to connect to
    pub pool: PoolConfig,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Connection timeout
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,

    /// Time allowed between transport connect and handshake success
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Upper bound for the best-effort flush while closing
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout: Duration,

    /// Largest binary payload accepted before the stream is declared
    /// desynchronized
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Longest text line accepted
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,

    /// Pool authority key sent in the binary setup message (hex, 32 bytes)
    #[serde(default)]
    pub pool_public_key: Option<String>,

    /// Largest extranonce the binary setup message asks for
    #[serde(default = "default_max_extranonce_size")]
    pub max_extranonce_size: u32,

    /// Extra nonce 2 size override (text protocol)
    #[serde(default)]
    pub extranonce2_size: Option<usize>,
}

impl StratumConfig {
    /// Configuration with defaults for everything but the pool
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            user_agent: default_user_agent(),
            connection_timeout: default_connection_timeout(),
            handshake_timeout: default_handshake_timeout(),
            flush_timeout: default_flush_timeout(),
            max_payload_len: default_max_payload_len(),
            max_line_len: default_max_line_len(),
            pool_public_key: None,
            max_extranonce_size: default_max_extranonce_size(),
            extranonce2_size: None,
        }
    }

    /// Decode `pool_public_key`, zero when unset
    pub fn pool_public_key_bytes(&self) -> Result<[u8; 32], String> {
        let mut key = [0u8; 32];
        if let Some(hex_key) = &self.pool_public_key {
            hex::decode_to_slice(hex_key, &mut key)
                .map_err(|e| format!("Invalid pool public key: {}", e))?;
        }
        Ok(key)
    }

    /// Check the settings a session cannot start without
    pub fn validate(&self) -> Result<(), String> {
        self.pool.parse_url()?;
        self.pool_public_key_bytes()?;
        if self.pool.username.is_empty() {
            return Err("Pool username must not be empty".to_string());
        }
        if self.max_payload_len > u16::MAX as usize {
            return Err(format!(
                "max_payload_len {} exceeds the 16-bit frame length",
                self.max_payload_len
            ));
        }
        if let Some(size) = self.extranonce2_size {
            if size > MAX_EXTRANONCE2_SIZE {
                return Err(format!(
                    "extranonce2_size {} exceeds {} bytes",
                    size, MAX_EXTRANONCE2_SIZE
                ));
            }
        }
        Ok(())
    }
}

impl PoolConfig {
    /// Parse URL to extract host and port
    pub fn parse_url(&self) -> Result<(String, u16), String> {
        let url = self.strip_scheme();

        let (host, port) = url
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid pool URL format: {}", self.url))?;
        if host.is_empty() {
            return Err(format!("Missing host in URL: {}", self.url));
        }

        let port = port
            .trim_end_matches('/')
            .parse::<u16>()
            .map_err(|_| format!("Invalid port in URL: {}", self.url))?;

        Ok((host.to_string(), port))
    }

    /// Protocol to speak: the explicit override, else the URL scheme
    pub fn protocol_version(&self) -> ProtocolVersion {
        if let Some(protocol) = self.protocol {
            return protocol;
        }
        if self.url.starts_with("stratum2+tcp://") || self.url.starts_with("stratum2://") {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }

    fn strip_scheme(&self) -> &str {
        ["stratum2+tcp://", "stratum2://", "stratum+tcp://", "stratum://"]
            .iter()
            .find_map(|scheme| self.url.strip_prefix(scheme))
            .unwrap_or(&self.url)
    }
}

// Default value functions for serde
fn default_password() -> String { "x".to_string() }
fn default_connection_timeout() -> Duration { Duration::from_secs(30) }
fn default_handshake_timeout() -> Duration { Duration::from_secs(30) }
fn default_flush_timeout() -> Duration { Duration::from_secs(2) }
fn default_max_payload_len() -> usize { 16 * 1024 }
fn default_max_line_len() -> usize { 64 * 1024 }
fn default_max_extranonce_size() -> u32 { 8 }
fn default_user_agent() -> String {
    format!("Pickaxe/{}", env!("CARGO_PKG_VERSION"))
}
