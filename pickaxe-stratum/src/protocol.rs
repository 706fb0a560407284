//! Stratum V1: line-delimited JSON-RPC messages and their codec

use crate::error::{Result, StratumError};
use bytes::BytesMut;
use pickaxe_hash::Hash256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::codec::{Decoder, Encoder, LinesCodec};
use tracing::trace;

/// Stratum JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Vec<Value>,
}

/// Stratum JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<StratumRpcError>,
}

/// Stratum JSON-RPC error.
///
/// Pools disagree on the shape: most send `[code, "message", data]`, some
/// send a JSON-RPC 2.0 object, a few send a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StratumRpcError {
    Tuple(i64, String, Value),
    Object {
        code: i64,
        message: String,
    },
    Other(Value),
}

impl StratumRpcError {
    pub fn code(&self) -> i64 {
        match self {
            StratumRpcError::Tuple(code, _, _) | StratumRpcError::Object { code, .. } => *code,
            StratumRpcError::Other(_) => -1,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StratumRpcError::Tuple(_, message, _) | StratumRpcError::Object { message, .. } => {
                message.clone()
            }
            StratumRpcError::Other(Value::String(message)) => message.clone(),
            StratumRpcError::Other(value) => value.to_string(),
        }
    }
}

impl From<StratumRpcError> for StratumError {
    fn from(e: StratumRpcError) -> Self {
        StratumError::JsonRpc {
            code: e.code(),
            message: e.message(),
        }
    }
}

impl StratumResponse {
    /// Request id as an integer, when the pool echoed one back
    pub fn numeric_id(&self) -> Option<u64> {
        match &self.id {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// `result == true` without an error
    pub fn is_true(&self) -> bool {
        self.error.is_none() && matches!(self.result, Some(Value::Bool(true)))
    }
}

/// Stratum methods
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_EXTRA_NONCE: &str = "mining.set_extranonce";
    pub const RECONNECT: &str = "client.reconnect";
    pub const SHOW_MESSAGE: &str = "client.show_message";
}

impl StratumRequest {
    /// Create a mining.subscribe request
    pub fn subscribe(id: u64, user_agent: &str) -> Self {
        Self {
            id: Some(id.into()),
            method: methods::SUBSCRIBE.to_string(),
            params: vec![Value::String(user_agent.to_string())],
        }
    }

    /// Create a mining.authorize request
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self {
            id: Some(id.into()),
            method: methods::AUTHORIZE.to_string(),
            params: vec![
                Value::String(username.to_string()),
                Value::String(password.to_string()),
            ],
        }
    }

    /// Create a mining.submit request
    pub fn submit(
        id: u64,
        username: &str,
        job_id: &str,
        extranonce2: &[u8],
        ntime: u32,
        nonce: u32,
    ) -> Self {
        Self {
            id: Some(id.into()),
            method: methods::SUBMIT.to_string(),
            params: vec![
                Value::String(username.to_string()),
                Value::String(job_id.to_string()),
                Value::String(hex::encode(extranonce2)),
                Value::String(format!("{:08x}", ntime)),
                Value::String(format!("{:08x}", nonce)),
            ],
        }
    }
}

/// Parameters of a `mining.notify`, decoded into bytes and integers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningNotify {
    pub job_id: String,
    /// Previous block hash as sent (each 4-byte word byte-swapped)
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branch: Vec<Hash256>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
}

impl MiningNotify {
    /// Parse from mining.notify params
    pub fn from_params(params: &[Value]) -> std::result::Result<Self, String> {
        if params.len() < 9 {
            return Err(format!("mining.notify expects 9 params, got {}", params.len()));
        }

        let mut prev_hash = [0u8; 32];
        hex::decode_to_slice(str_param(params, 1, "prev_hash")?, &mut prev_hash)
            .map_err(|e| format!("Invalid prev_hash: {}", e))?;

        let merkle_branch = params[4]
            .as_array()
            .ok_or("Invalid merkle_branch")?
            .iter()
            .map(|v| {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(v.as_str().ok_or("Invalid merkle branch")?, &mut bytes)
                    .map_err(|e| format!("Invalid merkle branch: {}", e))?;
                Ok(Hash256(bytes))
            })
            .collect::<std::result::Result<Vec<_>, String>>()?;

        Ok(Self {
            job_id: str_param(params, 0, "job_id")?.to_string(),
            prev_hash,
            coinbase1: hex_param(params, 2, "coinbase1")?,
            coinbase2: hex_param(params, 3, "coinbase2")?,
            merkle_branch,
            version: u32_param(params, 5, "version")?,
            nbits: u32_param(params, 6, "nbits")?,
            ntime: u32_param(params, 7, "ntime")?,
            clean_jobs: params[8].as_bool().ok_or("Invalid clean_jobs")?,
        })
    }

    /// Previous block hash in header byte order
    pub fn header_prev_hash(&self) -> Hash256 {
        let mut bytes = self.prev_hash;
        for word in bytes.chunks_exact_mut(4) {
            word.reverse();
        }
        Hash256(bytes)
    }
}

impl fmt::Display for MiningNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job {} (clean: {})", self.job_id, self.clean_jobs)
    }
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> std::result::Result<&'a str, String> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Invalid {}", name))
}

fn hex_param(params: &[Value], index: usize, name: &str) -> std::result::Result<Vec<u8>, String> {
    hex::decode(str_param(params, index, name)?).map_err(|e| format!("Invalid {}: {}", name, e))
}

fn u32_param(params: &[Value], index: usize, name: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(str_param(params, index, name)?, 16)
        .map_err(|e| format!("Invalid {}: {}", name, e))
}

/// Largest extranonce2 a pool may ask the miner to roll
pub const MAX_EXTRANONCE2_SIZE: usize = 32;

fn extranonce2_size(value: &Value) -> std::result::Result<usize, String> {
    let size = value.as_u64().ok_or("Invalid extranonce2_size")?;
    match usize::try_from(size) {
        Ok(size) if size <= MAX_EXTRANONCE2_SIZE => Ok(size),
        _ => Err(format!(
            "extranonce2_size {} exceeds {} bytes",
            size, MAX_EXTRANONCE2_SIZE
        )),
    }
}

/// Mining.subscribe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub subscription_id: Option<String>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

impl SubscribeResult {
    /// Parse from mining.subscribe response
    pub fn from_result(result: &Value) -> std::result::Result<Self, String> {
        let arr = result.as_array().ok_or("Invalid subscribe result format")?;
        if arr.len() < 2 {
            return Err("Invalid subscribe result length".to_string());
        }

        let extranonce1 = hex::decode(arr[1].as_str().ok_or("Invalid extranonce1")?)
            .map_err(|e| format!("Invalid extranonce1: {}", e))?;

        let extranonce2_size = match arr.get(2) {
            Some(v) => extranonce2_size(v)?,
            None => 4,
        };

        Ok(Self {
            subscription_id: subscription_id(&arr[0]),
            extranonce1,
            extranonce2_size,
        })
    }
}

/// Pick the notify subscription id out of `[["mining.notify", id], ...]`
/// or the flat `["mining.notify", id]` form.
fn subscription_id(subscriptions: &Value) -> Option<String> {
    let list = subscriptions.as_array()?;
    let pairs: Vec<&[Value]> = if list.first().map_or(false, Value::is_string) {
        vec![list.as_slice()]
    } else {
        list.iter().filter_map(Value::as_array).map(Vec::as_slice).collect()
    };

    let id_of = |pair: &&[Value]| pair.get(1).and_then(Value::as_str).map(String::from);
    pairs
        .iter()
        .find(|pair| pair.first().and_then(Value::as_str) == Some(methods::NOTIFY))
        .and_then(id_of)
        .or_else(|| pairs.first().and_then(id_of))
}

/// Message received from a V1 pool
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Reply to one of our requests
    Response(StratumResponse),
    Notify(MiningNotify),
    SetDifficulty(f64),
    SetExtranonce {
        extranonce1: Vec<u8>,
        extranonce2_size: Option<usize>,
    },
    Reconnect {
        host: Option<String>,
        port: Option<u16>,
        wait: Option<u64>,
    },
    ShowMessage(String),
    /// Method this client does not handle, kept verbatim
    Unknown(String),
}

impl ServerMessage {
    /// Interpret one line
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| StratumError::Malformed(format!("{}: {}", e, line)))?;

        let method = match value.get("method").and_then(Value::as_str) {
            Some(method) => method.to_string(),
            None => {
                return serde_json::from_value(value)
                    .map(ServerMessage::Response)
                    .map_err(|e| StratumError::Malformed(format!("{}: {}", e, line)))
            }
        };

        let empty = Vec::new();
        let params = value.get("params").and_then(Value::as_array).unwrap_or(&empty);
        let malformed = |reason: String| StratumError::Malformed(format!("{}: {}", method, reason));

        let message = match method.as_str() {
            methods::NOTIFY => ServerMessage::Notify(MiningNotify::from_params(params).map_err(malformed)?),
            methods::SET_DIFFICULTY => ServerMessage::SetDifficulty(
                params
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| malformed("missing difficulty".to_string()))?,
            ),
            methods::SET_EXTRA_NONCE => {
                let extranonce1 = params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("missing extranonce1".to_string()))?;
                ServerMessage::SetExtranonce {
                    extranonce1: hex::decode(extranonce1).map_err(|e| malformed(e.to_string()))?,
                    extranonce2_size: params
                        .get(1)
                        .filter(|v| !v.is_null())
                        .map(extranonce2_size)
                        .transpose()
                        .map_err(malformed)?,
                }
            }
            methods::RECONNECT => ServerMessage::Reconnect {
                host: params.first().and_then(Value::as_str).map(String::from),
                port: params.get(1).and_then(|p| match p {
                    Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                }),
                wait: params.get(2).and_then(Value::as_u64),
            },
            methods::SHOW_MESSAGE => ServerMessage::ShowMessage(
                params.first().and_then(Value::as_str).unwrap_or_default().to_string(),
            ),
            _ => ServerMessage::Unknown(line.to_string()),
        };
        Ok(message)
    }
}

/// Codec for the V1 line protocol
#[derive(Debug)]
pub struct TextCodec {
    lines: LinesCodec,
}

impl TextCodec {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_len),
        }
    }
}

impl Decoder for TextCodec {
    type Item = ServerMessage;
    type Error = StratumError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>> {
        loop {
            let line = match self.lines.decode(src)? {
                Some(line) => line,
                None => return Ok(None),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(line, "received");
            return ServerMessage::parse(line).map(Some);
        }
    }
}

impl Encoder<StratumRequest> for TextCodec {
    type Error = StratumError;

    fn encode(&mut self, item: StratumRequest, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)?;
        trace!(line = %line, "sending");
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
