//! Stratum V2 binary frames.
//!
//! Every frame is a 4-byte header (protocol tag, message type, little-endian
//! payload length) followed by exactly `payload_len` bytes. Integers inside
//! payloads are little-endian; string fields are fixed 32-byte, null padded.

use crate::error::{Result, StratumError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pickaxe_hash::Hash256;
use tokio_util::codec::{Decoder, Encoder};

/// First byte of every frame
pub const PROTOCOL_TAG: u8 = 0x02;

/// Frame header size in bytes
pub const HEADER_LEN: usize = 4;

/// Width of fixed string fields
pub const FIXED_STR_LEN: usize = 32;

/// Message type constants
pub mod msg_type {
    pub const SETUP_CONNECTION: u8 = 0x00;
    pub const SETUP_CONNECTION_SUCCESS: u8 = 0x01;
    pub const SETUP_CONNECTION_ERROR: u8 = 0x02;
    pub const SUBMIT_SHARES: u8 = 0x06;
    pub const NEW_MINING_JOB: u8 = 0x64;
}

const SETUP_CONNECTION_LEN: usize = 32 + FIXED_STR_LEN * 2 + 4;
const NEW_MINING_JOB_FIXED_LEN: usize = 4 + 1 + 4 + 4 + 32 * 4 + 4;

/// Client handshake (`SetupConnection`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnection {
    pub pool_public_key: [u8; 32],
    pub user_agent: String,
    pub user_identity: String,
    pub max_extranonce_size: u32,
}

/// Share submission (`SubmitShares`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitShares {
    pub session_id: u32,
    pub job_id: u32,
    pub nonce: u32,
}

/// Job announcement (`NewMiningJob`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMiningJob {
    pub job_id: u32,
    pub future_job: bool,
    pub version: u32,
    pub bits: u32,
    pub prev_hash: Hash256,
    pub coinbase_prefix: [u8; 32],
    pub coinbase_suffix: [u8; 32],
    pub merkle_root: Hash256,
    pub ntime: u32,
    pub merkle_branch: Vec<Hash256>,
}

/// A decoded V2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SetupConnection(SetupConnection),
    SetupConnectionSuccess { session_id: u32 },
    SetupConnectionError { error_code: String },
    SubmitShares(SubmitShares),
    NewMiningJob(NewMiningJob),
    /// A message type this client does not interpret
    Unknown { msg_type: u8, payload: Bytes },
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::SetupConnection(_) => msg_type::SETUP_CONNECTION,
            Message::SetupConnectionSuccess { .. } => msg_type::SETUP_CONNECTION_SUCCESS,
            Message::SetupConnectionError { .. } => msg_type::SETUP_CONNECTION_ERROR,
            Message::SubmitShares(_) => msg_type::SUBMIT_SHARES,
            Message::NewMiningJob(_) => msg_type::NEW_MINING_JOB,
            Message::Unknown { msg_type, .. } => *msg_type,
        }
    }

    /// Interpret a complete payload
    pub fn decode_payload(msg_type: u8, mut payload: Bytes) -> Result<Self> {
        let need = |len: usize, name: &str, payload: &Bytes| {
            if payload.len() < len {
                Err(StratumError::Malformed(format!(
                    "{} payload is {} bytes, expected at least {}",
                    name,
                    payload.len(),
                    len
                )))
            } else {
                Ok(())
            }
        };

        let message = match msg_type {
            msg_type::SETUP_CONNECTION => {
                need(SETUP_CONNECTION_LEN, "SetupConnection", &payload)?;
                Message::SetupConnection(SetupConnection {
                    pool_public_key: get_array(&mut payload),
                    user_agent: get_fixed_str(&mut payload),
                    user_identity: get_fixed_str(&mut payload),
                    max_extranonce_size: payload.get_u32_le(),
                })
            }
            msg_type::SETUP_CONNECTION_SUCCESS => {
                need(4, "SetupConnectionSuccess", &payload)?;
                Message::SetupConnectionSuccess {
                    session_id: payload.get_u32_le(),
                }
            }
            msg_type::SETUP_CONNECTION_ERROR => Message::SetupConnectionError {
                error_code: get_fixed_str(&mut payload),
            },
            msg_type::SUBMIT_SHARES => {
                need(12, "SubmitShares", &payload)?;
                Message::SubmitShares(SubmitShares {
                    session_id: payload.get_u32_le(),
                    job_id: payload.get_u32_le(),
                    nonce: payload.get_u32_le(),
                })
            }
            msg_type::NEW_MINING_JOB => {
                need(NEW_MINING_JOB_FIXED_LEN, "NewMiningJob", &payload)?;
                let branch_len = payload.len() - NEW_MINING_JOB_FIXED_LEN;
                if branch_len % 32 != 0 {
                    return Err(StratumError::Malformed(format!(
                        "NewMiningJob merkle branch is {} bytes, not a multiple of 32",
                        branch_len
                    )));
                }
                let mut job = NewMiningJob {
                    job_id: payload.get_u32_le(),
                    future_job: payload.get_u8() != 0,
                    version: payload.get_u32_le(),
                    bits: payload.get_u32_le(),
                    prev_hash: Hash256(get_array(&mut payload)),
                    coinbase_prefix: get_array(&mut payload),
                    coinbase_suffix: get_array(&mut payload),
                    merkle_root: Hash256(get_array(&mut payload)),
                    ntime: payload.get_u32_le(),
                    merkle_branch: Vec::with_capacity(branch_len / 32),
                };
                while payload.has_remaining() {
                    job.merkle_branch.push(Hash256(get_array(&mut payload)));
                }
                Message::NewMiningJob(job)
            }
            _ => Message::Unknown { msg_type, payload },
        };
        Ok(message)
    }

    /// Append the payload (no header)
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Message::SetupConnection(setup) => {
                dst.put_slice(&setup.pool_public_key);
                put_fixed_str(dst, &setup.user_agent);
                put_fixed_str(dst, &setup.user_identity);
                dst.put_u32_le(setup.max_extranonce_size);
            }
            Message::SetupConnectionSuccess { session_id } => dst.put_u32_le(*session_id),
            Message::SetupConnectionError { error_code } => put_fixed_str(dst, error_code),
            Message::SubmitShares(submit) => {
                dst.put_u32_le(submit.session_id);
                dst.put_u32_le(submit.job_id);
                dst.put_u32_le(submit.nonce);
            }
            Message::NewMiningJob(job) => {
                dst.put_u32_le(job.job_id);
                dst.put_u8(job.future_job as u8);
                dst.put_u32_le(job.version);
                dst.put_u32_le(job.bits);
                dst.put_slice(job.prev_hash.as_bytes());
                dst.put_slice(&job.coinbase_prefix);
                dst.put_slice(&job.coinbase_suffix);
                dst.put_slice(job.merkle_root.as_bytes());
                dst.put_u32_le(job.ntime);
                for branch in &job.merkle_branch {
                    dst.put_slice(branch.as_bytes());
                }
            }
            Message::Unknown { payload, .. } => dst.put_slice(payload),
        }
    }
}

fn get_array(buf: &mut Bytes) -> [u8; 32] {
    let mut out = [0u8; 32];
    buf.copy_to_slice(&mut out);
    out
}

/// Read up to 32 bytes, stopping the string at the first NUL
fn get_fixed_str(buf: &mut Bytes) -> String {
    let field = buf.split_to(buf.len().min(FIXED_STR_LEN));
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Write exactly 32 bytes: truncated, then null padded
fn put_fixed_str(dst: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(FIXED_STR_LEN);
    dst.put_slice(&bytes[..len]);
    dst.put_bytes(0, FIXED_STR_LEN - len);
}

/// Codec for V2 frames
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    max_payload_len: usize,
}

impl BinaryCodec {
    pub fn new(max_payload_len: usize) -> Self {
        Self { max_payload_len }
    }
}

impl Decoder for BinaryCodec {
    type Item = Message;
    type Error = StratumError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Header is only peeked until the whole frame is buffered
        if src[0] != PROTOCOL_TAG {
            return Err(StratumError::Desync(format!(
                "unexpected protocol tag 0x{:02x}",
                src[0]
            )));
        }
        let msg_type = src[1];
        let payload_len = u16::from_le_bytes([src[2], src[3]]) as usize;
        if payload_len > self.max_payload_len {
            return Err(StratumError::Desync(format!(
                "payload length {} exceeds limit {}",
                payload_len, self.max_payload_len
            )));
        }

        let frame_len = HEADER_LEN + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        Message::decode_payload(msg_type, payload).map(Some)
    }
}

impl Encoder<Message> for BinaryCodec {
    type Error = StratumError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        item.encode_payload(&mut payload);
        let payload_len = u16::try_from(payload.len()).map_err(|_| {
            StratumError::Protocol(format!("payload of {} bytes does not fit a frame", payload.len()))
        })?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(PROTOCOL_TAG);
        dst.put_u8(item.msg_type());
        dst.put_u16_le(payload_len);
        dst.put_slice(&payload);
        Ok(())
    }
}
