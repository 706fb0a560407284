//! Session state machine.
//!
//! The session owns no socket. The transport driver reports resolve and
//! connect outcomes, hands over received bytes, and drains outgoing frames
//! and events; the session decides what every frame means.

use crate::{
    binary::{BinaryCodec, Message, NewMiningJob, SetupConnection, SubmitShares},
    config::{ProtocolVersion, StratumConfig},
    error::{Result, StratumError},
    job::{CommitmentSource, Job, JobId, JobSink, SessionId, ShareCandidate, ZeroCommitment},
    protocol::{MiningNotify, ServerMessage, StratumRequest, StratumResponse, SubscribeResult, TextCodec},
};
use bytes::{Bytes, BytesMut};
use pickaxe_hash::{HeaderTemplate, Target};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Resolving,
    Connecting,
    AwaitingHandshake,
    Mining,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something the owner of the session may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    HandshakeComplete(SessionId),
    JobPublished { job_id: JobId, generation: u64 },
    ShareSubmitted { job_id: JobId, nonce: u32 },
    ShareAccepted { job_id: JobId },
    ShareRejected { job_id: JobId, reason: String },
    ShareStale { job_id: JobId, generation: u64 },
    DifficultyChanged(f64),
    PoolMessage(String),
    ReconnectRequested { host: Option<String>, port: Option<u16> },
    Diagnostic(String),
    Closed,
}

/// What happened to a submitted candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Encoded and queued for the pool
    Sent,
    /// Older than the current job; dropped
    Stale,
    /// The session is not mining; dropped
    NotMining,
    /// Candidate lacks fields this protocol needs; dropped
    Invalid,
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub jobs_received: u64,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_stale: u64,
    pub diagnostics: u64,
}

enum FrameCodec {
    Text(TextCodec),
    Binary(BinaryCodec),
}

enum Frame {
    Text(ServerMessage),
    Binary(Message),
}

enum PendingJob {
    Text(MiningNotify),
    Binary(NewMiningJob),
}

/// Text-protocol bookkeeping
#[derive(Default)]
struct TextState {
    next_id: u64,
    subscribe_id: Option<u64>,
    authorize_id: Option<u64>,
    subscribed: bool,
    authorized: bool,
    subscription_id: Option<String>,
    extranonce1: Vec<u8>,
    extranonce2_size: usize,
    extranonce2_counter: u64,
    share_target: Option<Target>,
    submits: HashMap<u64, JobId>,
}

impl TextState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// One connected lifetime with a pool
pub struct Session {
    config: StratumConfig,
    protocol: ProtocolVersion,
    state: SessionState,
    sink: Arc<dyn JobSink>,
    commitment: Arc<dyn CommitmentSource>,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    events: VecDeque<SessionEvent>,
    generation: u64,
    published: bool,
    session_id: Option<SessionId>,
    pending: Option<PendingJob>,
    text: TextState,
    stats: SessionStats,
}

impl Session {
    /// Create a disconnected session publishing into `sink`
    pub fn new(config: StratumConfig, sink: Arc<dyn JobSink>) -> Self {
        let protocol = config.pool.protocol_version();
        let codec = match protocol {
            ProtocolVersion::V1 => FrameCodec::Text(TextCodec::new(config.max_line_len)),
            ProtocolVersion::V2 => FrameCodec::Binary(BinaryCodec::new(config.max_payload_len)),
        };

        Self {
            protocol,
            state: SessionState::Disconnected,
            sink,
            commitment: Arc::new(ZeroCommitment),
            codec,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            events: VecDeque::new(),
            generation: 0,
            published: false,
            session_id: None,
            pending: None,
            text: TextState {
                extranonce2_size: config.extranonce2_size.unwrap_or(4),
                ..Default::default()
            },
            stats: SessionStats::default(),
            config,
        }
    }

    /// Replace the commitment-root source used for text-protocol jobs
    pub fn with_commitment_source(mut self, source: Arc<dyn CommitmentSource>) -> Self {
        self.commitment = source;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Generation of the latest job this session produced
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &StratumConfig {
        &self.config
    }

    /// Start a connection attempt
    pub fn connect(&mut self) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(StratumError::InvalidState(self.state.to_string()));
        }
        self.generation = self.sink.current_generation();
        self.published = false;
        self.session_id = None;
        self.pending = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.text = TextState {
            extranonce2_size: self.config.extranonce2_size.unwrap_or(4),
            ..Default::default()
        };
        self.set_state(SessionState::Resolving);
        Ok(())
    }

    /// An address for the pool is known
    pub fn resolved(&mut self) {
        if self.state == SessionState::Resolving {
            self.set_state(SessionState::Connecting);
        }
    }

    /// The transport could not be established or broke.
    ///
    /// Before the transport exists the session falls straight back to
    /// `Disconnected`; afterwards it enters `Closing`. The error is handed
    /// back so the caller can report it.
    pub fn transport_failed(&mut self, err: StratumError) -> StratumError {
        match self.state {
            SessionState::Resolving | SessionState::Connecting => {
                warn!(error = %err, "Connection to pool failed");
                self.set_state(SessionState::Disconnected);
            }
            SessionState::AwaitingHandshake | SessionState::Mining => {
                error!(error = %err, "Transport failed");
                self.begin_close();
            }
            SessionState::Closing | SessionState::Disconnected => {}
        }
        err
    }

    /// The transport is up: queue the handshake
    pub fn transport_connected(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        self.set_state(SessionState::AwaitingHandshake);

        match self.protocol {
            ProtocolVersion::V1 => {
                let subscribe = self.text.next_id();
                let authorize = self.text.next_id();
                self.text.subscribe_id = Some(subscribe);
                self.text.authorize_id = Some(authorize);
                let user_agent = self.config.user_agent.clone();
                let username = self.config.pool.username.clone();
                let password = self.config.pool.password.clone();
                self.send_text(StratumRequest::subscribe(subscribe, &user_agent));
                self.send_text(StratumRequest::authorize(authorize, &username, &password));
            }
            ProtocolVersion::V2 => {
                let pool_public_key = match self.config.pool_public_key_bytes() {
                    Ok(key) => key,
                    Err(reason) => {
                        self.diagnostic(reason);
                        [0u8; 32]
                    }
                };
                let setup = SetupConnection {
                    pool_public_key,
                    user_agent: self.config.user_agent.clone(),
                    user_identity: self.config.pool.username.clone(),
                    max_extranonce_size: self.config.max_extranonce_size,
                };
                self.send_binary(Message::SetupConnection(setup));
            }
        }
    }

    /// The handshake deadline passed
    pub fn handshake_timed_out(&mut self) -> StratumError {
        if self.state == SessionState::AwaitingHandshake {
            error!("Pool did not complete the handshake in time");
            self.begin_close();
        }
        StratumError::HandshakeTimeout
    }

    /// Feed bytes read from the transport.
    ///
    /// Transient decode errors are reported as diagnostics and reading
    /// continues; a fatal one closes the session and is returned.
    pub fn receive(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_reading() {
            return Ok(());
        }
        self.read_buf.extend_from_slice(data);

        while self.is_reading() {
            let decoded = match &mut self.codec {
                FrameCodec::Text(codec) => codec.decode(&mut self.read_buf).map(|f| f.map(Frame::Text)),
                FrameCodec::Binary(codec) => codec.decode(&mut self.read_buf).map(|f| f.map(Frame::Binary)),
            };

            let outcome = match decoded {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal protocol error");
                    self.begin_close();
                    return Err(e);
                }
                Err(e) => self.diagnostic(e.to_string()),
            }
        }
        Ok(())
    }

    /// Queue a share for the pool
    pub fn submit_share(&mut self, candidate: ShareCandidate) -> SubmitOutcome {
        if self.state != SessionState::Mining {
            debug!(job_id = %candidate.job_id, state = %self.state, "Dropping share, not mining");
            return SubmitOutcome::NotMining;
        }

        if candidate.generation < self.generation {
            warn!(
                job_id = %candidate.job_id,
                generation = candidate.generation,
                current = self.generation,
                "Dropping stale share"
            );
            self.stats.shares_stale += 1;
            self.events.push_back(SessionEvent::ShareStale {
                job_id: candidate.job_id,
                generation: candidate.generation,
            });
            return SubmitOutcome::Stale;
        }

        let session_id = match self.session_id {
            Some(SessionId::Numeric(id)) => Some(id),
            _ => None,
        };
        let sent = match (self.protocol, &candidate.job_id) {
            (ProtocolVersion::V1, JobId::Text(job_id)) => {
                match (&candidate.extranonce2, candidate.ntime) {
                    (Some(extranonce2), Some(ntime)) => {
                        let id = self.text.next_id();
                        let request = StratumRequest::submit(
                            id,
                            &self.config.pool.username,
                            job_id,
                            extranonce2,
                            ntime,
                            candidate.nonce,
                        );
                        self.text.submits.insert(id, candidate.job_id.clone());
                        self.send_text(request)
                    }
                    _ => false,
                }
            }
            (ProtocolVersion::V2, JobId::Numeric(job_id)) => match session_id {
                Some(session_id) => self.send_binary(Message::SubmitShares(SubmitShares {
                    session_id,
                    job_id: *job_id,
                    nonce: candidate.nonce,
                })),
                None => false,
            },
            _ => false,
        };

        if !sent {
            self.diagnostic(format!("Share for job {} cannot be encoded", candidate.job_id));
            return SubmitOutcome::Invalid;
        }

        info!(job_id = %candidate.job_id, nonce = %format!("{:08x}", candidate.nonce), "Share submitted");
        self.stats.shares_submitted += 1;
        self.events.push_back(SessionEvent::ShareSubmitted {
            job_id: candidate.job_id,
            nonce: candidate.nonce,
        });
        SubmitOutcome::Sent
    }

    /// Close on request
    pub fn stop(&mut self) {
        if self.state != SessionState::Disconnected && self.state != SessionState::Closing {
            info!("Stopping session");
            self.begin_close();
        }
    }

    /// The driver released the transport
    pub fn closed(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if self.state != SessionState::Closing {
            self.begin_close();
        }
        self.read_buf.clear();
        self.session_id = None;
        self.set_state(SessionState::Disconnected);
        self.events.push_back(SessionEvent::Closed);
    }

    /// Next chunk of bytes to write, if any
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        if self.write_buf.is_empty() {
            None
        } else {
            Some(self.write_buf.split().freeze())
        }
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn is_reading(&self) -> bool {
        matches!(self.state, SessionState::AwaitingHandshake | SessionState::Mining)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state");
            self.state = state;
            self.events.push_back(SessionEvent::StateChanged(state));
        }
    }

    /// Enter `Closing` and take our job off the board
    fn begin_close(&mut self) {
        self.set_state(SessionState::Closing);
        self.pending = None;
        self.text.submits.clear();
        if self.published {
            self.generation += 1;
            self.sink.retract(self.generation);
            self.published = false;
        }
    }

    fn diagnostic(&mut self, message: String) {
        warn!(%message, "Session diagnostic");
        self.stats.diagnostics += 1;
        self.events.push_back(SessionEvent::Diagnostic(message));
    }

    fn send_text(&mut self, request: StratumRequest) -> bool {
        let result = match &mut self.codec {
            FrameCodec::Text(codec) => codec.encode(request, &mut self.write_buf),
            FrameCodec::Binary(_) => Err(StratumError::Protocol("text request on a binary session".into())),
        };
        self.sent(result)
    }

    fn send_binary(&mut self, message: Message) -> bool {
        let result = match &mut self.codec {
            FrameCodec::Binary(codec) => codec.encode(message, &mut self.write_buf),
            FrameCodec::Text(_) => Err(StratumError::Protocol("binary frame on a text session".into())),
        };
        self.sent(result)
    }

    fn sent(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.diagnostic(format!("Failed to encode frame: {}", e));
                false
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Binary(message) => self.handle_binary(message),
            Frame::Text(message) => self.handle_text(message),
        }
    }

    fn handle_binary(&mut self, message: Message) -> Result<()> {
        match message {
            Message::SetupConnectionSuccess { session_id } => {
                if self.state != SessionState::AwaitingHandshake {
                    return Err(StratumError::Protocol(format!(
                        "SetupConnectionSuccess while {}",
                        self.state
                    )));
                }
                self.enter_mining(SessionId::Numeric(session_id));
                Ok(())
            }
            Message::SetupConnectionError { error_code } => {
                Err(StratumError::HandshakeRejected(error_code))
            }
            Message::NewMiningJob(job) => {
                self.stats.jobs_received += 1;
                if self.state == SessionState::Mining {
                    self.publish_binary(job);
                } else {
                    debug!(job_id = job.job_id, "Holding job until the handshake completes");
                    self.pending = Some(PendingJob::Binary(job));
                }
                Ok(())
            }
            Message::Unknown { msg_type, payload } => {
                debug!(msg_type, len = payload.len(), "Ignoring unknown message type");
                Ok(())
            }
            other => Err(StratumError::Protocol(format!(
                "unexpected message type 0x{:02x} from pool",
                other.msg_type()
            ))),
        }
    }

    fn handle_text(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Response(response) => self.handle_response(response),
            ServerMessage::Notify(notify) => {
                self.stats.jobs_received += 1;
                if self.state == SessionState::Mining {
                    self.publish_text(notify);
                } else {
                    debug!(job_id = %notify.job_id, "Holding job until the handshake completes");
                    self.pending = Some(PendingJob::Text(notify));
                }
                Ok(())
            }
            ServerMessage::SetDifficulty(difficulty) => {
                info!(difficulty, "Pool difficulty changed");
                self.text.share_target = Some(Target::from_difficulty(difficulty));
                self.events.push_back(SessionEvent::DifficultyChanged(difficulty));
                Ok(())
            }
            ServerMessage::SetExtranonce { extranonce1, extranonce2_size } => {
                debug!(extranonce1 = %hex::encode(&extranonce1), "Extranonce changed");
                self.text.extranonce1 = extranonce1;
                if let Some(size) = extranonce2_size {
                    self.text.extranonce2_size = self.config.extranonce2_size.unwrap_or(size);
                }
                Ok(())
            }
            ServerMessage::Reconnect { host, port, wait } => {
                info!(?host, ?port, ?wait, "Pool requested reconnect");
                self.events.push_back(SessionEvent::ReconnectRequested { host, port });
                self.begin_close();
                Ok(())
            }
            ServerMessage::ShowMessage(text) => {
                info!(message = %text, "Pool message");
                self.events.push_back(SessionEvent::PoolMessage(text));
                Ok(())
            }
            ServerMessage::Unknown(raw) => {
                debug!(%raw, "Ignoring unknown method");
                Ok(())
            }
        }
    }

    fn handle_response(&mut self, response: StratumResponse) -> Result<()> {
        let id = response.numeric_id();

        if id.is_some() && id == self.text.subscribe_id {
            self.text.subscribe_id = None;
            if let Some(error) = response.error {
                return Err(StratumError::HandshakeRejected(error.message()));
            }
            let result = response.result.unwrap_or_default();
            let subscribe = SubscribeResult::from_result(&result).map_err(StratumError::HandshakeRejected)?;
            self.text.subscribed = true;
            self.text.subscription_id = subscribe.subscription_id;
            self.text.extranonce1 = subscribe.extranonce1;
            self.text.extranonce2_size = self.config.extranonce2_size.unwrap_or(subscribe.extranonce2_size);
            self.maybe_finish_text_handshake();
            return Ok(());
        }

        if id.is_some() && id == self.text.authorize_id {
            self.text.authorize_id = None;
            if !response.is_true() {
                let reason = response
                    .error
                    .map(|e| e.message())
                    .unwrap_or_else(|| "worker not authorized".to_string());
                return Err(StratumError::HandshakeRejected(reason));
            }
            self.text.authorized = true;
            self.maybe_finish_text_handshake();
            return Ok(());
        }

        let job_id = match id.and_then(|id| self.text.submits.remove(&id)) {
            Some(job_id) => job_id,
            None => {
                return Err(StratumError::Protocol(format!(
                    "response to unknown request {:?}",
                    response.id
                )))
            }
        };

        if response.is_true() {
            info!(%job_id, "Share accepted");
            self.stats.shares_accepted += 1;
            self.events.push_back(SessionEvent::ShareAccepted { job_id });
        } else {
            let reason = response
                .error
                .map(|e| e.message())
                .unwrap_or_else(|| "rejected".to_string());
            warn!(%job_id, %reason, "Share rejected");
            self.stats.shares_rejected += 1;
            self.events.push_back(SessionEvent::ShareRejected { job_id, reason });
        }
        Ok(())
    }

    fn maybe_finish_text_handshake(&mut self) {
        if self.state != SessionState::AwaitingHandshake || !self.text.subscribed || !self.text.authorized {
            return;
        }
        let id = self
            .text
            .subscription_id
            .clone()
            .unwrap_or_else(|| hex::encode(&self.text.extranonce1));
        self.enter_mining(SessionId::Text(id));
    }

    fn enter_mining(&mut self, session_id: SessionId) {
        info!(%session_id, "Handshake complete");
        self.session_id = Some(session_id.clone());
        self.set_state(SessionState::Mining);
        self.events.push_back(SessionEvent::HandshakeComplete(session_id));

        match self.pending.take() {
            Some(PendingJob::Text(notify)) => self.publish_text(notify),
            Some(PendingJob::Binary(job)) => self.publish_binary(job),
            None => {}
        }
    }

    fn publish_binary(&mut self, job: NewMiningJob) {
        let header = HeaderTemplate {
            version: job.version,
            prev_hash: job.prev_hash,
            merkle_root: job.merkle_root,
            timestamp: job.ntime,
            bits: job.bits,
            nonce: 0,
        };
        self.publish(Job {
            id: JobId::Numeric(job.job_id),
            target: Target::from_compact(job.bits),
            header,
            generation: 0,
            future: job.future_job,
            extranonce2: None,
        });
    }

    fn publish_text(&mut self, notify: MiningNotify) {
        let extranonce2 = self.next_extranonce2();
        let merkle_root = self
            .commitment
            .commitment_root(&notify, &self.text.extranonce1, &extranonce2);
        let header = HeaderTemplate {
            version: notify.version,
            prev_hash: notify.header_prev_hash(),
            merkle_root,
            timestamp: notify.ntime,
            bits: notify.nbits,
            nonce: 0,
        };
        let target = self
            .text
            .share_target
            .unwrap_or_else(|| Target::from_compact(notify.nbits));
        self.publish(Job {
            id: JobId::Text(notify.job_id),
            header,
            target,
            generation: 0,
            future: false,
            extranonce2: Some(extranonce2),
        });
    }

    fn next_extranonce2(&mut self) -> Vec<u8> {
        let counter = self.text.extranonce2_counter;
        self.text.extranonce2_counter = counter.wrapping_add(1);

        let mut bytes = vec![0u8; self.text.extranonce2_size];
        let le = counter.to_le_bytes();
        let n = bytes.len().min(le.len());
        bytes[..n].copy_from_slice(&le[..n]);
        bytes
    }

    fn publish(&mut self, mut job: Job) {
        self.generation += 1;
        job.generation = self.generation;
        info!(
            job_id = %job.id,
            generation = job.generation,
            target = %job.target,
            "New job"
        );
        self.events.push_back(SessionEvent::JobPublished {
            job_id: job.id.clone(),
            generation: job.generation,
        });
        self.sink.publish(job);
        self.published = true;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .field("stats", &self.stats)
            .finish()
    }
}
