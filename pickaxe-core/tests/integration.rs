use async_trait::async_trait;
use bytes::BytesMut;
use pickaxe_core::{
    nonce_range, scan, JobBoard, MinerConfig, MiningEngine, NonceRange, PoolStats, ScanOutcome,
    ShareSink, WorkerConfig, WorkerPool, NONCE_SPACE,
};
use pickaxe_hash::{HeaderTemplate, Target};
use pickaxe_stratum::{
    binary::{BinaryCodec, Message, NewMiningJob, SubmitShares},
    Connector, Job, JobId, PoolConfig, Session, SessionId, SessionState, ShareCandidate,
    StratumConfig, StratumError, SubmitOutcome,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{Decoder, Encoder},
    sync::CancellationToken,
};

fn stratum_config(url: &str) -> StratumConfig {
    StratumConfig::new(PoolConfig {
        url: url.to_string(),
        username: "wallet.worker".to_string(),
        password: "x".to_string(),
        protocol: None,
    })
}

fn frame(message: Message) -> BytesMut {
    let mut buf = BytesMut::new();
    BinaryCodec::new(1024).encode(message, &mut buf).unwrap();
    buf
}

fn new_job(job_id: u32, bits: u32) -> Message {
    Message::NewMiningJob(NewMiningJob {
        job_id,
        future_job: false,
        version: 0x20000000,
        bits,
        prev_hash: Default::default(),
        coinbase_prefix: [0; 32],
        coinbase_suffix: [0; 32],
        merkle_root: Default::default(),
        ntime: 0x5f5e1000,
        merkle_branch: vec![],
    })
}

fn plain_job(generation: u64, target: Target) -> Job {
    Job {
        id: JobId::Numeric(generation as u32),
        header: HeaderTemplate {
            version: 0x20000000,
            timestamp: generation as u32,
            ..Default::default()
        },
        target,
        generation,
        future: false,
        extranonce2: None,
    }
}

#[test]
fn test_session_feeds_board_end_to_end() {
    let board = Arc::new(JobBoard::new());
    let mut session = Session::new(stratum_config("stratum2+tcp://pool:34254"), board.clone());

    session.connect().unwrap();
    session.resolved();
    session.transport_connected();
    session.poll_transmit();

    session.receive(&frame(Message::SetupConnectionSuccess { session_id: 7 })).unwrap();
    assert_eq!(session.state(), SessionState::Mining);
    assert_eq!(session.session_id(), Some(&SessionId::Numeric(7)));

    session.receive(&frame(new_job(42, 0x1d00ffff))).unwrap();
    assert_eq!(board.current_generation(), 1);
    let job = board.current().unwrap();
    assert_eq!(job.id, JobId::Numeric(42));
    assert_eq!(job.generation, 1);

    // 0x1d: three mantissa bytes 0x00ffff end at byte 0x1d - 1, so the top
    // non-zero byte sits one below it
    let msb = job.target.as_bytes().iter().rposition(|&b| b != 0).unwrap();
    assert_eq!(msb, 0x1d - 2);

    let share = ShareCandidate {
        job_id: JobId::Numeric(42),
        generation: 1,
        nonce: 123,
        extranonce2: None,
        ntime: None,
    };
    assert_eq!(session.submit_share(share.clone()), SubmitOutcome::Sent);
    let mut sent = BytesMut::from(&session.poll_transmit().unwrap()[..]);
    assert_eq!(
        BinaryCodec::new(1024).decode(&mut sent).unwrap(),
        Some(Message::SubmitShares(SubmitShares { session_id: 7, job_id: 42, nonce: 123 }))
    );

    session.receive(&frame(new_job(43, 0x1d00ffff))).unwrap();
    assert_eq!(board.current_generation(), 2);
    assert_eq!(session.submit_share(share), SubmitOutcome::Stale);
    assert!(session.poll_transmit().is_none());
}

#[test]
fn test_nonce_ranges_partition_space() {
    for workers in 1..=64 {
        let ranges: Vec<NonceRange> = (0..workers).map(|i| nonce_range(i, workers)).collect();
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[workers - 1].end, NONCE_SPACE);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap with {} workers", workers);
        }
        let total: u64 = ranges.iter().map(NonceRange::len).sum();
        assert_eq!(total, NONCE_SPACE);
    }
}

/// Publishes a newer job on the first share, then counts what follows
struct SupersedingSink {
    board: Arc<JobBoard>,
    offers_after_publish: AtomicU64,
    published: AtomicBool,
}

impl ShareSink for SupersedingSink {
    fn offer(&self, _share: ShareCandidate) -> bool {
        if self.published.swap(true, Ordering::SeqCst) {
            self.offers_after_publish.fetch_add(1, Ordering::SeqCst);
        } else {
            self.board.publish(plain_job(2, Target::MAX));
        }
        true
    }
}

#[test]
fn test_superseded_scan_stops_within_check_interval() {
    let board = Arc::new(JobBoard::new());
    let old = plain_job(1, Target::MAX);
    board.publish(old.clone());

    let sink = SupersedingSink {
        board: board.clone(),
        offers_after_publish: AtomicU64::new(0),
        published: AtomicBool::new(false),
    };
    let check_interval = 256;

    let outcome = scan(
        &old,
        NonceRange { start: 0, end: NONCE_SPACE },
        &board,
        &AtomicBool::new(false),
        &sink,
        &PoolStats::default(),
        check_interval,
    );

    assert_eq!(outcome, ScanOutcome::Superseded);
    assert!(sink.offers_after_publish.load(Ordering::SeqCst) < check_interval);
}

#[tokio::test]
async fn test_workers_move_to_new_job() {
    let board = Arc::new(JobBoard::new());
    let (tx, mut rx) = mpsc::channel(1024);
    let config = WorkerConfig {
        threads: 2,
        check_interval: 128,
        idle_poll: Duration::from_millis(10),
    };
    let mut pool = WorkerPool::new(&config, board.clone(), Arc::new(tx));
    pool.start().unwrap();

    // Unreachable target: workers grind without results
    board.publish(plain_job(1, Target::ZERO));
    tokio::time::sleep(Duration::from_millis(50)).await;
    board.publish(plain_job(2, Target::MAX));

    let share = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(share.generation, 2);

    pool.stop();
    assert!(pool.stats().hashes > 0);
    assert!(pool.stats().jobs_abandoned >= 1);
}

#[tokio::test]
async fn test_idle_workers_wake_on_first_job() {
    let board = Arc::new(JobBoard::new());
    let (tx, mut rx) = mpsc::channel(16);
    let config = WorkerConfig {
        threads: 1,
        check_interval: 64,
        idle_poll: Duration::from_secs(30),
    };
    let mut pool = WorkerPool::new(&config, board.clone(), Arc::new(tx));
    pool.start().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    board.publish(plain_job(1, Target::MAX));

    let share = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(share.generation, 1);
    pool.stop();
}

struct DuplexConnector(Mutex<Option<DuplexStream>>);

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn resolve(&self, _host: &str, _port: u16) -> pickaxe_stratum::Result<Vec<SocketAddr>> {
        Ok(vec!["127.0.0.1:34254".parse().unwrap()])
    }

    async fn connect(&self, _addrs: &[SocketAddr]) -> pickaxe_stratum::Result<DuplexStream> {
        self.0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| StratumError::Connection("already connected".to_string()))
    }
}

#[tokio::test]
async fn test_engine_mines_against_fake_pool() {
    let (client, mut pool) = tokio::io::duplex(64 * 1024);
    let connector = DuplexConnector(Mutex::new(Some(client)));

    let mut config = MinerConfig::new(stratum_config("stratum2+tcp://pool.example.com:34254"));
    config.workers = 2;
    config.check_interval = 256;
    let mut engine = MiningEngine::new(config).unwrap();
    engine.start().unwrap();

    let pool_task = tokio::spawn(async move {
        let mut codec = BinaryCodec::new(1024);
        let mut buf = BytesMut::new();

        let next = |codec: &mut BinaryCodec, buf: &mut BytesMut| codec.decode(buf).unwrap();
        let setup = loop {
            if let Some(message) = next(&mut codec, &mut buf) {
                break message;
            }
            pool.read_buf(&mut buf).await.unwrap();
        };
        assert!(matches!(setup, Message::SetupConnection(_)));

        let mut out = BytesMut::new();
        codec.encode(Message::SetupConnectionSuccess { session_id: 11 }, &mut out).unwrap();
        // Exponent 0x21 puts 0xffff in the top two bytes: nearly every hash is a share
        codec.encode(new_job(5, 0x2100ffff), &mut out).unwrap();
        pool.write_all(&out).await.unwrap();

        let submit = loop {
            if let Some(message) = next(&mut codec, &mut buf) {
                break message;
            }
            pool.read_buf(&mut buf).await.unwrap();
        };
        match submit {
            Message::SubmitShares(submit) => assert_eq!((submit.session_id, submit.job_id), (11, 5)),
            other => panic!("unexpected {:?}", other),
        }
    });

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        engine.run_session(&connector, &CancellationToken::new()),
    )
    .await
    .unwrap();
    pool_task.await.unwrap();

    // The pool hung up after the first share; depending on timing the
    // client sees EOF on read or a broken pipe on its next submit
    assert!(matches!(
        result,
        Err(pickaxe_core::EngineError::Stratum(StratumError::Eof | StratumError::Io(_)))
    ));

    let stats = engine.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.jobs_received, 1);
    assert!(stats.shares_submitted >= 1);
    assert!(stats.pool.shares_found >= 1);
    assert_eq!(stats.state, Some(SessionState::Disconnected));

    // The closed session retracted its job
    assert!(engine.board().current().is_none());
    engine.stop();
}
