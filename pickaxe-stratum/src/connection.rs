//! Transport driver: moves bytes between a socket and a [`Session`]

use crate::{
    error::{Result, StratumError},
    job::ShareCandidate,
    session::{Session, SessionEvent, SessionState},
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpStream},
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens the byte stream a session runs over
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Resolve `host:port` to candidate addresses
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;

    /// Connect to the first reachable address
    async fn connect(&self, addrs: &[SocketAddr]) -> Result<Self::Stream>;
}

/// Plain TCP with `TCP_NODELAY`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let resolve_error = |reason: String| StratumError::Resolve {
            host: host.to_string(),
            reason,
        };

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| resolve_error(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(resolve_error("no addresses".to_string()));
        }
        Ok(addrs)
    }

    async fn connect(&self, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_error = StratumError::Connection("no addresses to connect to".to_string());

        for addr in addrs {
            debug!(%addr, "Connecting");
            match timeout(self.connect_timeout, TcpStream::connect(*addr)).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| StratumError::Connection(e.to_string()))?;
                    info!(%addr, "Connected to pool");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = StratumError::Connection(format!("{}: {}", addr, e)),
                Err(_) => last_error = StratumError::Connection(format!("{}: connect timed out", addr)),
            }
        }
        Err(last_error)
    }
}

/// Run one session lifetime to completion.
///
/// Resolves and connects through `connector`, then shuttles bytes until
/// the session closes. Shares arriving on `shares` are submitted while
/// mining. Every event the session emits is passed to `on_event`.
///
/// Returns `Ok(())` when the session was stopped (cancellation or a pool
/// reconnect request) and the failure otherwise. The session is always
/// `Disconnected` on return.
pub async fn drive<C, F>(
    session: &mut Session,
    connector: &C,
    shares: &mut mpsc::Receiver<ShareCandidate>,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<()>
where
    C: Connector,
    F: FnMut(&SessionEvent),
{
    let (host, port) = session
        .config()
        .pool
        .parse_url()
        .map_err(StratumError::InvalidConfiguration)?;

    session.connect()?;
    drain_events(session, &mut on_event);

    let addrs = tokio::select! {
        _ = cancel.cancelled() => {
            abandon(session, &mut on_event);
            return Ok(());
        }
        resolved = connector.resolve(&host, port) => resolved,
    };
    let addrs = match addrs {
        Ok(addrs) => addrs,
        Err(e) => return Err(fail_early(session, e, &mut on_event)),
    };
    session.resolved();
    drain_events(session, &mut on_event);

    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            abandon(session, &mut on_event);
            return Ok(());
        }
        connected = connector.connect(&addrs) => connected,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => return Err(fail_early(session, e, &mut on_event)),
    };

    session.transport_connected();
    let deadline = Instant::now() + session.config().handshake_timeout;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(8192);
    let mut failure: Option<StratumError> = None;

    loop {
        // Once closing, queued frames go out in the flush below and the first
        // failure stays the reported one
        if session.state() != SessionState::Closing {
            if let Err(e) = write_pending(session, &mut writer).await {
                failure = Some(session.transport_failed(e.into()));
            }
        }
        drain_events(session, &mut on_event);
        if session.state() == SessionState::Closing {
            break;
        }

        let awaiting_handshake = session.state() == SessionState::AwaitingHandshake;
        tokio::select! {
            _ = cancel.cancelled() => session.stop(),
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => failure = Some(session.transport_failed(StratumError::Eof)),
                Ok(_) => {
                    if let Err(e) = session.receive(&buf) {
                        failure = Some(e);
                    }
                    buf.clear();
                }
                Err(e) => failure = Some(session.transport_failed(e.into())),
            },
            Some(share) = shares.recv() => {
                session.submit_share(share);
            }
            _ = sleep_until(deadline), if awaiting_handshake => {
                failure = Some(session.handshake_timed_out());
            }
        }
    }

    // Best effort: whatever is still queued, then a clean shutdown
    let flush_timeout = session.config().flush_timeout;
    let flushed = timeout(flush_timeout, async {
        write_pending(session, &mut writer).await?;
        writer.shutdown().await
    })
    .await;
    match flushed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Flush on close failed"),
        Err(_) => warn!(timeout = ?flush_timeout, "Flush on close timed out"),
    }

    session.closed();
    drain_events(session, &mut on_event);

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn write_pending<W>(session: &mut Session, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = session.poll_transmit() {
        writer.write_all(&frame).await?;
    }
    writer.flush().await
}

fn drain_events<F: FnMut(&SessionEvent)>(session: &mut Session, on_event: &mut F) {
    while let Some(event) = session.poll_event() {
        on_event(&event);
    }
}

/// Cancelled before a transport existed
fn abandon<F: FnMut(&SessionEvent)>(session: &mut Session, on_event: &mut F) {
    session.stop();
    session.closed();
    drain_events(session, on_event);
}

fn fail_early<F: FnMut(&SessionEvent)>(
    session: &mut Session,
    err: StratumError,
    on_event: &mut F,
) -> StratumError {
    let err = session.transport_failed(err);
    drain_events(session, on_event);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::ReadBuf;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let connector = TcpConnector::new(Duration::from_secs(1));
        let addrs = connector.resolve("127.0.0.1", 3333).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:3333".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(1));
        let err = connector.connect(&[addr]).await.unwrap_err();
        assert!(matches!(err, StratumError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_sets_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(Duration::from_secs(1));
        let stream = connector.connect(&[addr]).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    /// Hands out one pre-built stream
    struct OnceConnector<S>(std::sync::Mutex<Option<S>>);

    #[async_trait]
    impl<S> Connector for OnceConnector<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        type Stream = S;

        async fn resolve(&self, _host: &str, port: u16) -> Result<Vec<SocketAddr>> {
            Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
        }

        async fn connect(&self, _addrs: &[SocketAddr]) -> Result<Self::Stream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| StratumError::Connection("stream already used".to_string()))
        }
    }

    struct NullSink;

    impl crate::job::JobSink for NullSink {
        fn publish(&self, _job: crate::job::Job) {}
        fn retract(&self, _generation: u64) {}
        fn current_generation(&self) -> u64 {
            0
        }
    }

    fn v2_config() -> crate::config::StratumConfig {
        crate::config::StratumConfig::new(crate::config::PoolConfig {
            url: "stratum2+tcp://pool.example.com:34254".to_string(),
            username: "wallet.worker".to_string(),
            password: "x".to_string(),
            protocol: None,
        })
    }

    #[tokio::test]
    async fn test_rejected_setup_ends_drive() {
        use crate::binary::{BinaryCodec, Message, SetupConnection};
        use std::sync::Arc;
        use tokio_util::codec::Encoder;

        let config = v2_config();

        let mut codec = BinaryCodec::new(1024);
        let mut setup = BytesMut::new();
        codec
            .encode(
                Message::SetupConnection(SetupConnection {
                    pool_public_key: [0; 32],
                    user_agent: config.user_agent.clone(),
                    user_identity: "wallet.worker".to_string(),
                    max_extranonce_size: config.max_extranonce_size,
                }),
                &mut setup,
            )
            .unwrap();
        let mut rejection = BytesMut::new();
        codec
            .encode(
                Message::SetupConnectionError { error_code: "unknown-user".to_string() },
                &mut rejection,
            )
            .unwrap();

        let stream = tokio_test::io::Builder::new().write(&setup).read(&rejection).build();
        let connector = OnceConnector(std::sync::Mutex::new(Some(stream)));
        let mut session = Session::new(config, Arc::new(NullSink));
        let (_tx, mut shares) = mpsc::channel(1);

        let err = drive(&mut session, &connector, &mut shares, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::HandshakeRejected(ref code) if code == "unknown-user"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    /// Reads fail with a reset; writes and flushes fail after that
    #[derive(Default)]
    struct ResetStream {
        reset: bool,
    }

    impl AsyncRead for ResetStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.reset = true;
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            if self.reset {
                Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            } else {
                Poll::Ready(Ok(buf.len()))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            if self.reset {
                Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            } else {
                Poll::Ready(Ok(()))
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_is_not_masked_by_write_error() {
        let connector = OnceConnector(std::sync::Mutex::new(Some(ResetStream::default())));
        let mut session = Session::new(v2_config(), std::sync::Arc::new(NullSink));
        let (_tx, mut shares) = mpsc::channel(1);

        let err = drive(&mut session, &connector, &mut shares, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(
            matches!(err, StratumError::Io(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset),
            "unexpected {:?}",
            err
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
