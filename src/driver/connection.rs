//! Async transport around a [`Session`].
//!
//! Generic over the stream so tests can drive it through an in-memory
//! duplex; production code uses a `TcpStream`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::context::ConnectionContext;
use super::session::Session;
use super::{CommandSource, Event, EventSink};
use crate::config::ConnectConfig;
use crate::error::{PgError, PgResult};

/// Minimum free space before each socket read.
const READ_CHUNK: usize = 8192;

/// A single client connection.
pub struct PgConnection<S = TcpStream> {
    stream: S,
    session: Session,
    config: ConnectConfig,
}

impl PgConnection<TcpStream> {
    /// Open the TCP transport and queue the startup message.
    ///
    /// The handshake runs on the first [`PgConnection::handshake`] or
    /// [`PgConnection::run`].
    pub async fn connect(config: &ConnectConfig) -> PgResult<Self> {
        let addr = config.address();
        let stream = timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| PgError::Timeout(config.connect_timeout_ms))??;
        stream.set_nodelay(true)?;
        info!(%addr, user = %config.user, database = %config.database, "connected");
        Ok(Self::from_stream(stream, config.clone(), Session::new(config)))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PgConnection<S> {
    pub fn from_stream(stream: S, config: ConnectConfig, session: Session) -> Self {
        Self {
            stream,
            session,
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn context(&self) -> &ConnectionContext {
        self.session.context()
    }

    /// Authenticate and wait for the first ReadyForQuery.
    ///
    /// Returns at once when already logged in.
    pub async fn handshake(&mut self, sink: &mut impl EventSink) -> PgResult<()> {
        if self.session.is_authenticated() {
            return Ok(());
        }
        self.pump(sink).await
    }

    /// Run one simple query, forwarding events until the server is ready again.
    pub async fn execute(&mut self, sql: &str, sink: &mut impl EventSink) -> PgResult<()> {
        self.session.submit_query(sql)?;
        self.pump(sink).await
    }

    /// Interactive loop: pull commands from `source` until it runs dry,
    /// then close gracefully.
    ///
    /// An empty command runs the configured default query.
    pub async fn run(
        &mut self,
        source: &mut impl CommandSource,
        sink: &mut impl EventSink,
    ) -> PgResult<()> {
        self.handshake(sink).await?;
        while let Some(command) = source.next_command() {
            let sql = if command.trim().is_empty() {
                self.config.default_query.clone()
            } else {
                command
            };
            match self.execute(&sql, sink).await {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "command rejected");
                    sink.on_error(&e);
                }
                Err(e) => return Err(e),
            }
        }
        self.close().await
    }

    /// Send Terminate (when logged in) and shut the write side down.
    pub async fn close(&mut self) -> PgResult<()> {
        self.session.close();
        self.flush().await?;
        self.stream.shutdown().await?;
        debug!("connection closed");
        Ok(())
    }

    /// Write queued bytes, then read until a ReadyForQuery event.
    async fn pump(&mut self, sink: &mut impl EventSink) -> PgResult<()> {
        loop {
            self.flush().await?;
            let read = self.read_once().await;

            // Deliver what was decoded even if the read ended in an error.
            let mut ready = false;
            while let Some(event) = self.session.poll_event() {
                ready |= matches!(event, Event::ReadyForQuery(_));
                sink.on_event(&event);
            }
            read?;
            if ready {
                return Ok(());
            }
        }
    }

    async fn flush(&mut self) -> PgResult<()> {
        let Some(bytes) = self.session.take_outgoing() else {
            return Ok(());
        };
        debug!(len = bytes.len(), "writing");
        let written = match self.stream.write_all(&bytes).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "write failed");
            self.session.abort();
            return Err(e.into());
        }
        Ok(())
    }

    /// One socket read straight into the reassembly buffer.
    ///
    /// Any transport failure releases the session.
    async fn read_once(&mut self) -> PgResult<()> {
        let buf = self.session.recv_buffer();
        if buf.capacity() - buf.len() < READ_CHUNK {
            buf.reserve(READ_CHUNK);
        }

        let read = self.stream.read_buf(buf);
        let result = match self.config.read_timeout() {
            Some(limit) => match timeout(limit, read).await {
                Ok(read) => read.map_err(PgError::from),
                Err(_) => Err(PgError::Timeout(
                    self.config.read_timeout_ms.unwrap_or_default(),
                )),
            },
            None => read.await.map_err(PgError::from),
        };

        match result {
            Ok(0) => {
                warn!("server closed the connection");
                self.session.abort();
                Err(PgError::ConnectionClosed)
            }
            Ok(n) => {
                debug!(len = n, "read");
                self.session.process()
            }
            Err(e) => {
                warn!(error = %e, "read failed");
                self.session.abort();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, TransactionStatus};
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        Frame::new(tag, payload.to_vec()).to_bytes()
    }

    async fn read_startup(server: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let len = server.read_i32().await.unwrap() as usize;
        let mut rest = vec![0u8; len - 4];
        server.read_exact(&mut rest).await.unwrap();
        rest
    }

    async fn read_frame(server: &mut tokio::io::DuplexStream) -> (u8, Vec<u8>) {
        let tag = server.read_u8().await.unwrap();
        let len = server.read_i32().await.unwrap() as usize;
        let mut payload = vec![0u8; len - 4];
        server.read_exact(&mut payload).await.unwrap();
        (tag, payload)
    }

    #[tokio::test]
    async fn test_empty_command_runs_default_query() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ConnectConfig {
            default_query: "SELECT 42".to_string(),
            ..ConnectConfig::default()
        };
        let session = Session::new(&config);
        let mut conn = PgConnection::from_stream(client, config, session);

        let backend = tokio::spawn(async move {
            read_startup(&mut server).await;
            let mut login = frame(b'R', &[0, 0, 0, 0]);
            login.extend(frame(b'Z', b"I"));
            server.write_all(&login).await.unwrap();

            let (tag, payload) = read_frame(&mut server).await;
            assert_eq!(tag, b'Q');
            assert_eq!(payload, b"SELECT 42\0");
            let mut reply = frame(b'C', b"SELECT 0\0");
            reply.extend(frame(b'Z', b"I"));
            server.write_all(&reply).await.unwrap();

            assert_eq!(read_frame(&mut server).await, (b'X', vec![]));
        });

        let mut commands = VecDeque::from(vec!["   ".to_string()]);
        let mut events = Vec::new();
        conn.run(&mut commands, &mut events).await.unwrap();
        backend.await.unwrap();

        assert_eq!(events.first(), Some(&Event::Connected));
        assert_eq!(
            events.last(),
            Some(&Event::ReadyForQuery(TransactionStatus::Idle))
        );
    }

    #[tokio::test]
    async fn test_server_hangup_is_reported() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ConnectConfig::default();
        let session = Session::new(&config);
        let mut conn = PgConnection::from_stream(client, config, session);

        let backend = tokio::spawn(async move {
            read_startup(&mut server).await;
            drop(server);
        });

        let mut events = Vec::new();
        let err = conn.handshake(&mut events).await.unwrap_err();
        backend.await.unwrap();
        assert!(matches!(err, PgError::ConnectionClosed));
        assert!(conn.session().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let (client, _server) = tokio::io::duplex(4096);
        let config = ConnectConfig {
            read_timeout_ms: Some(50),
            ..ConnectConfig::default()
        };
        let session = Session::new(&config);
        let mut conn = PgConnection::from_stream(client, config, session);

        let mut events = Vec::new();
        let err = conn.handshake(&mut events).await.unwrap_err();
        assert!(matches!(err, PgError::Timeout(50)));
        assert!(conn.session().is_closed());
        assert_eq!(conn.session().auth_phase(), None);
        assert_eq!(conn.session().buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_broken_pipe_releases_session() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let config = ConnectConfig::default();
        let session = Session::new(&config);
        let mut conn = PgConnection::from_stream(client, config, session);

        let mut events = Vec::new();
        let err = conn.handshake(&mut events).await.unwrap_err();
        assert!(matches!(err, PgError::Io(_)), "got {:?}", err);
        assert!(conn.session().is_closed());
        assert_eq!(conn.session().auth_phase(), None);
    }

    #[tokio::test]
    async fn test_handshake_when_logged_in_returns() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ConnectConfig::default();
        let session = Session::new(&config);
        let mut conn = PgConnection::from_stream(client, config, session);

        let backend = tokio::spawn(async move {
            read_startup(&mut server).await;
            let mut login = frame(b'R', &[0, 0, 0, 0]);
            login.extend(frame(b'Z', b"I"));
            server.write_all(&login).await.unwrap();
            server
        });

        let mut events = Vec::new();
        conn.handshake(&mut events).await.unwrap();
        let _server = backend.await.unwrap();

        // Nothing more arrives; a second call must not wait for it.
        let again = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            conn.handshake(&mut events),
        )
        .await;
        assert!(matches!(again, Ok(Ok(()))));
        assert_eq!(events.len(), 2);
    }
}
