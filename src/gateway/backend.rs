//! Backend connection management.
//!
//! # Responsibilities
//! - Connect to the backend Unix socket with exponential backoff
//! - Classify connect failures (refused = retryable, everything else fatal)
//! - Learn backend capabilities via the get-values exchange
//! - Own the socket: no other component writes or closes it
//!
//! # Design Decisions
//! - Backoff doubles from base_delay_ms with no jitter; the delays are part
//!   of the gateway's observable contract
//! - The manager never reconnects on its own after a session loss; the
//!   engine asks for a new session once in-flight bookkeeping is settled
//! - The get-values collection is bounded by a timer because the protocol
//!   has no explicit end-of-values signal

use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

use crate::config::BackendConfig;
use crate::fcgi::codec::{self, num_or_str, CodecError, ValueKind};
use crate::fcgi::record::{
    RecordType, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, MANAGEMENT_REQUEST_ID,
};
use crate::fcgi::{RecordBody, RecordFramer};

/// Error type for establishing a backend session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every attempt was refused; the backend never came up.
    #[error("failed to connect to backend socket after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// The socket path does not exist. Not retryable.
    #[error("no such socket: {path}")]
    SocketMissing { path: String },
    /// Any other OS error. Not retryable.
    #[error("backend connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend closed the connection during the get-values exchange")]
    ClosedDuringHandshake,
    #[error("malformed get-values response: {0}")]
    Codec(#[from] CodecError),
}

/// Capability flags learned from the backend, re-learned per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendValues {
    pub max_conns: Option<i64>,
    pub max_reqs: Option<i64>,
    /// Defaults to 0 (no multiplexing) when the backend stays silent.
    pub mpxs_conns: i64,
}

impl BackendValues {
    /// Whether the backend can interleave concurrent requests on one
    /// connection.
    pub fn multiplexing(&self) -> bool {
        self.mpxs_conns > 0
    }

    fn apply(&mut self, name: &[u8], value: &[u8]) {
        let parsed = num_or_str(value);
        match name {
            n if n == FCGI_MAX_CONNS.as_bytes() => {
                if let ValueKind::Num(n) = parsed {
                    self.max_conns = Some(n);
                }
            }
            n if n == FCGI_MAX_REQS.as_bytes() => {
                if let ValueKind::Num(n) = parsed {
                    self.max_reqs = Some(n);
                }
            }
            n if n == FCGI_MPXS_CONNS.as_bytes() => {
                if let ValueKind::Num(n) = parsed {
                    self.mpxs_conns = n;
                }
            }
            other => {
                tracing::debug!(
                    name = %String::from_utf8_lossy(other),
                    value = ?parsed,
                    "Extra get-values variable"
                );
            }
        }
    }
}

/// One established backend connection, ready for application records.
#[derive(Debug)]
pub struct BackendSession {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    /// Carried over from the exchange so no buffered bytes are lost.
    pub framer: RecordFramer,
    pub values: BackendValues,
}

/// Connects to the backend socket and performs the capability handshake.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    config: BackendConfig,
}

impl BackendConnector {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Establish a session: connect with backoff, then get-values.
    ///
    /// Connection-refused is retried up to `max_retries` times with delays
    /// of base, 2·base, 4·base, …; any other error is immediately fatal.
    pub async fn connect(&self) -> Result<BackendSession, ConnectError> {
        let mut attempt: u32 = 0;
        let stream = loop {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => break stream,
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    if attempt >= self.config.connect.max_retries {
                        return Err(ConnectError::Exhausted {
                            attempts: attempt + 1,
                        });
                    }
                    let delay =
                        Duration::from_millis(self.config.connect.base_delay_ms << attempt);
                    tracing::info!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Backend refused connection, waiting to retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    tracing::error!(path = %self.config.socket_path, "No such socket");
                    return Err(ConnectError::SocketMissing {
                        path: self.config.socket_path.clone(),
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "Unknown error on backend connection");
                    return Err(ConnectError::Io(err));
                }
            }
        };

        self.exchange_values(stream).await
    }

    /// Query FCGI_MAX_CONNS / FCGI_MAX_REQS / FCGI_MPXS_CONNS and collect
    /// results until an empty result record or the collection timer fires.
    async fn exchange_values(&self, stream: UnixStream) -> Result<BackendSession, ConnectError> {
        let (reader, writer) = stream.into_split();
        let mut session = BackendSession {
            reader,
            writer,
            framer: RecordFramer::new(),
            values: BackendValues::default(),
        };

        let names = [FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS];
        let query = codec::encode_params(names.iter().map(|n| (n.as_bytes(), &b""[..])))?;
        let record = codec::encode_record(RecordType::GetValues, MANAGEMENT_REQUEST_ID, &query)?;
        session.writer.write_all(&record).await?;
        // Zero-length record: end of the query batch.
        let end = codec::encode_record(RecordType::GetValues, MANAGEMENT_REQUEST_ID, &[])?;
        session.writer.write_all(&end).await?;

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.values_timeout_ms);
        let mut buf = BytesMut::with_capacity(4096);

        'collect: loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, session.reader.read_buf(&mut buf)).await {
                Err(_elapsed) => break,
                Ok(Ok(0)) => return Err(ConnectError::ClosedDuringHandshake),
                Ok(Ok(_)) => {
                    session.framer.write(buf.split().freeze());
                    while let Some((header, body)) = session.framer.next_record() {
                        let record = codec::decode_record(&header, body)?;
                        match record.body {
                            RecordBody::GetValuesResult(pairs) => {
                                if pairs.is_empty() {
                                    break 'collect;
                                }
                                for (name, value) in &pairs {
                                    session.values.apply(name, value);
                                }
                            }
                            other => {
                                tracing::warn!(
                                    record = ?other,
                                    "Unexpected record during get-values exchange"
                                );
                            }
                        }
                    }
                }
                Ok(Err(err)) => return Err(ConnectError::Io(err)),
            }
        }

        tracing::info!(
            max_conns = ?session.values.max_conns,
            max_reqs = ?session.values.max_reqs,
            mpxs_conns = session.values.mpxs_conns,
            "Backend capabilities learned"
        );
        Ok(session)
    }
}
