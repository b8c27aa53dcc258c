//! Per-connection exchange state machine.
//!
//! A connection carries exactly one exchange:
//!
//! ```text
//! Accepted -> Reading -> Decoded -> Dispatched -> Collecting -> Responding -> Closed
//!                \           \           \            \             \
//!                 +-----------+-----------+------------+-------------+--> Error -> Closed
//! ```
//!
//! The hardware lease is taken once the request decodes and is released
//! only after the socket is closed, so at most one exchange is past
//! `Decoded` at any time.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::gateway::{Hardware, HardwareError, HardwareLease};
use crate::protocol::{
    build_header, decode, words_to_le_bytes, DecodeError, TrailingPolicy, WorkRequest,
    REQUEST_LEN, RESPONSE_LEN,
};

/// Read buffer size. Anything past the request is only kept to detect
/// trailing data.
const READ_BUFFER_SIZE: usize = 1024;

/// Current state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Accepted,
    Reading,
    Decoded,
    Dispatched,
    Collecting,
    Responding,
    Error,
    Closed,
}

impl ExchangeState {
    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;

        match (self, next) {
            (Closed, _) => false,
            (Error, Closed) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Accepted, Reading)
            | (Reading, Decoded)
            | (Decoded, Dispatched)
            | (Dispatched, Collecting)
            | (Collecting, Responding)
            | (Responding, Closed) => true,
            _ => false,
        }
    }
}

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
}

/// Anything that ends an exchange early.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-exchange settings taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeSettings {
    pub trailing_data: TrailingPolicy,
    pub read_timeout: Duration,
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub id: u32,
    pub records: usize,
}

/// One client exchange.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ExchangeState,
    settings: ExchangeSettings,
}

impl Connection {
    /// Wrap an accepted socket.
    pub fn new(stream: TcpStream, peer: SocketAddr, settings: ExchangeSettings) -> Self {
        Self {
            stream,
            peer,
            state: ExchangeState::Accepted,
            settings,
        }
    }

    fn transition(&mut self, next: ExchangeState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Exchange state");
        self.state = next;
    }

    /// Drive the exchange to `Closed`.
    ///
    /// On success every result has been written and the write half shut
    /// down cleanly. On failure nothing is written and the socket is reset.
    pub async fn run(mut self, hardware: &Hardware) -> Result<ExchangeSummary, ExchangeError> {
        let mut lease = None;
        let result = self.exchange(hardware, &mut lease).await;

        if let Err(ref e) = result {
            self.transition(ExchangeState::Error);
            warn!(peer = %self.peer, error = %e, "Exchange failed");
            self.abort();
        }
        self.transition(ExchangeState::Closed);

        // The socket is closed before the hardware goes to the next exchange.
        let Connection { stream, .. } = self;
        drop(stream);
        drop(lease);

        result
    }

    async fn exchange(
        &mut self,
        hardware: &Hardware,
        lease: &mut Option<HardwareLease>,
    ) -> Result<ExchangeSummary, ExchangeError> {
        self.transition(ExchangeState::Reading);
        let request = self.read_request().await?;
        self.transition(ExchangeState::Decoded);
        debug!(
            peer = %self.peer,
            id = request.id,
            target_bits = request.target_bits,
            seed = %hex::encode(words_to_le_bytes(&request.seed)),
            "Work request decoded"
        );

        let lease = lease.insert(hardware.acquire().await);

        let header = build_header(&request.seed, request.target_bits);
        let mut session = lease.dispatch(request.id, header, request.target_bits)?;
        self.transition(ExchangeState::Dispatched);

        self.transition(ExchangeState::Collecting);
        let mut output = BytesMut::new();
        let mut records = 0usize;
        while let Some(record) = session.next().await? {
            trace!(id = record.id, nonce = record.nonce, "Result collected");
            record.encode_into(&mut output);
            records += 1;
        }
        drop(session);

        self.transition(ExchangeState::Responding);
        debug_assert_eq!(output.len(), records * RESPONSE_LEN);
        self.stream
            .write_all(&output)
            .await
            .map_err(TransportError::WriteFailed)?;
        self.stream
            .shutdown()
            .await
            .map_err(TransportError::WriteFailed)?;

        Ok(ExchangeSummary {
            id: request.id,
            records,
        })
    }

    /// Read one request frame, bounded by the read timeout.
    async fn read_request(&mut self) -> Result<WorkRequest, ExchangeError> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let read = tokio::time::timeout(
            self.settings.read_timeout,
            read_frame(&mut self.stream, &mut buffer),
        )
        .await;
        match read {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::ReadFailed(e).into()),
            Err(_) => {
                return Err(TransportError::ReadFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request not received in time",
                ))
                .into())
            }
        }

        let request = decode(&buffer, self.settings.trailing_data)?;
        if buffer.len() > REQUEST_LEN {
            warn!(
                peer = %self.peer,
                extra = buffer.len() - REQUEST_LEN,
                "Ignoring trailing request bytes"
            );
        }
        Ok(request)
    }

    /// Close with RST so the client can tell a failed exchange from an
    /// empty result set.
    fn abort(&self) {
        if let Err(e) = socket2::SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            debug!(peer = %self.peer, error = %e, "Failed to set linger");
        }
    }
}

/// Fill `buffer` until a full request is present or the peer stops sending.
///
/// Bytes already queued behind the request are pulled in as well, so that
/// trailing data sent in the same burst is seen by the decoder. The request
/// has no length prefix, so bytes that arrive in a later segment are never
/// read and the request is dispatched as if it were exact.
async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> io::Result<()> {
    while buffer.len() < REQUEST_LEN {
        if stream.read_buf(buffer).await? == 0 {
            trace!(len = buffer.len(), "Peer finished sending");
            return Ok(());
        }
    }

    let mut extra = [0u8; 64];
    while buffer.len() < READ_BUFFER_SIZE {
        match stream.try_read(&mut extra) {
            Ok(0) => break,
            Ok(n) => buffer.extend_from_slice(&extra[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Serve one accepted connection and log how it ended.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hardware: Arc<Hardware>,
    settings: ExchangeSettings,
) {
    let connection = Connection::new(stream, peer, settings);
    match connection.run(&hardware).await {
        Ok(summary) => debug!(
            peer = %peer,
            id = summary.id,
            records = summary.records,
            "Exchange complete"
        ),
        Err(e) => trace!(peer = %peer, error = %e, "Connection closed after error"),
    }
}
