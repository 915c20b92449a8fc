//! The framed transport contract consumed by the connection engine.
//!
//! A [`Socket`] yields whole message payloads with optional per-call
//! deadlines; framing, masking, or compression concerns live entirely behind
//! it. [`FramedSocket`] is the canonical implementation, wrapping any
//! byte-stream transport in length-delimited framing.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};

/// A message-framed full-duplex transport.
///
/// Reads and writes may be issued concurrently from different tasks;
/// implementations serialise each direction internally. `shutdown` must be
/// idempotent and must cause pending and future calls to fail.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Read one framed payload, failing after `timeout` if one is set.
    async fn read_text(&self, timeout: Option<Duration>) -> io::Result<Vec<u8>>;

    /// Write one framed payload, failing after `timeout` if one is set.
    async fn write_text(&self, body: &[u8], timeout: Option<Duration>) -> io::Result<()>;

    /// Tear the transport down.
    fn shutdown(&self);
}

/// Whether a transport error means the connection is gone, as opposed to a
/// transient or per-call failure such as a timeout.
#[must_use]
pub fn is_close_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Length-delimited framing over any byte-stream transport.
///
/// Suitable for `TcpStream`, unix sockets, or the in-memory
/// `tokio::io::duplex` pairs the tests run on. Each frame is a `u32`
/// length prefix followed by the payload.
pub struct FramedSocket<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
    closed: CancellationToken,
}

impl<S> FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream` in length-delimited framing.
    #[must_use]
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(read, LengthDelimitedCodec::new())),
            writer: Mutex::new(FramedWrite::new(write, LengthDelimitedCodec::new())),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<S> Socket for FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_text(&self, timeout: Option<Duration>) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let next = async {
            match reader.next().await {
                Some(Ok(frame)) => Ok(frame.to_vec()),
                Some(Err(err)) => Err(err),
                None => Err(io::ErrorKind::UnexpectedEof.into()),
            }
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(shut_down()),
            res = deadline(timeout, next) => res,
        }
    }

    async fn write_text(&self, body: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let payload = Bytes::copy_from_slice(body);
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(shut_down()),
            res = deadline(timeout, writer.send(payload)) => res,
        }
    }

    fn shutdown(&self) { self.closed.cancel(); }
}

fn shut_down() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket shut down")
}

async fn deadline<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        },
        None => fut.await,
    }
}
