//! One side of a netfs link.
//!
//! A [`Connection`] owns the buffered read and write halves of a stream and
//! knows the frame envelope: the handshake, request/response kinds and
//! opcode matching. Writes are buffered until the next flush, which happens
//! implicitly before every read.

use {
    crate::{
        config::DEFAULT_BUFFER_SIZE,
        error::Error,
        fcall::*,
        io_err, res,
        serialize::FCallCodec,
        utils::Result,
    },
    futures::sink::SinkExt,
    std::{future::Future, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        time::{Instant, timeout_at},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Connection over type-erased stream halves, as used by the client.
pub type BoxedConnection =
    Connection<Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>>;

async fn bounded<T>(deadline: Option<Instant>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(at) => match timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => res!(io_err!(TimedOut, "deadline exceeded")),
        },
        None => fut.await,
    }
}

pub struct Connection<R, W> {
    reader: FramedRead<R, FCallCodec>,
    writer: FramedWrite<W, FCallCodec>,
    deadline: Option<Instant>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_capacity(reader, writer, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(reader: R, writer: W, read_size: usize, write_size: usize) -> Self {
        let reader = FramedRead::with_capacity(reader, FCallCodec::new(), read_size);
        let mut writer = FramedWrite::new(writer, FCallCodec::new());
        writer.set_backpressure_boundary(write_size);

        Connection {
            reader,
            writer,
            deadline: None,
        }
    }

    /// Bound every following read and write until the deadline is reset.
    pub fn set_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Exchange `INIT` records with the peer.
    pub async fn handshake(&mut self) -> Result<()> {
        self.send(FCall::Init { version: VERSION }).await?;

        match self.receive().await? {
            FCall::Init { version } if version == VERSION => Ok(()),
            FCall::Init { version } => Err(Error::Version {
                local: VERSION,
                peer: version,
            }),
            other => Err(Error::protocol(format!(
                "Expected handshake, got {:?} frame",
                other.kind()
            ))),
        }
    }

    /// Buffer a request frame; nothing reaches the peer before a flush.
    pub async fn request(&mut self, call: FCall) -> Result<()> {
        if !call.is_t() {
            return Err(Error::protocol(format!("Not a request: {:?}", call.opcode())));
        }
        self.send(call).await
    }

    /// Buffer a response frame; nothing reaches the peer before a flush.
    pub async fn respond(&mut self, call: FCall) -> Result<()> {
        if !call.is_r() {
            return Err(Error::protocol(format!("Not a response: {:?}", call.opcode())));
        }
        self.send(call).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        let writer = &mut self.writer;
        bounded(self.deadline, async move { writer.flush().await }).await
    }

    /// Flush, then read the response to a request carrying `op`.
    pub async fn await_response(&mut self, op: Opcode) -> Result<FCall> {
        let call = self.receive().await?;
        if !call.is_r() {
            return Err(Error::protocol(format!(
                "Expected response, got {:?} frame",
                call.kind()
            )));
        }
        if call.opcode() != Some(op) {
            return Err(Error::protocol(format!(
                "Response opcode {:?} does not match request {:?}",
                call.opcode(),
                op
            )));
        }
        Ok(call)
    }

    /// Flush, then read the next request.
    pub async fn await_request(&mut self) -> Result<FCall> {
        let call = self.receive().await?;
        if !call.is_t() {
            return Err(Error::protocol(format!(
                "Expected request, got {:?} frame",
                call.kind()
            )));
        }
        Ok(call)
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<()> {
        let writer = &mut self.writer;
        bounded(self.deadline, async move { writer.close().await }).await
    }

    async fn send(&mut self, call: FCall) -> Result<()> {
        let writer = &mut self.writer;
        bounded(self.deadline, async move { writer.feed(call).await }).await
    }

    async fn receive(&mut self) -> Result<FCall> {
        let deadline = self.deadline;
        let Connection { reader, writer, .. } = self;

        bounded(deadline, async move {
            writer.flush().await?;
            match reader.next().await {
                Some(call) => call,
                None => res!(io_err!(UnexpectedEof, "Connection closed by peer")),
            }
        })
        .await
    }
}
