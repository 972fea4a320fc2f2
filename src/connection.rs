//! Send and receive bytes and framed messages on one TCP connection.
//!
//! `Connection` owns the socket and the receive buffer for a single peer.
//! It offers two levels of IO: raw per-tick reads used by the worker loops,
//! and message-level reads/writes that speak the codec in [`crate::message`].

use std::io::{self, Cursor};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::message::{self, Message};

/// Default receive buffer capacity, in bytes.
pub const DEFAULT_RXBUF_SZ: usize = 1024;

/// One TCP connection plus its receive buffer.
///
/// Writes go through a `BufWriter` so a message emitted piecewise still
/// reaches the kernel in few syscalls; every write operation here flushes
/// before returning.
pub struct Connection {
    stream: BufWriter<TcpStream>,
    peer_addr: SocketAddr,
    buffer: BytesMut,
}

impl Connection {
    /// Wraps an established stream. `rxbuf_sz` bounds how many bytes a
    /// single read can deliver.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, rxbuf_sz: usize) -> Connection {
        Connection {
            stream: BufWriter::new(stream),
            peer_addr,
            buffer: BytesMut::with_capacity(rxbuf_sz),
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads one chunk for the current worker tick.
    ///
    /// Discards the previous tick's bytes, then reads up to the buffer
    /// capacity. Returns the number of bytes read; `0` means the peer
    /// closed its sending side. After a successful read, [`chunk`] holds
    /// exactly the bytes of this tick as one contiguous slice.
    ///
    /// [`chunk`]: Connection::chunk
    pub(crate) async fn read_chunk(&mut self) -> io::Result<usize> {
        self.buffer.clear();
        self.stream.read_buf(&mut self.buffer).await
    }

    /// The bytes delivered by the last [`read_chunk`].
    ///
    /// [`read_chunk`]: Connection::read_chunk
    pub(crate) fn chunk(&self) -> &[u8] {
        &self.buffer
    }

    /// Reads one complete framed message.
    ///
    /// Accumulates socket bytes until the buffer holds a full message, then
    /// parses and consumes it. Returns `None` when the peer closes cleanly
    /// between messages; closing mid-message is a connection reset.
    ///
    /// Not to be mixed with the per-tick reads of the worker loop: both
    /// consume the same receive buffer.
    pub async fn read_message(&mut self) -> crate::Result<Option<Message>> {
        loop {
            if let Some(message) = self.parse_message()? {
                return Ok(Some(message));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )
                .into());
            }
        }
    }

    /// Tries to decode one message from the buffered bytes.
    fn parse_message(&mut self) -> crate::Result<Option<Message>> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Message::check(&mut buf) {
            Ok(()) => {
                let len = buf.position() as usize;
                buf.set_position(0);
                let message = Message::parse(&mut buf)?;

                // Drop the decoded bytes; what remains is the start of the
                // next message.
                self.buffer.advance(len);
                Ok(Some(message))
            }
            Err(message::Error::Incomplete) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Emits one framed message and flushes.
    ///
    /// The message is staged in full before any byte reaches the socket, so
    /// a single send is never interleaved with other output.
    pub async fn write_message(&mut self, message: &mut Message) -> crate::Result<()> {
        let mut staged = Vec::with_capacity(256);
        message.write_to(&mut staged)?;
        self.stream.write_all(&staged).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes raw bytes and flushes.
    pub async fn write_bytes(&mut self, src: &[u8]) -> crate::Result<()> {
        self.stream.write_all(src).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
