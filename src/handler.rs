//! The cooperative handler model.
//!
//! Applications implement [`Service`] once per server (or client). The
//! framework invokes [`Service::on_data`] every worker tick with the bytes
//! that arrived in that tick; the handler does a bounded amount of work and
//! returns a [`Flow`] verdict. Handlers never block: waiting for more bytes
//! means returning [`Flow::Yielded`] and picking up on the next tick.
//!
//! Nothing local to a handler invocation survives between ticks. State a
//! handler needs across suspensions belongs in [`Service::State`], with
//! [`Resume`] recording where to pick up.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error};

use crate::connection::Connection;
use crate::message::{self, Message};
use crate::shutdown::Shutdown;

/// Verdict a handler returns for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The handler suspended; invoke it again on the next tick.
    Yielded,
    /// The handler is done; tear the connection down.
    Ended,
}

/// Resumption point of a cooperative handler.
///
/// A handler runs a little further each tick and records where the next
/// invocation should pick up. The point is a plain integer chosen by the
/// handler, typically matched at the top of [`Service::on_data`]:
///
/// ```
/// use tcpkit::{Flow, Resume};
///
/// const HELLO: u32 = 1;
///
/// fn on_tick(resume: &mut Resume, rx: &[u8]) -> Flow {
///     match resume.point() {
///         0 | HELLO => {
///             if !resume.wait_until(HELLO, !rx.is_empty()) {
///                 return Flow::Yielded;
///             }
///             resume.end()
///         }
///         _ => resume.restart(),
///     }
/// }
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Resume {
    point: u32,
}

impl Resume {
    /// A fresh resumable, positioned at the top.
    pub fn new() -> Resume {
        Resume { point: 0 }
    }

    /// The current resumption point. `0` until the handler records one.
    pub fn point(&self) -> u32 {
        self.point
    }

    /// Records `point` as the place to resume and reports whether the
    /// handler may proceed past it. On `false` the handler should return
    /// [`Flow::Yielded`]; the next tick re-enters at `point`.
    pub fn wait_until(&mut self, point: u32, ready: bool) -> bool {
        self.point = point;
        ready
    }

    /// Resets to the top and yields; the next tick starts over.
    pub fn restart(&mut self) -> Flow {
        self.point = 0;
        Flow::Yielded
    }

    /// Terminates the handler and resets the resumable.
    pub fn end(&mut self) -> Flow {
        self.point = 0;
        Flow::Ended
    }
}

/// Per-connection behavior of an application.
///
/// One implementation serves every connection of a server (or a client);
/// per-connection data lives in the associated [`State`] value created by
/// [`on_new_connection`].
///
/// Callback ordering per connection: `on_new_connection` strictly precedes
/// any `on_data` invocation, and `on_close` runs exactly once, after the
/// last `on_data`.
///
/// [`State`]: Service::State
/// [`on_new_connection`]: Service::on_new_connection
pub trait Service: Send + Sync + 'static {
    /// Per-connection state, carried across handler suspensions.
    type State: Send + 'static;

    /// Invoked once the connection exists: after registration on the
    /// server side, after connect on the client side, always before any
    /// data. May tune the connection (receive buffer size, poll timeout)
    /// and queue greeting bytes, which are flushed before the first read.
    fn on_new_connection(&self, conn: &mut Conn) -> Self::State;

    /// The cooperative data handler, invoked every worker tick. `rx` holds
    /// the bytes read this tick as one contiguous slice; it is empty on
    /// idle ticks. Output queued on `conn` is transmitted after the call
    /// returns.
    fn on_data(&self, state: &mut Self::State, conn: &mut Conn, rx: &[u8]) -> Flow;

    /// Invoked exactly once when the connection tears down.
    fn on_close(&self, _state: &mut Self::State, _conn: &Conn) {}
}

/// Per-connection handle passed to [`Service`] callbacks.
///
/// Callbacks borrow the handle for the duration of the call; output queued
/// with [`send`] or [`send_message`] is written out by the worker once the
/// callback returns.
///
/// [`send`]: Conn::send
/// [`send_message`]: Conn::send_message
pub struct Conn {
    peer_addr: SocketAddr,
    rxbuf_sz: usize,
    poll_timeout: Duration,
    outbox: BytesMut,
    stop: bool,
}

impl Conn {
    pub(crate) fn new(peer_addr: SocketAddr, rxbuf_sz: usize, poll_timeout: Duration) -> Conn {
        Conn {
            peer_addr,
            rxbuf_sz,
            poll_timeout,
            outbox: BytesMut::new(),
            stop: false,
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Receive buffer size, in bytes.
    pub fn rxbuf_sz(&self) -> usize {
        self.rxbuf_sz
    }

    /// Adjusts the receive buffer size. Effective when set from
    /// [`Service::on_new_connection`]; the buffer is allocated after that
    /// callback returns.
    pub fn set_rxbuf_sz(&mut self, rxbuf_sz: usize) {
        self.rxbuf_sz = rxbuf_sz;
    }

    /// How long a worker tick waits for readiness before invoking the
    /// handler with no data.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Adjusts the idle tick interval.
    pub fn set_poll_timeout(&mut self, poll_timeout: Duration) {
        self.poll_timeout = poll_timeout;
    }

    /// Queues raw bytes for transmission after the current callback.
    pub fn send(&mut self, src: &[u8]) {
        self.outbox.extend_from_slice(src);
    }

    /// Queues one framed message for transmission after the current
    /// callback. The message is staged in full before anything is queued,
    /// so a failed emission never leaves half a message behind and a
    /// queued message is never interleaved with other output.
    pub fn send_message(&mut self, message: &mut Message) -> Result<(), message::Error> {
        let mut staged = Vec::with_capacity(256);
        message.write_to(&mut staged)?;
        self.outbox.extend_from_slice(&staged);
        Ok(())
    }

    /// Requests teardown of this connection. Observed by the worker after
    /// the current callback returns; sticky once set.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop
    }

    pub(crate) fn take_outbox(&mut self) -> Bytes {
        self.outbox.split().freeze()
    }
}

/// The worker tick loop shared by server connections and clients.
///
/// Owns everything one connection needs: the socket IO, the service, the
/// per-connection state, and the shutdown receiver. Clients additionally
/// feed an outbound channel whose bytes are transmitted between ticks.
pub(crate) struct Driver<S: Service> {
    pub(crate) service: Arc<S>,
    pub(crate) connection: Connection,
    pub(crate) conn: Conn,
    pub(crate) state: S::State,
    pub(crate) shutdown: Shutdown,
    pub(crate) outbound: Option<mpsc::Receiver<Bytes>>,
}

impl<S: Service> Driver<S> {
    /// Runs the connection until the peer hangs up, the handler ends, or
    /// shutdown is requested. Returning (even with an error) means the
    /// worker is done pumping; the owner performs teardown.
    pub(crate) async fn run(&mut self) -> crate::Result<()> {
        // Output queued by on_new_connection goes out before the first
        // read.
        self.flush().await?;

        loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }

            // One tick: bytes arriving, an outbound send request, the
            // idle timeout, or a shutdown notice, whichever is first.
            let read = tokio::select! {
                res = self.connection.read_chunk() => Some(res),
                outbound = async {
                    match self.outbound.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<Bytes>>().await,
                    }
                } => {
                    match outbound {
                        Some(bytes) => {
                            self.connection.write_bytes(&bytes).await?;
                            continue;
                        }
                        // Every sender is gone; the owner wants us gone
                        // too.
                        None => return Ok(()),
                    }
                }
                _ = time::sleep(self.conn.poll_timeout()) => None,
                _ = self.shutdown.recv() => return Ok(()),
            };

            let n = match read {
                Some(Ok(0)) => {
                    debug!(peer = %self.conn.peer_addr(), "peer closed connection");
                    return Ok(());
                }
                Some(Ok(n)) => n,
                Some(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Some(Err(err)) => {
                    error!(peer = %self.conn.peer_addr(), cause = %err, "read failed");
                    return Ok(());
                }
                None => 0,
            };

            let rx: &[u8] = if n > 0 { self.connection.chunk() } else { &[] };
            let flow = self.service.on_data(&mut self.state, &mut self.conn, rx);
            self.flush().await?;

            if flow == Flow::Ended || self.conn.stop_requested() {
                return Ok(());
            }
        }
    }

    /// Transmits whatever the callbacks queued.
    async fn flush(&mut self) -> crate::Result<()> {
        let out = self.conn.take_outbox();
        if !out.is_empty() {
            self.connection.write_bytes(&out).await?;
        }
        Ok(())
    }

    /// Runs the close callback. Called exactly once by the owner after
    /// [`run`] returns.
    ///
    /// [`run`]: Driver::run
    pub(crate) fn teardown(&mut self) {
        self.service.on_close(&mut self.state, &self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_records_the_point_and_gates_progress() {
        let mut resume = Resume::new();
        assert_eq!(resume.point(), 0);

        assert!(!resume.wait_until(7, false));
        assert_eq!(resume.point(), 7);

        // Re-entering at the same point with the condition now true.
        assert!(resume.wait_until(7, true));
        assert_eq!(resume.point(), 7);
    }

    #[test]
    fn restart_yields_from_the_top() {
        let mut resume = Resume::new();
        resume.wait_until(3, true);

        assert_eq!(resume.restart(), Flow::Yielded);
        assert_eq!(resume.point(), 0);
    }

    #[test]
    fn end_terminates_and_resets() {
        let mut resume = Resume::new();
        resume.wait_until(5, true);

        assert_eq!(resume.end(), Flow::Ended);
        assert_eq!(resume.point(), 0);
    }
}
