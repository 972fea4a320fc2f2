//! The client side of the framework: one outbound connection driven by the
//! same cooperative handler model as server connections.
//!
//! [`connect`] establishes the connection and spawns the worker; the
//! returned [`Client`] is the application's handle for sending bytes and
//! for closing. Incoming data is delivered to the supplied [`Service`]'s
//! data handler, tick by tick, exactly as on the server side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error};

use crate::connection::{Connection, DEFAULT_RXBUF_SZ};
use crate::handler::{Conn, Driver, Service};
use crate::message::Message;
use crate::shutdown::Shutdown;
use crate::Error;

/// Default idle tick interval for client workers.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// How long [`Client::close`] waits for the worker to finish tearing down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound send requests are buffered up to this many messages before
/// [`Client::send`] waits.
const SEND_CHANNEL_CAPACITY: usize = 32;

/// Establishes a connection to `addr` and starts its worker.
///
/// `on_new_connection` runs before the worker starts, so the receive
/// buffer honors whatever size the callback picked, and greeting bytes it
/// queued go out before the first read.
pub async fn connect<T: ToSocketAddrs, S: Service>(addr: T, service: S) -> crate::Result<Client> {
    let socket = TcpStream::connect(addr).await?;
    let peer_addr = socket.peer_addr()?;
    let service = Arc::new(service);

    let mut conn = Conn::new(peer_addr, DEFAULT_RXBUF_SZ, DEFAULT_POLL_TIMEOUT);
    let state = service.on_new_connection(&mut conn);
    let connection = Connection::new(socket, peer_addr, conn.rxbuf_sz());

    let (notify_shutdown, _) = broadcast::channel(1);
    let (tx, rx) = mpsc::channel(SEND_CHANNEL_CAPACITY);

    let mut driver = Driver {
        service,
        connection,
        conn,
        state,
        shutdown: Shutdown::new(notify_shutdown.subscribe()),
        outbound: Some(rx),
    };

    let worker = tokio::spawn(async move {
        let res = driver.run().await;
        driver.teardown();
        if let Err(ref err) = res {
            error!(cause = %err, "connection error");
        }
        debug!(peer = %driver.conn.peer_addr(), "client worker stopped");
        res
    });

    Ok(Client {
        peer_addr,
        tx,
        notify_shutdown,
        worker,
    })
}

/// Handle to one outbound connection.
///
/// Dropping the handle without [`close`] also stops the worker (it
/// observes the closed send channel), but only `close` waits for teardown
/// to finish.
///
/// [`close`]: Client::close
pub struct Client {
    peer_addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    notify_shutdown: broadcast::Sender<()>,
    worker: JoinHandle<crate::Result<()>>,
}

impl Client {
    /// Remote address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Hands bytes to the worker for transmission between ticks.
    pub async fn send(&self, src: impl Into<Bytes>) -> crate::Result<()> {
        self.tx
            .send(src.into())
            .await
            .map_err(|_| Error::InvalidState("client worker already stopped"))
    }

    /// Stages one framed message in full and hands it to the worker; a
    /// message is transmitted without interleaving.
    pub async fn send_message(&self, message: &mut Message) -> crate::Result<()> {
        let mut staged = Vec::with_capacity(256);
        message.write_to(&mut staged)?;
        self.send(staged).await
    }

    /// Requests teardown and waits until the worker has run the close
    /// callback, closed the socket, and exited.
    ///
    /// Bounded: if the worker does not finish within the close timeout the
    /// call returns [`Error::StopTimeout`] rather than waiting forever.
    pub async fn close(self) -> crate::Result<()> {
        // The worker may already be gone (peer hung up, handler ended);
        // then nobody is subscribed and the send error is meaningless.
        let _ = self.notify_shutdown.send(());

        match time::timeout(CLOSE_TIMEOUT, self.worker).await {
            Ok(Ok(res)) => res,
            Ok(Err(_join_err)) => Err(Error::InvalidState("client worker failed")),
            Err(_elapsed) => Err(Error::StopTimeout),
        }
    }
}
