//! The server side of the framework: accept loop, connection registry,
//! connection cap, and graceful shutdown.
//!
//! A [`Server`] owns a listening socket and a [`Service`]. Its accept loop
//! admits connections up to `max_connections`, registers each one, runs
//! `on_new_connection`, and spawns a worker that drives the service's data
//! handler until the connection ends. Shutting down broadcasts a stop
//! request to every worker and waits for the registry to drain.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, DEFAULT_RXBUF_SZ};
use crate::handler::{Conn, Driver, Service};
use crate::registry::{Registration, Registry};
use crate::shutdown::Shutdown;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on concurrently live connections. At the cap the accept loop
    /// waits for a slot; surplus connections stay queued in the kernel.
    pub max_connections: usize,

    /// Backlog handed to `listen(2)`.
    pub listen_backlog: u32,

    /// Initial receive buffer size for each connection, in bytes.
    /// `on_new_connection` may adjust it per connection.
    pub rxbuf_sz: usize,

    /// Initial idle tick interval for each connection.
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_connections: 100,
            listen_backlog: 10,
            rxbuf_sz: DEFAULT_RXBUF_SZ,
            poll_timeout: Duration::from_millis(10),
        }
    }
}

/// Creates a listening socket for `addr` honoring the configured backlog,
/// with `SO_REUSEADDR` set.
pub fn bind(addr: SocketAddr, config: &Config) -> crate::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(config.listen_backlog)?)
}

/// A TCP server bound to one listening socket.
///
/// Create with [`Server::new`], grab a [`ServerHandle`] if you need to
/// observe or stop it from elsewhere, then await [`Server::run`].
pub struct Server<S: Service> {
    listener: TcpListener,
    config: Config,
    service: Arc<S>,
    registry: Arc<Registry>,
    close: Arc<Notify>,
}

impl<S: Service> Server<S> {
    pub fn new(listener: TcpListener, config: Config, service: S) -> Server<S> {
        Server {
            listener,
            config,
            service: Arc::new(service),
            registry: Arc::new(Registry::new()),
            close: Arc::new(Notify::new()),
        }
    }

    /// Local address of the listening socket. Useful after binding port 0.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A cloneable handle for observing and stopping this server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
            close: Arc::clone(&self.close),
        }
    }

    /// Serves until the `shutdown` future completes or a handle requests
    /// shutdown, then tears everything down.
    ///
    /// Teardown broadcasts the stop request to every live connection
    /// worker and waits until each has run its close callback, closed its
    /// socket, and left the registry. On return the registry is empty and
    /// no worker remains.
    pub async fn run(self, shutdown: impl Future) -> crate::Result<()> {
        let Server {
            listener,
            config,
            service,
            registry,
            close,
        } = self;

        // Workers subscribe to `notify_shutdown` for the stop request and
        // hold a clone of `shutdown_complete_tx`; once every clone is
        // dropped the receiver completes, which is how we know the
        // registry drained.
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let limit_connections = Arc::new(Semaphore::new(config.max_connections));
        let mut listener = Listener {
            listener,
            config,
            service,
            registry,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
        };

        tokio::select! {
            res = listener.run() => {
                // Accepting failed repeatedly; the listener gave up.
                // Individual connection errors never bubble up here.
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = shutdown => {
                info!("shutting down");
            }
            _ = close.notified() => {
                info!("shutting down");
            }
        }

        // Dropping the broadcast sender is the stop request every worker
        // is subscribed to; dropping our `mpsc` sender leaves workers as
        // the only holders, so `recv` completes once the last one exits.
        let Listener {
            notify_shutdown,
            shutdown_complete_tx,
            ..
        } = listener;
        drop(notify_shutdown);
        drop(shutdown_complete_tx);

        let _ = shutdown_complete_rx.recv().await;

        Ok(())
    }
}

/// Cloneable handle to a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
    close: Arc<Notify>,
}

impl ServerHandle {
    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Requests graceful shutdown of the server.
    pub fn shutdown(&self) {
        self.close.notify_one();
    }
}

/// Accept-loop state, created inside [`Server::run`].
struct Listener<S: Service> {
    listener: TcpListener,
    config: Config,
    service: Arc<S>,
    registry: Arc<Registry>,

    /// Caps live connections. A permit is acquired before accepting and
    /// travels with the connection's handler, returning on teardown.
    limit_connections: Arc<Semaphore>,

    /// Sender half workers subscribe to for the stop request.
    notify_shutdown: broadcast::Sender<()>,

    /// Cloned into every handler; used only for its drop.
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl<S: Service> Listener<S> {
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            // Wait for capacity first: at the cap this parks the accept
            // loop and the kernel backlog queues newcomers. The permit
            // moves into the handler and returns when it drops.
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let (socket, peer_addr) = self.accept().await?;
            debug!(peer = %peer_addr, "connection accepted");

            let registration = Arc::clone(&self.registry).register(peer_addr);

            // The callback may retune the buffer size, so the receive
            // buffer is allocated only after it returns.
            let mut conn = Conn::new(peer_addr, self.config.rxbuf_sz, self.config.poll_timeout);
            let state = self.service.on_new_connection(&mut conn);
            let connection = Connection::new(socket, peer_addr, conn.rxbuf_sz());

            let mut handler = Handler {
                driver: Driver {
                    service: Arc::clone(&self.service),
                    connection,
                    conn,
                    state,
                    shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                    outbound: None,
                },
                registration,
                _permit: permit,
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, "connection error");
                }
            });
        }
    }

    /// Accepts one connection, retrying transient failures with
    /// exponential backoff. Gives up after the backoff passes 64 seconds.
    async fn accept(&mut self) -> crate::Result<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => return Ok((socket, peer_addr)),
                Err(err) => {
                    warn!(cause = %err, "accept failed");
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Worker state for one accepted connection.
///
/// Field order doubles as teardown order: the driver (and with it the
/// socket) goes first, then the registry entry, then the cap permit.
struct Handler<S: Service> {
    driver: Driver<S>,
    registration: Registration,
    _permit: OwnedSemaphorePermit,
    _shutdown_complete: mpsc::Sender<()>,
}

impl<S: Service> Handler<S> {
    /// Pumps the connection, then tears it down. The close callback runs
    /// exactly once, whatever ended the connection.
    async fn run(&mut self) -> crate::Result<()> {
        let res = self.driver.run().await;

        self.registration.set_stopping();
        self.driver.teardown();

        res
    }
}
