//! A small, embeddable TCP server/client framework.
//!
//! tcpkit manages connection lifecycles on behalf of application code. The
//! application supplies a [`Service`] implementation; the framework accepts
//! connections, pumps bytes, invokes the service's cooperative handler once
//! per worker tick, and guarantees orderly teardown.
//!
//! # Layout
//!
//! The major components are:
//!
//! * `server`: the accept loop. Owns a listening socket and a registry of
//!   live connections, enforces the connection cap, and coordinates
//!   graceful shutdown.
//!
//! * `client`: the outbound counterpart. One worker per connection,
//!   driven by the same handler model as server connections.
//!
//! * `handler`: the cooperative handler model. [`Service`] describes the
//!   callbacks, [`Flow`] is the per-tick verdict, and [`Resume`] holds a
//!   handler's resumption point between ticks.
//!
//! * `message`: the framed key/value codec spoken on the wire. A
//!   [`Message`] carries ordered text headers and an opaque payload.

pub mod client;
pub use client::Client;

mod connection;
pub use connection::Connection;

pub mod handler;
pub use handler::{Conn, Flow, Resume, Service};

pub mod message;
pub use message::Message;

mod registry;

pub mod server;
pub use server::{Config, Server, ServerHandle};

mod shutdown;

/// Default port the demo server listens on, used when no port is given.
pub const DEFAULT_PORT: &str = "7070";

/// Error returned by framework operations.
///
/// Worker-internal conditions are not surfaced here: a peer closing its end
/// of a connection is converted into orderly teardown of that connection,
/// never into an error for the caller of any API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was attempted from the wrong lifecycle state, such as
    /// sending on a client whose worker has already stopped.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Socket creation, bind, listen, connect, or IO failed. The underlying
    /// OS error is preserved as the source.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// The message codec rejected input or failed to emit.
    #[error("codec error: {0}")]
    Codec(#[from] message::Error),

    /// A worker did not observe a stop request within the close timeout.
    #[error("worker did not stop in time")]
    StopTimeout,
}

/// A specialized `Result` type for tcpkit operations.
pub type Result<T> = std::result::Result<T, Error>;
