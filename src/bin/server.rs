//! tcpkit demo server.
//!
//! An echo service on top of the framework: greets every new connection,
//! echoes whatever arrives, and drops a connection once it sees a `Q`.
//! Command line arguments are parsed with `clap` and handed to the
//! library; ctrl-c shuts the server down gracefully.

use std::net::SocketAddr;

use clap::Parser;
use tcpkit::{server, Config, Conn, Flow, Server, Service, DEFAULT_PORT};
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tcpkit-server",
    version,
    about = "Echo server built on tcpkit"
)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = DEFAULT_PORT)]
    port: u16,

    /// Cap on concurrently served connections.
    #[arg(long, default_value_t = 100)]
    max_connections: usize,
}

struct Echo;

impl Service for Echo {
    type State = ();

    fn on_new_connection(&self, conn: &mut Conn) -> Self::State {
        info!(peer = %conn.peer_addr(), "new connection");
        conn.send(b"Hello from tcpkit\r\n");
    }

    fn on_data(&self, _state: &mut Self::State, conn: &mut Conn, rx: &[u8]) -> Flow {
        if rx.is_empty() {
            return Flow::Yielded;
        }

        conn.send(rx);
        if rx.contains(&b'Q') {
            return Flow::Ended;
        }
        Flow::Yielded
    }

    fn on_close(&self, _state: &mut Self::State, conn: &Conn) {
        info!(peer = %conn.peer_addr(), "connection closed");
    }
}

#[tokio::main]
async fn main() -> tcpkit::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .expect("invalid host/port");

    let config = Config {
        max_connections: cli.max_connections,
        ..Config::default()
    };

    let listener = server::bind(addr, &config)?;
    let server = Server::new(listener, config, Echo);
    info!(%addr, "starting server");

    server.run(signal::ctrl_c()).await
}
