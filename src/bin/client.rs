//! tcpkit demo client.
//!
//! Connects to the demo server, sends one framed message, and prints
//! whatever the server echoes back. The handler answers any `!` from the
//! server with a `Q`, which asks the echo server to drop the connection.

use std::net::SocketAddr;

use bytes::Bytes;
use clap::Parser;
use tcpkit::{client, Conn, Flow, Message, Service, DEFAULT_PORT};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tcpkit-client",
    version,
    about = "Demo client for the tcpkit echo server"
)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = DEFAULT_PORT)]
    port: u16,

    /// Payload to carry in the framed message.
    #[arg(long, default_value = "hello over packit")]
    payload: String,
}

struct Printer;

impl Service for Printer {
    type State = ();

    fn on_new_connection(&self, conn: &mut Conn) -> Self::State {
        info!(peer = %conn.peer_addr(), "connected");
    }

    fn on_data(&self, _state: &mut Self::State, conn: &mut Conn, rx: &[u8]) -> Flow {
        if rx.is_empty() {
            return Flow::Yielded;
        }

        println!("{}", String::from_utf8_lossy(rx));
        if rx.contains(&b'!') {
            conn.send(b"Q");
        }
        Flow::Yielded
    }

    fn on_close(&self, _state: &mut Self::State, conn: &Conn) {
        info!(peer = %conn.peer_addr(), "disconnected");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> tcpkit::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .expect("invalid host/port");

    let client = client::connect(addr, Printer).await?;

    let mut message = Message::new();
    message.add("From", "tcpkit-client")?;
    message.set_payload(Bytes::from(cli.payload.into_bytes()));
    client.send_message(&mut message).await?;

    // Keep pumping replies until interrupted.
    tokio::signal::ctrl_c().await?;

    client.close().await
}
