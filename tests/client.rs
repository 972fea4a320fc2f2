//! Client tests against a real echo server: sends, framed messages,
//! handler-driven termination, and bounded close.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tcpkit::{client, server, Config, Conn, Connection, Flow, Message, Server, Service};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

async fn start_echo_server() -> (SocketAddr, JoinHandle<tcpkit::Result<()>>) {
    struct Echo;

    impl Service for Echo {
        type State = ();

        fn on_new_connection(&self, _conn: &mut Conn) -> Self::State {}

        fn on_data(&self, _state: &mut Self::State, conn: &mut Conn, rx: &[u8]) -> Flow {
            if !rx.is_empty() {
                conn.send(rx);
            }
            Flow::Yielded
        }
    }

    let config = Config::default();
    let listener = server::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
    let server = Server::new(listener, config, Echo);
    let addr = server.local_addr().unwrap();
    let join = tokio::spawn(server.run(std::future::pending::<()>()));
    (addr, join)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Accumulates every received byte and counts close callbacks.
#[derive(Default)]
struct Sink {
    received: Mutex<Vec<u8>>,
    closed: AtomicUsize,
}

struct Collect(Arc<Sink>);

impl Service for Collect {
    type State = ();

    fn on_new_connection(&self, _conn: &mut Conn) -> Self::State {}

    fn on_data(&self, _state: &mut Self::State, _conn: &mut Conn, rx: &[u8]) -> Flow {
        if !rx.is_empty() {
            self.0.received.lock().unwrap().extend_from_slice(rx);
        }
        Flow::Yielded
    }

    fn on_close(&self, _state: &mut Self::State, _conn: &Conn) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn send_round_trips_through_the_server() {
    let (addr, _server) = start_echo_server().await;

    let sink = Arc::new(Sink::default());
    let client = client::connect(addr, Collect(Arc::clone(&sink)))
        .await
        .unwrap();

    client.send(&b"ping"[..]).await.unwrap();
    wait_for(|| sink.received.lock().unwrap().as_slice() == b"ping").await;

    timeout(Duration::from_secs(1), client.close())
        .await
        .expect("close did not finish in time")
        .unwrap();
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn framed_message_round_trips_through_the_server() {
    let (addr, _server) = start_echo_server().await;

    let sink = Arc::new(Sink::default());
    let client = client::connect(addr, Collect(Arc::clone(&sink)))
        .await
        .unwrap();

    let mut message = Message::new();
    message.add("Hello", "World").unwrap();
    message.add("Test", "Program").unwrap();
    message.set_payload(Bytes::from_static(b"payload"));
    client.send_message(&mut message).await.unwrap();

    // Wait until the echoed bytes form one complete message again.
    wait_for(|| {
        let received = sink.received.lock().unwrap();
        Message::check(&mut Cursor::new(&received[..])).is_ok()
    })
    .await;

    let received = sink.received.lock().unwrap().clone();
    let parsed = Message::parse(&mut Cursor::new(&received[..])).unwrap();
    assert_eq!(parsed.get("Hello"), Some("World"));
    assert_eq!(parsed.get("Test"), Some("Program"));
    assert_eq!(parsed.get("Content-Length"), Some("7"));
    assert_eq!(parsed.payload().as_ref(), b"payload");

    client.close().await.unwrap();
}

#[tokio::test]
async fn worker_stops_when_the_handler_ends() {
    struct OneShot;

    impl Service for OneShot {
        type State = ();

        fn on_new_connection(&self, _conn: &mut Conn) -> Self::State {}

        fn on_data(&self, _state: &mut Self::State, _conn: &mut Conn, rx: &[u8]) -> Flow {
            if rx.is_empty() {
                Flow::Yielded
            } else {
                Flow::Ended
            }
        }
    }

    let (addr, _server) = start_echo_server().await;
    let client = client::connect(addr, OneShot).await.unwrap();

    // The echoed byte reaches the handler, which ends the connection.
    client.send(&b"x"[..]).await.unwrap();

    // Once the worker is gone, sends are refused.
    timeout(Duration::from_secs(5), async {
        while client.send(&b"y"[..]).await.is_ok() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not stop after the handler ended");

    client.close().await.unwrap();
}

#[tokio::test]
async fn connection_framing_round_trips_between_peers() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let acceptor = tokio::spawn(async move {
        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut connection = Connection::new(socket, peer_addr, 1024);

        let request = connection.read_message().await.unwrap().unwrap();
        let mut reply = Message::new();
        reply
            .add("Echoed", request.get("Hello").unwrap())
            .unwrap();
        reply.set_payload(request.payload().clone());
        connection.write_message(&mut reply).await.unwrap();

        // The peer closing cleanly between messages reads as `None`.
        assert!(connection.read_message().await.unwrap().is_none());
    });

    let socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    let peer_addr = socket.peer_addr().unwrap();
    let mut connection = Connection::new(socket, peer_addr, 1024);

    let mut request = Message::new();
    request.add("Hello", "World").unwrap();
    request.set_payload(Bytes::from_static(b"xyz"));
    connection.write_message(&mut request).await.unwrap();

    let reply = connection.read_message().await.unwrap().unwrap();
    assert_eq!(reply.get("Echoed"), Some("World"));
    assert_eq!(reply.payload().as_ref(), b"xyz");

    drop(connection);
    timeout(Duration::from_secs(5), acceptor)
        .await
        .expect("acceptor did not finish")
        .unwrap();
}

#[tokio::test]
async fn close_is_prompt_on_an_idle_connection() {
    let (addr, _server) = start_echo_server().await;

    let sink = Arc::new(Sink::default());
    let client = client::connect(addr, Collect(Arc::clone(&sink)))
        .await
        .unwrap();

    timeout(Duration::from_secs(1), client.close())
        .await
        .expect("close did not finish in time")
        .unwrap();
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
}
