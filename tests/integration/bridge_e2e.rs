//! Proxy-path end-to-end tests
//!
//! A mock WebSocket peer stands in for the remote bridge endpoint. The
//! tests verify the deferred ConnectAck reply, data round trips in both
//! directions, and session teardown on peer close and on link drop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use socks5_bridge::bridge::codec::{frame_flag, frame_type};
use socks5_bridge::bridge::{
    decode, encode, BridgeReceiver, Frame, Notification, Transport, WsTransport,
    WsTransportConfig,
};
use socks5_bridge::socks5::{
    HostAllowlist, SessionRegistry, Socks5Server, Socks5ServerConfig,
};

const CLIENT_ID: &str = "client-01";
const METHOD_SELECT_REPLY: [u8; 2] = [0x05, 0x00];
const CONNECT_SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const CONNECT_FAILURE_REPLY: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

enum PeerCmd {
    Send(Vec<u8>),
    Drop,
}

/// Mock remote bridge peer: decodes inbound frames, sends scripted ones
struct MockPeer {
    addr: SocketAddr,
    frames_rx: mpsc::UnboundedReceiver<Frame>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
}

async fn start_mock_peer() -> MockPeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<PeerCmd>();

    tokio::spawn(async move {
        // Accept again after a dropped link so reconnects land somewhere
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    message = source.next() => match message {
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Ok(frame) = decode(&bytes) {
                                let _ = frames_tx.send(frame);
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(PeerCmd::Send(bytes)) => {
                            let _ = sink.send(Message::Binary(bytes)).await;
                        }
                        Some(PeerCmd::Drop) | None => break,
                    },
                }
            }
        }
    });

    MockPeer {
        addr,
        frames_rx,
        cmd_tx,
    }
}

impl MockPeer {
    async fn recv_frame(&mut self) -> Frame {
        timeout(Duration::from_secs(5), self.frames_rx.recv())
            .await
            .expect("expected a frame from the proxy")
            .expect("mock peer channel closed")
    }

    fn send_frame(&self, frame_type: u8, conn_id: &str, payload: &[u8]) {
        let bytes = encode(
            frame_type,
            frame_flag::TO_CLIENT,
            CLIENT_ID,
            conn_id,
            0,
            Some(payload),
        )
        .unwrap();
        self.cmd_tx.send(PeerCmd::Send(bytes)).unwrap();
    }

    fn drop_link(&self) {
        self.cmd_tx.send(PeerCmd::Drop).unwrap();
    }
}

struct ProxyEnv {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    peer: MockPeer,
    _server: Arc<Socks5Server>,
    _transport: Arc<WsTransport>,
}

async fn start_proxy_env() -> ProxyEnv {
    let peer = start_mock_peer().await;
    let registry = Arc::new(SessionRegistry::new());
    let receiver = Arc::new(BridgeReceiver::new(CLIENT_ID, Arc::clone(&registry)));
    let transport = WsTransport::connect(
        WsTransportConfig::new(format!("ws://{}/bridge", peer.addr)),
        None,
        receiver,
    )
    .await
    .unwrap();

    let server = Arc::new(
        Socks5Server::bind(
            Socks5ServerConfig {
                bind_port: 0,
                client_id: CLIENT_ID.to_owned(),
                ..Socks5ServerConfig::default()
            },
            Arc::new(HostAllowlist::new()), // empty: everything is proxied
            Arc::clone(&registry),
            Some(Arc::clone(&transport) as Arc<dyn Transport>),
        )
        .await
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serve = Arc::clone(&server);
    tokio::spawn(async move { serve.serve().await });

    ProxyEnv {
        addr,
        registry,
        peer,
        _server: server,
        _transport: transport,
    }
}

async fn greet(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, METHOD_SELECT_REPLY);
}

async fn request_domain(stream: &mut TcpStream, host: &str, port: u16) {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
}

/// Assert the proxy closed the client connection (clean FIN or reset)
async fn expect_closed(stream: &mut TcpStream, what: &str) {
    let mut buf = [0u8; 16];
    match timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    {
        Ok(n) => assert_eq!(n, 0, "{what}: expected EOF, got {:?}", &buf[..n]),
        Err(_) => {}
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_proxied_session_full_lifecycle() {
    let mut env = start_proxy_env().await;
    let mut client = TcpStream::connect(env.addr).await.unwrap();
    greet(&mut client).await;
    request_domain(&mut client, "example.com", 80).await;

    // The proxy announces the session with an explicit Connect frame
    let connect = env.peer.recv_frame().await;
    assert_eq!(connect.header.frame_type, frame_type::CONNECT);
    assert_eq!(connect.header.flag, frame_flag::TO_SERVER);
    assert_eq!(connect.header.client_id, CLIENT_ID);
    let target = Notification::decode(&connect.payload).unwrap();
    assert_eq!(target.addr, "example.com");
    assert_eq!(target.port, 80);
    assert_eq!(target.atyp, 0x03);

    let conn_id = connect.header.conn_id.clone();
    assert!(env.registry.exists(&conn_id));

    // No SOCKS5 reply may be sent before the ConnectAck arrives
    let mut probe = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(300), client.read(&mut probe))
            .await
            .is_err(),
        "reply must wait for the ConnectAck"
    );

    // Client bytes already flow as Data frames
    client.write_all(b"early-bytes").await.unwrap();
    let data = env.peer.recv_frame().await;
    assert_eq!(data.header.frame_type, frame_type::DATA);
    assert_eq!(data.header.conn_id, conn_id);
    assert_eq!(data.payload, b"early-bytes");

    // ConnectAck success releases the deferred reply
    let ack = Notification {
        code: 0,
        message: String::new(),
        addr: "example.com".into(),
        port: 80,
        atyp: 0x03,
    };
    env.peer
        .send_frame(frame_type::CONNECT_ACK, &conn_id, &ack.encode());
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECT_SUCCESS_REPLY);

    // Remote bytes reach the client through the demultiplexer
    env.peer
        .send_frame(frame_type::DATA, &conn_id, b"response-from-target");
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"response-from-target");

    // Peer close tears the session down
    env.peer.send_frame(
        frame_type::CLOSE,
        &conn_id,
        &Notification::default().encode(),
    );
    expect_closed(&mut client, "close after the peer Close frame").await;

    let registry = Arc::clone(&env.registry);
    wait_until(move || !registry.exists(&conn_id), "session deregistration").await;
}

#[tokio::test]
async fn test_proxied_connect_refused_by_peer() {
    let mut env = start_proxy_env().await;
    let mut client = TcpStream::connect(env.addr).await.unwrap();
    greet(&mut client).await;
    request_domain(&mut client, "example.com", 80).await;

    let connect = env.peer.recv_frame().await;
    let conn_id = connect.header.conn_id.clone();

    let ack = Notification {
        code: 1,
        message: "nx".into(),
        addr: "example.com".into(),
        port: 80,
        atyp: 0x03,
    };
    env.peer
        .send_frame(frame_type::CONNECT_ACK, &conn_id, &ack.encode());

    // The client sees the failure reply, then only a closed connection
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECT_FAILURE_REPLY);

    expect_closed(&mut client, "close after a refused connect").await;

    let registry = Arc::clone(&env.registry);
    wait_until(move || !registry.exists(&conn_id), "session deregistration").await;
}

#[tokio::test]
async fn test_link_drop_tears_down_proxied_sessions() {
    let mut env = start_proxy_env().await;
    let mut client = TcpStream::connect(env.addr).await.unwrap();
    greet(&mut client).await;
    request_domain(&mut client, "example.com", 80).await;

    let connect = env.peer.recv_frame().await;
    let conn_id = connect.header.conn_id.clone();
    assert!(env.registry.exists(&conn_id));

    // Kill the WebSocket link; orphaned proxied sessions must not linger
    env.peer.drop_link();

    expect_closed(&mut client, "close after the bridge drops").await;

    let registry = Arc::clone(&env.registry);
    wait_until(move || registry.is_empty(), "registry teardown").await;
}
