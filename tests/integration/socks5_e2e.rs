//! Direct-path end-to-end tests
//!
//! Each test runs a real server on an ephemeral loopback port and speaks
//! raw SOCKS5 bytes at it, with loopback TCP listeners standing in for
//! the dialed targets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use socks5_bridge::socks5::{
    HostAllowlist, SessionRegistry, Socks5Server, Socks5ServerConfig,
};

const METHOD_SELECT_REPLY: [u8; 2] = [0x05, 0x00];
const CONNECT_SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const CONNECT_FAILURE_REPLY: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Start a server with the given allowlist; returns its address
async fn start_server(allowlist_hosts: &[&str]) -> (Arc<Socks5Server>, SocketAddr) {
    let allowlist = Arc::new(HostAllowlist::new());
    allowlist.load(allowlist_hosts.iter().copied());

    let server = Arc::new(
        Socks5Server::bind(
            Socks5ServerConfig {
                bind_port: 0,
                connect_timeout: Duration::from_secs(5),
                ..Socks5ServerConfig::default()
            },
            allowlist,
            Arc::new(SessionRegistry::new()),
            None,
        )
        .await
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();

    let serve = Arc::clone(&server);
    tokio::spawn(async move { serve.serve().await });

    (server, addr)
}

/// Run the no-auth greeting and assert the method-select reply
async fn greet(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, METHOD_SELECT_REPLY);
}

/// Send a CONNECT request for an IPv4 target
async fn request_ipv4(stream: &mut TcpStream, addr: SocketAddr) {
    let SocketAddr::V4(v4) = addr else {
        panic!("expected an IPv4 address")
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&addr.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
}

/// Send a CONNECT request for a domain target
async fn request_domain(stream: &mut TcpStream, host: &str, port: u16) {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
}

/// Read the fixed 10-byte CONNECT reply
async fn read_reply(stream: &mut TcpStream) -> [u8; 10] {
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Assert the server closed the connection without sending more bytes
///
/// A reset also counts: terminating with unread request bytes pending can
/// surface as ECONNRESET rather than a clean FIN.
async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the connection")
    {
        Ok(n) => assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]),
        Err(_) => {}
    }
}

/// Loopback echo server handling a single connection
async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_direct_ipv4_echo() {
    let target = spawn_echo_target().await;
    let (_server, addr) = start_server(&["127.0.0.1"]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;
    request_ipv4(&mut client, target).await;
    assert_eq!(read_reply(&mut client).await, CONNECT_SUCCESS_REPLY);

    client.write_all(b"ping over the proxy").await.unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping over the proxy");
}

#[tokio::test]
async fn test_direct_domain_echo() {
    let target = spawn_echo_target().await;
    let (_server, addr) = start_server(&["localhost"]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;
    request_domain(&mut client, "localhost", target.port()).await;
    assert_eq!(read_reply(&mut client).await, CONNECT_SUCCESS_REPLY);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[tokio::test]
async fn test_direct_ipv6_echo() {
    let listener = match TcpListener::bind("[::1]:0").await {
        Ok(listener) => listener,
        // Environment without an IPv6 loopback; nothing to verify
        Err(_) => return,
    };
    let target_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        if let Ok(n) = stream.read(&mut buf).await {
            let _ = stream.write_all(&buf[..n]).await;
        }
    });

    let (_server, addr) = start_server(&["::1"]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    request.extend_from_slice(&target_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    assert_eq!(read_reply(&mut client).await, CONNECT_SUCCESS_REPLY);

    client.write_all(b"v6 bytes").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"v6 bytes");
}

#[tokio::test]
async fn test_dial_failure_sends_failure_reply() {
    // Bind then drop a listener so the port is (very likely) closed
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let (_server, addr) = start_server(&["127.0.0.1"]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;
    request_ipv4(&mut client, dead_addr).await;

    assert_eq!(read_reply(&mut client).await, CONNECT_FAILURE_REPLY);
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_bad_version_terminates_without_reply() {
    let (_server, addr) = start_server(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_unsupported_command_terminates_without_reply() {
    let (_server, addr) = start_server(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    // BIND is not supported
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_unknown_atyp_terminates_without_reply() {
    let (_server, addr) = start_server(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    client
        .write_all(&[0x05, 0x01, 0x00, 0x02, 0, 80])
        .await
        .unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_empty_domain_terminates_without_reply() {
    let (_server, addr) = start_server(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    // ATYP=Domain with a zero length byte
    client
        .write_all(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50])
        .await
        .unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_port_zero_terminates_without_reply() {
    let (_server, addr) = start_server(&["127.0.0.1"]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x00])
        .await
        .unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_half_close_drains_both_directions() {
    // Target reads everything until FIN, then replies with the total and
    // closes; exercises the FIN-first drain on both pipes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        let reply = format!("got {} bytes", received.len());
        let _ = stream.write_all(reply.as_bytes()).await;
    });

    let (_server, addr) = start_server(&["127.0.0.1"]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;
    request_ipv4(&mut client, target_addr).await;
    assert_eq!(read_reply(&mut client).await, CONNECT_SUCCESS_REPLY);

    client.write_all(&vec![0x42; 1024]).await.unwrap();
    // Client half-closes; the target must still see all 1024 bytes
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("reverse pipe should drain and close")
        .unwrap();
    assert_eq!(response, b"got 1024 bytes");
}

#[tokio::test]
async fn test_non_allowlisted_without_bridge_terminates() {
    // No bridge transport: the proxy path cannot be taken
    let (_server, addr) = start_server(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;
    request_domain(&mut client, "example.com", 80).await;
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let (server, addr) = start_server(&[]).await;

    // Established before shutdown
    let mut client = TcpStream::connect(addr).await.unwrap();
    greet(&mut client).await;

    server.shutdown().await;

    // The accept loop has stopped; a new handshake never completes
    let mut late = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(_) => return,
    };
    late.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    let result = timeout(Duration::from_millis(500), late.read_exact(&mut buf)).await;
    assert!(matches!(result, Err(_) | Ok(Err(_))));
}
