//! Proxy Tunnel Tests
//!
//! Covers:
//! - SOCKS5 handshake (anonymous and username/password)
//! - SOCKS5 method and CONNECT rejections
//! - HTTP CONNECT success and failure
//! - The connect timeout bounding the whole handshake
//! - SSL-to-proxy rejection

use coronet::runtime::Runtime;
use coronet::socket::{FramingConfig, ProxyConfig, Socket, SocketKind};
use coronet::NetError;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn echo_once(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).unwrap();
    stream.write_all(&buf[..n]).unwrap();
}

/// SOCKS5 server accepting one tunnel, optionally requiring the given
/// credentials. Returns the domain the client asked to connect to.
fn spawn_socks5(creds: Option<(&'static str, &'static str)>) -> (u16, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        let greeting = read_exact(&mut stream, 3);
        let expected_method = if creds.is_some() { 0x02 } else { 0x00 };
        assert_eq!(greeting, [0x05, 0x01, expected_method]);
        stream.write_all(&[0x05, expected_method]).unwrap();

        if let Some((user, pass)) = creds {
            let head = read_exact(&mut stream, 2);
            assert_eq!(head[0], 0x01);
            let got_user = read_exact(&mut stream, head[1] as usize);
            let plen = read_exact(&mut stream, 1)[0] as usize;
            let got_pass = read_exact(&mut stream, plen);
            let ok = got_user == user.as_bytes() && got_pass == pass.as_bytes();
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).unwrap();
            if !ok {
                return String::new();
            }
        }

        let head = read_exact(&mut stream, 4);
        assert_eq!(&head[..3], [0x05, 0x01, 0x00]);
        assert_eq!(head[3], 0x03, "expected a domain address");
        let len = read_exact(&mut stream, 1)[0] as usize;
        let domain = String::from_utf8(read_exact(&mut stream, len)).unwrap();
        let _port = read_exact(&mut stream, 2);
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();

        echo_once(&mut stream);
        domain
    });
    (port, handle)
}

#[test]
fn test_socks5_tunnel_anonymous() {
    let (port, server) = spawn_socks5(None);
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::socks5("127.0.0.1", port)))
            .unwrap();
        sock.connect("target.example", 7777).await.unwrap();

        sock.send_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = sock.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        sock.close();
    });
    // dns_tunnel sends the hostname through, unresolved.
    assert_eq!(server.join().unwrap(), "target.example");
}

#[test]
fn test_socks5_tunnel_with_auth() {
    let (port, server) = spawn_socks5(Some(("alice", "secret")));
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        let proxy = ProxyConfig::socks5("127.0.0.1", port).with_auth("alice", "secret");
        sock.set_proxy(Some(proxy)).unwrap();
        sock.connect("target.example", 443).await.unwrap();

        sock.send_all(b"hi").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sock.recv(&mut buf).await.unwrap(), 2);
        sock.close();
    });
    server.join().unwrap();
}

#[test]
fn test_socks5_method_rejection_closes_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_exact(&mut stream, 3);
        stream.write_all(&[0x05, 0xFF]).unwrap();
    });

    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::socks5("127.0.0.1", port)))
            .unwrap();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::ProxyHandshakeFailed);
        // A failed connect never leaves a half-open socket behind.
        assert!(sock.is_closed());
    });
    server.join().unwrap();
}

#[test]
fn test_socks5_bad_credentials() {
    let (port, server) = spawn_socks5(Some(("alice", "secret")));
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        let proxy = ProxyConfig::socks5("127.0.0.1", port).with_auth("alice", "wrong");
        sock.set_proxy(Some(proxy)).unwrap();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::ProxyAuthFailed);
        assert!(sock.is_closed());
    });
    server.join().unwrap();
}

#[test]
fn test_socks5_connect_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_exact(&mut stream, 3);
        stream.write_all(&[0x05, 0x00]).unwrap();
        let head = read_exact(&mut stream, 4);
        let len = read_exact(&mut stream, 1)[0] as usize;
        let _ = read_exact(&mut stream, len + 2);
        assert_eq!(head[1], 0x01);
        // REP 0x05: connection refused by the target.
        stream
            .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();
    });

    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::socks5("127.0.0.1", port)))
            .unwrap();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::TunnelConnectionFailed);
    });
    server.join().unwrap();
}

#[test]
fn test_stalled_handshake_hits_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Accept the connection but sit on the greeting.
        thread::sleep(Duration::from_millis(500));
        let mut buf = [0u8; 3];
        let _ = stream.read(&mut buf);
        let _ = stream.write_all(&[0x05, 0x00]);
    });

    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::socks5("127.0.0.1", port)))
            .unwrap();
        sock.set_connect_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::ConnectionTimedOut);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(sock.is_closed());
    });
    server.join().unwrap();
}

fn spawn_http_connect(status_line: &'static str, expect_auth: bool) -> (u16, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            request.push(byte[0]);
        }
        let request = String::from_utf8(request).unwrap();
        assert_eq!(
            request.contains("Proxy-Authorization: Basic "),
            expect_auth
        );
        stream
            .write_all(format!("{status_line}\r\n\r\n").as_bytes())
            .unwrap();
        if status_line.contains("200") {
            echo_once(&mut stream);
        }
        request
    });
    (port, handle)
}

#[test]
fn test_http_connect_tunnel() {
    let (port, server) = spawn_http_connect("HTTP/1.1 200 Connection established", false);
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::http("127.0.0.1", port)))
            .unwrap();
        sock.connect("target.example", 8443).await.unwrap();

        sock.send_all(b"through").await.unwrap();
        let mut buf = [0u8; 16];
        let n = sock.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through");
        sock.close();
    });
    let request = server.join().unwrap();
    assert!(request.starts_with("CONNECT target.example:8443 HTTP/1.1\r\n"));
}

#[test]
fn test_http_connect_with_auth_header() {
    let (port, server) = spawn_http_connect("HTTP/1.1 200 OK", true);
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        let proxy = ProxyConfig::http("127.0.0.1", port).with_auth("user", "pass");
        sock.set_proxy(Some(proxy)).unwrap();
        sock.connect("target.example", 80).await.unwrap();
        sock.send_all(b"x").await.unwrap();
        let mut buf = [0u8; 4];
        sock.recv(&mut buf).await.unwrap();
        sock.close();
    });
    let request = server.join().unwrap();
    assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

/// HTTP CONNECT proxy whose 200 response and the target's first bytes
/// arrive in a single write.
fn spawn_coalescing_http_connect(payload: &'static [u8]) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            request.push(byte[0]);
        }
        let mut response = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
        response.extend_from_slice(payload);
        stream.write_all(&response).unwrap();
    });
    (port, handle)
}

#[test]
fn test_http_connect_keeps_server_first_bytes() {
    let (port, server) = spawn_coalescing_http_connect(b"hello");
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::http("127.0.0.1", port)))
            .unwrap();
        sock.connect("target.example", 9000).await.unwrap();

        let mut buf = [0u8; 16];
        let n = sock
            .recv_timeout(&mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        sock.close();
    });
    server.join().unwrap();
}

#[test]
fn test_server_first_bytes_flow_into_packet_assembly() {
    let (port, server) = spawn_coalescing_http_connect(b"greeting\r\n");
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_framing(FramingConfig::eof(&b"\r\n"[..], true).unwrap());
        sock.set_proxy(Some(ProxyConfig::http("127.0.0.1", port)))
            .unwrap();
        sock.connect("target.example", 9000).await.unwrap();

        let frame = sock
            .recv_packet_timeout(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"greeting\r\n");
        sock.close();
    });
    server.join().unwrap();
}

#[test]
fn test_http_connect_rejection() {
    let (port, server) = spawn_http_connect("HTTP/1.1 407 Proxy Authentication Required", false);
    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        sock.set_proxy(Some(ProxyConfig::http("127.0.0.1", port)))
            .unwrap();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::TunnelConnectionFailed);
        assert!(sock.is_closed());
    });
    server.join().unwrap();
}

#[test]
fn test_ssl_proxy_is_rejected() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let sock = Socket::new(SocketKind::Tcp).unwrap();
        let proxy = ProxyConfig::HttpConnect {
            host: "proxy.example".into(),
            port: 443,
            username: None,
            password: None,
            ssl: true,
        };
        sock.set_proxy(Some(proxy)).unwrap();
        let err = sock.connect("target.example", 80).await.unwrap_err();
        assert_eq!(err, NetError::SslNotSupported);
    });
}

#[test]
fn test_proxy_on_datagram_socket_is_invalid() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let sock = Socket::new(SocketKind::Udp).unwrap();
        let err = sock
            .set_proxy(Some(ProxyConfig::socks5("127.0.0.1", 1080)))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidSetting(_)));
    });
}
