//! End-to-end engine tests: inbound shim -> tunnel -> outbound, over real
//! sockets on loopback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use shunt_core::dns::SystemResolver;
use shunt_core::inbound::{self, socks};
use shunt_core::route::{Behavior, MatchContext, Rule, RuleProvider, Vehicle};
use shunt_core::session::{InboundKind, Metadata, Network};
use shunt_core::{Tunnel, TunnelConfig};

async fn echo_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn echo_udp_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

fn default_tunnel(cfg: TunnelConfig) -> Tunnel {
    Tunnel::new(cfg, Arc::new(SystemResolver), None, None)
}

async fn socks_inbound(tunnel: &Tunnel) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tunnel = tunnel.clone();
    tokio::spawn(async move {
        let _ = socks::serve(listener, tunnel, None).await;
    });
    addr
}

#[tokio::test]
async fn socks5_connect_relays_through_direct() {
    let echo = echo_tcp_server().await;
    let tunnel = default_tunnel(TunnelConfig::default());
    let proxy_addr = socks_inbound(&tunnel).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0, "connect must be granted");

    client.write_all(b"ping over socks5").await.unwrap();
    let mut buf = [0u8; 16];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping over socks5");

    // the manager sees the live connection with its chain and counters
    let snapshots = tunnel.manager().snapshot();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].chain, vec!["DIRECT".to_string()]);
    assert_eq!(snapshots[0].upload, 16);
    assert_eq!(snapshots[0].download, 16);

    tunnel.stop();
}

#[tokio::test]
async fn socks4_client_server_round_trip() {
    let echo = echo_tcp_server().await;
    let tunnel = default_tunnel(TunnelConfig::default());
    let proxy_addr = socks_inbound(&tunnel).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks::client_handshake4(&mut client, "127.0.0.1", echo.port(), "tester")
        .await
        .unwrap();

    client.write_all(b"socks4 payload").await.unwrap();
    let mut buf = [0u8; 14];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"socks4 payload");

    tunnel.stop();
}

#[tokio::test]
async fn socks4_bind_aborts_without_reply() {
    let tunnel = default_tunnel(TunnelConfig::default());
    let proxy_addr = socks_inbound(&tunnel).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    // BIND (0x02) is not served
    let mut req = vec![4u8, 2, 0x1f, 0x90, 127, 0, 0, 1];
    req.extend_from_slice(b"user\0");
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 8];
    match client.read(&mut reply).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected silent close, got a {n}-byte reply"),
    }

    tunnel.stop();
}

#[tokio::test]
async fn socks5_udp_associate_round_trip() {
    let echo = echo_udp_server().await;
    let tunnel = default_tunnel(TunnelConfig::default());
    let proxy_addr = socks_inbound(&tunnel).await;

    // control connection negotiates the association
    let mut control = TcpStream::connect(proxy_addr).await.unwrap();
    control.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    control.read_exact(&mut choice).await.unwrap();
    control
        .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    control.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);
    assert_eq!(reply[3], 1);
    let relay_ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
    let relay_addr = SocketAddr::new(relay_ip.into(), relay_port);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0, 0, 0, 1, 127, 0, 0, 1];
    datagram.extend_from_slice(&echo.port().to_be_bytes());
    datagram.extend_from_slice(b"udp ping");
    client.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("udp reply timed out")
        .unwrap();
    // reply: RSV RSV FRAG ATYP(1) IP(4) PORT(2) payload
    assert!(n > 10);
    assert_eq!(&buf[..4], &[0, 0, 0, 1]);
    assert_eq!(&buf[10..n], b"udp ping");

    assert_eq!(tunnel.nat().len(), 1);
    tunnel.stop();
}

#[tokio::test]
async fn nat_entries_expire_after_idle() {
    let echo = echo_udp_server().await;
    let cfg = TunnelConfig {
        udp_session_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let tunnel = default_tunnel(cfg);
    let proxy_addr = socks_inbound(&tunnel).await;

    let mut control = TcpStream::connect(proxy_addr).await.unwrap();
    control.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    control.read_exact(&mut choice).await.unwrap();
    control
        .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    control.read_exact(&mut reply).await.unwrap();
    let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
    let relay_addr: SocketAddr = format!("127.0.0.1:{relay_port}").parse().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0, 0, 0, 1, 127, 0, 0, 1];
    datagram.extend_from_slice(&echo.port().to_be_bytes());
    datagram.extend_from_slice(b"x");
    client.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 256];
    let _ = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("udp reply timed out")
        .unwrap();
    assert_eq!(tunnel.nat().len(), 1);

    // the sweeper runs at second granularity
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(tunnel.nat().len(), 0, "idle entry must be evicted");

    tunnel.stop();
}

#[tokio::test]
async fn rule_set_rules_delegate_to_providers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streaming.yaml");
    tokio::fs::write(&path, "payload:\n  - '+.netflix.com'\n")
        .await
        .unwrap();
    let provider = RuleProvider::new("streaming", Behavior::Domain, None, Vehicle::File { path });
    provider.initial().await.unwrap();

    let mut providers = HashMap::new();
    providers.insert("streaming".to_string(), provider);
    let ctx = MatchContext::with_providers(&providers);

    let rule = Rule::parse("RULE-SET,streaming,PROXY").unwrap();
    let mut m = Metadata::new(Network::Tcp, InboundKind::Socks5);
    m.host = "api.netflix.com".into();
    m.dst_port = 443;
    assert!(rule.matches(&m, &ctx));
    assert!(!rule.should_resolve_ip(&ctx));

    m.host = "example.com".into();
    assert!(!rule.matches(&m, &ctx));

    // unknown provider never matches
    let orphan = Rule::parse("RULE-SET,missing,PROXY").unwrap();
    assert!(!orphan.matches(&m, &ctx));
}

#[tokio::test]
async fn http_connect_inbound_relays() {
    let echo = echo_tcp_server().await;
    let tunnel = default_tunnel(TunnelConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            let _ = inbound::http::serve(listener, tunnel, None).await;
        });
    }

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        echo.port(),
        echo.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&head);
    assert!(head_text.starts_with("HTTP/1.1 200"), "got: {head_text}");

    client.write_all(b"via http connect").await.unwrap();
    let mut buf = [0u8; 16];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via http connect");

    tunnel.stop();
}
