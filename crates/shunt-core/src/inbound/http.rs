//! HTTP proxy inbound: CONNECT tunnels and absolute-form plain requests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{Authenticator, PrefixedStream};
use crate::session::{InboundKind, Metadata, Network};
use crate::tunnel::{ConnContext, Tunnel};

const MAX_HEAD: usize = 16 * 1024;

pub async fn serve(
    listener: TcpListener,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let tunnel = tunnel.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, peer, tunnel, auth).await {
                debug!(peer = %peer, error = %e, "http inbound closed");
            }
        });
    }
}

pub(crate) async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    let (head, leftover) = read_head(&mut stream).await?;
    let request = parse_head(&head)?;

    if let Some(auth) = &auth {
        if !check_proxy_auth(&request, auth) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"shunt\"\r\n\
                      Connection: close\r\n\r\n",
                )
                .await?;
            return Err(io::Error::other("proxy auth required"));
        }
    }

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(&request.uri, 443)?;
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;

        let mut metadata = Metadata::new(Network::Tcp, InboundKind::HttpConnect);
        metadata.set_source(peer);
        apply_host(&mut metadata, &host, port);
        let client = PrefixedStream::new(leftover, Box::new(stream));
        return submit(&tunnel, client, metadata).await;
    }

    // absolute-form: rewrite to origin-form and replay toward the target
    let uri = request
        .uri
        .strip_prefix("http://")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected absolute URI"))?;
    let (authority, path) = match uri.find('/') {
        Some(idx) => (&uri[..idx], &uri[idx..]),
        None => (uri, "/"),
    };
    let (host, port) = split_host_port(authority, 80)?;

    let mut rebuilt = format!("{} {} {}\r\n", request.method, path, request.version).into_bytes();
    for (name, value) in &request.headers {
        // hop-by-hop proxy headers stop here
        if name.eq_ignore_ascii_case("proxy-authorization")
            || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        rebuilt.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    rebuilt.extend_from_slice(b"\r\n");
    rebuilt.extend_from_slice(&leftover);

    let mut metadata = Metadata::new(Network::Tcp, InboundKind::Http);
    metadata.set_source(peer);
    apply_host(&mut metadata, &host, port);
    let client = PrefixedStream::new(rebuilt, Box::new(stream));
    submit(&tunnel, client, metadata).await
}

struct Head {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
}

async fn read_head(stream: &mut TcpStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() > MAX_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            // byte-wise read never overshoots the head
            return Ok((buf, Vec::new()));
        }
    }
}

fn parse_head(raw: &[u8]) -> io::Result<Head> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 request head"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?;
    let uri = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing uri"))?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(Head {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
    })
}

fn check_proxy_auth(request: &Head, auth: &Authenticator) -> bool {
    let Some((_, value)) = request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("proxy-authorization"))
    else {
        return false;
    };
    let Some(token) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token.trim()) else {
        return false;
    };
    let decoded = String::from_utf8_lossy(&decoded);
    match decoded.split_once(':') {
        Some((user, pass)) => auth.verify(user, pass),
        None => false,
    }
}

fn split_host_port(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6
        let end = rest
            .find(']')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad authority"))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad port"))?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad port"))?,
        )),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn apply_host(metadata: &mut Metadata, host: &str, port: u16) {
    metadata.dst_port = port;
    match host.parse() {
        Ok(ip) => metadata.dst_ip = Some(ip),
        Err(_) => metadata.host = host.to_string(),
    }
}

async fn submit(tunnel: &Tunnel, client: PrefixedStream, metadata: Metadata) -> io::Result<()> {
    tunnel
        .tcp_in()
        .send(ConnContext::new(Box::new(client), metadata))
        .await
        .map_err(|_| io::Error::other("tcp queue closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect_head() {
        let head = parse_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.uri, "example.com:443");
        let (host, port) = split_host_port(&head.uri, 443).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn split_authority_variants() {
        assert_eq!(
            split_host_port("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            split_host_port("example.com:8080", 80).unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:443", 80).unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
        assert!(split_host_port("x:notaport", 80).is_err());
    }

    #[test]
    fn auth_header_round_trip() {
        let mut users = std::collections::HashMap::new();
        users.insert("user".to_string(), "pass".to_string());
        let auth = Authenticator::new(users);
        let head = Head {
            method: "GET".into(),
            uri: "http://x/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![(
                "Proxy-Authorization".into(),
                "Basic dXNlcjpwYXNz".into(),
            )],
        };
        assert!(check_proxy_auth(&head, &auth));
        let bad = Head {
            headers: vec![],
            ..head
        };
        assert!(!check_proxy_auth(&bad, &auth));
    }
}
