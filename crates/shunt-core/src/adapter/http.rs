//! HTTP CONNECT outbound.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use shunt_transport::Dialer;

use super::addr::TargetAddr;
use super::{AdapterKind, OutboundAdapter, ProxyStream};
use crate::session::Metadata;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

pub struct HttpConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct HttpOutbound {
    config: HttpConfig,
    dialer: Arc<dyn Dialer>,
}

impl HttpOutbound {
    pub fn new(config: HttpConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    fn proxy_authorization(&self) -> Option<String> {
        let user = self.config.username.as_deref()?;
        let pass = self.config.password.as_deref().unwrap_or("");
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        Some(format!("Basic {token}"))
    }
}

#[async_trait]
impl OutboundAdapter for HttpOutbound {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Http
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let target = TargetAddr::from_metadata(metadata)?;
        let mut stream = self
            .dialer
            .connect(&self.config.server, self.config.port)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let host_port = match &target {
            TargetAddr::Ip(addr) => addr.to_string(),
            TargetAddr::Domain(host, port) => format!("{host}:{port}"),
        };
        let mut request = format!("CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\n");
        if let Some(auth) = self.proxy_authorization() {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // responses are tiny; read byte-wise until the blank line
        let mut head = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > MAX_RESPONSE_HEAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "proxy response too large",
                ));
            }
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            head.push(byte[0]);
        }

        let status = head
            .split(|&b| b == b' ')
            .nth(1)
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        if status != 200 {
            return Err(io::Error::other(format!(
                "proxy refused CONNECT: status {status}"
            )));
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header() {
        let ob = HttpOutbound::new(
            HttpConfig {
                name: "h".into(),
                server: "proxy".into(),
                port: 8080,
                username: Some("user".into()),
                password: Some("pass".into()),
            },
            Arc::new(shunt_transport::TcpDialer),
        );
        assert_eq!(
            ob.proxy_authorization().as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn no_auth_without_username() {
        let ob = HttpOutbound::new(
            HttpConfig {
                name: "h".into(),
                server: "proxy".into(),
                port: 8080,
                username: None,
                password: None,
            },
            Arc::new(shunt_transport::TcpDialer),
        );
        assert!(ob.proxy_authorization().is_none());
    }
}
