//! SOCKS5 outbound (CONNECT only).

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use shunt_transport::Dialer;

use super::addr::{TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use super::{AdapterKind, OutboundAdapter, ProxyStream};
use crate::session::Metadata;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;

pub struct Socks5Config {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct Socks5Outbound {
    config: Socks5Config,
    dialer: Arc<dyn Dialer>,
}

impl Socks5Outbound {
    pub fn new(config: Socks5Config, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    fn offered_method(&self) -> u8 {
        if self.config.username.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NONE
        }
    }

    async fn handshake<S>(&self, stream: &mut S, target: &TargetAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&[VERSION, 1, self.offered_method()]).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "socks version mismatch",
            ));
        }
        match choice[1] {
            METHOD_NONE => {}
            METHOD_USER_PASS => {
                let user = self.config.username.clone().unwrap_or_default();
                let pass = self.config.password.clone().unwrap_or_default();
                let mut auth = vec![0x01, user.len() as u8];
                auth.extend_from_slice(user.as_bytes());
                auth.push(pass.len() as u8);
                auth.extend_from_slice(pass.as_bytes());
                stream.write_all(&auth).await?;
                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0 {
                    return Err(io::Error::other("socks auth rejected"));
                }
            }
            _ => {
                return Err(io::Error::other("no acceptable socks auth method"));
            }
        }

        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        target.write_socks(&mut request);
        stream.write_all(&request).await?;

        read_connect_reply(stream).await
    }
}

/// Consumes the CONNECT reply, draining the bound address.
async fn read_connect_reply<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<()> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(io::Error::other(format!(
            "socks connect refused: code {}",
            head[1]
        )));
    }
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad bound address type",
            ))
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[async_trait]
impl OutboundAdapter for Socks5Outbound {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Socks5
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let target = TargetAddr::from_metadata(metadata)?;
        let mut stream = self
            .dialer
            .connect(&self.config.server, self.config.port)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.handshake(&mut stream, &target).await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn outbound(user: Option<(&str, &str)>) -> Socks5Outbound {
        Socks5Outbound::new(
            Socks5Config {
                name: "s5".into(),
                server: "proxy".into(),
                port: 1080,
                username: user.map(|(u, _)| u.to_string()),
                password: user.map(|(_, p)| p.to_string()),
            },
            Arc::new(shunt_transport::TcpDialer),
        )
    }

    #[test]
    fn offered_method_follows_credentials() {
        assert_eq!(outbound(None).offered_method(), METHOD_NONE);
        assert_eq!(outbound(Some(("u", "p"))).offered_method(), METHOD_USER_PASS);
    }

    #[tokio::test]
    async fn no_auth_connect_with_v4_bound_address() {
        let ob = outbound(None);
        let (mut near, far) = tokio::io::duplex(512);
        let (mut fr, mut fw) = tokio::io::split(far);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            fr.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 1, METHOD_NONE]);
            fw.write_all(&[VERSION, METHOD_NONE]).await.unwrap();

            let mut request = [0u8; 4 + 1 + 11 + 2];
            fr.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
            assert_eq!(request[4] as usize, 11);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &[0x01, 0xbb]);

            fw.write_all(&[VERSION, 0, 0, ATYP_IPV4, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
        });

        let target = TargetAddr::Domain("example.com".into(), 443);
        ob.handshake(&mut near, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn user_pass_negotiation_and_domain_bound_address() {
        let ob = outbound(Some(("user", "pass")));
        let (mut near, far) = tokio::io::duplex(512);
        let (mut fr, mut fw) = tokio::io::split(far);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            fr.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 1, METHOD_USER_PASS]);
            fw.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();

            let mut auth = [0u8; 2 + 4 + 1 + 4];
            fr.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[..2], &[0x01, 4]);
            assert_eq!(&auth[2..6], b"user");
            assert_eq!(auth[6], 4);
            assert_eq!(&auth[7..], b"pass");
            fw.write_all(&[0x01, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            fr.read_exact(&mut head).await.unwrap();
            let mut rest = [0u8; 4 + 2];
            fr.read_exact(&mut rest).await.unwrap(); // v4 target + port

            fw.write_all(&[VERSION, 0, 0, ATYP_DOMAIN, 5]).await.unwrap();
            fw.write_all(b"proxy").await.unwrap();
            fw.write_all(&[0x04, 0x38]).await.unwrap();
        });

        let target = TargetAddr::Ip("10.0.0.9:80".parse().unwrap());
        ob.handshake(&mut near, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn v6_bound_address_is_drained() {
        let ob = outbound(None);
        let (mut near, far) = tokio::io::duplex(512);
        let (mut fr, mut fw) = tokio::io::split(far);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            fr.read_exact(&mut greeting).await.unwrap();
            fw.write_all(&[VERSION, METHOD_NONE]).await.unwrap();
            let mut request = [0u8; 4 + 4 + 2];
            fr.read_exact(&mut request).await.unwrap();

            let mut reply = vec![VERSION, 0, 0, ATYP_IPV6];
            reply.extend_from_slice(&[0u8; 16]);
            reply.extend_from_slice(&[0x00, 0x50]);
            fw.write_all(&reply).await.unwrap();
        });

        let target = TargetAddr::Ip("10.0.0.9:80".parse().unwrap());
        ob.handshake(&mut near, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_code_errors() {
        let ob = outbound(None);
        let (mut near, far) = tokio::io::duplex(512);
        let (mut fr, mut fw) = tokio::io::split(far);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            fr.read_exact(&mut greeting).await.unwrap();
            fw.write_all(&[VERSION, METHOD_NONE]).await.unwrap();
            let mut request = [0u8; 4 + 4 + 2];
            fr.read_exact(&mut request).await.unwrap();
            // 0x05 = connection refused
            fw.write_all(&[VERSION, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = TargetAddr::Ip("10.0.0.9:80".parse().unwrap());
        assert!(ob.handshake(&mut near, &target).await.is_err());
    }

    #[tokio::test]
    async fn rejected_credentials_error() {
        let ob = outbound(Some(("user", "wrong")));
        let (mut near, far) = tokio::io::duplex(512);
        let (mut fr, mut fw) = tokio::io::split(far);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            fr.read_exact(&mut greeting).await.unwrap();
            fw.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();
            let mut auth = [0u8; 2 + 4 + 1 + 5];
            fr.read_exact(&mut auth).await.unwrap();
            fw.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let target = TargetAddr::Ip("10.0.0.9:80".parse().unwrap());
        assert!(ob.handshake(&mut near, &target).await.is_err());
    }
}
