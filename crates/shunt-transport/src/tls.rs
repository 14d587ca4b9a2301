//! TLS transport layer over any inner dialer (`wss` is TLS below WebSocket).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::dialer::{DialError, Dialer, IoStream};

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// SNI override; the dialed host when absent.
    pub sni: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

pub struct TlsDialer {
    connector: TlsConnector,
    sni: Option<String>,
    inner: Arc<dyn Dialer>,
}

impl TlsDialer {
    pub fn new(config: TlsConfig, inner: Arc<dyn Dialer>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = config.alpn;
        Self {
            connector: TlsConnector::from(Arc::new(client)),
            sni: config.sni,
            inner,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        let stream = self.inner.connect(host, port).await?;
        let name = self.sni.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|e| DialError::Handshake(format!("bad server name: {e}")))?;
        let tls = self.connector.connect(server_name, stream).await?;
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TcpDialer;

    #[test]
    fn sni_defaults_to_dialed_host() {
        let dialer = TlsDialer::new(TlsConfig::default(), Arc::new(TcpDialer));
        assert!(dialer.sni.is_none());
        let dialer = TlsDialer::new(
            TlsConfig {
                sni: Some("cdn.example.com".into()),
                alpn: vec![b"http/1.1".to_vec()],
            },
            Arc::new(TcpDialer),
        );
        assert_eq!(dialer.sni.as_deref(), Some("cdn.example.com"));
    }
}
