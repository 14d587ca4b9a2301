//! ShadowsocksR outbound.
//!
//! Wire layering, outermost first: obfs(cipher(protocol(plaintext))). The
//! cipher prefixes its IV to the first outgoing data and expects the server
//! IV ahead of the first reply. Supported pieces: stream ciphers
//! `aes-128-ctr` / `aes-192-ctr` / `aes-256-ctr` / `chacha20-ietf` / `dummy`,
//! protocol `origin`, obfs `plain` and `http_simple`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use shunt_transport::Dialer;

use super::addr::TargetAddr;
use super::{AdapterKind, OutboundAdapter, ProxyStream};
use crate::session::Metadata;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const MAX_OBFS_RESPONSE: usize = 8 * 1024;

pub struct SsrConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub cipher: String,
    pub protocol: String,
    pub obfs: String,
    pub obfs_param: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Chacha20Ietf,
    Dummy,
}

impl CipherKind {
    fn parse(name: &str) -> io::Result<Self> {
        match name {
            "aes-128-ctr" => Ok(CipherKind::Aes128Ctr),
            "aes-192-ctr" => Ok(CipherKind::Aes192Ctr),
            "aes-256-ctr" => Ok(CipherKind::Aes256Ctr),
            "chacha20-ietf" => Ok(CipherKind::Chacha20Ietf),
            "dummy" => Ok(CipherKind::Dummy),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported ssr cipher: {other}"),
            )),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Ctr => 16,
            CipherKind::Aes192Ctr => 24,
            CipherKind::Aes256Ctr | CipherKind::Chacha20Ietf => 32,
            CipherKind::Dummy => 16,
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            CipherKind::Aes128Ctr | CipherKind::Aes192Ctr | CipherKind::Aes256Ctr => 16,
            CipherKind::Chacha20Ietf => 12,
            CipherKind::Dummy => 0,
        }
    }
}

enum StreamCipherState {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
    Chacha20(chacha20::ChaCha20),
    Dummy,
}

impl StreamCipherState {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Self {
        match kind {
            CipherKind::Aes128Ctr => StreamCipherState::Aes128(Aes128Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherKind::Aes192Ctr => StreamCipherState::Aes192(Aes192Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherKind::Aes256Ctr => StreamCipherState::Aes256(Aes256Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherKind::Chacha20Ietf => StreamCipherState::Chacha20(chacha20::ChaCha20::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherKind::Dummy => StreamCipherState::Dummy,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamCipherState::Aes128(c) => c.apply_keystream(data),
            StreamCipherState::Aes192(c) => c.apply_keystream(data),
            StreamCipherState::Aes256(c) => c.apply_keystream(data),
            StreamCipherState::Chacha20(c) => c.apply_keystream(data),
            StreamCipherState::Dummy => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObfsKind {
    Plain,
    HttpSimple,
}

impl ObfsKind {
    fn parse(name: &str) -> io::Result<Self> {
        match name {
            "plain" | "" => Ok(ObfsKind::Plain),
            "http_simple" => Ok(ObfsKind::HttpSimple),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported ssr obfs: {other}"),
            )),
        }
    }
}

/// OpenSSL EVP_BytesToKey with MD5, the classic shadowsocks key schedule.
fn bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(key_len + 15);
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password.as_bytes());
        prev = h.finalize().to_vec();
        out.extend_from_slice(&prev);
    }
    out.truncate(key_len);
    out
}

pub struct SsrOutbound {
    config: SsrConfig,
    cipher: CipherKind,
    obfs: ObfsKind,
    key: Vec<u8>,
    dialer: Arc<dyn Dialer>,
}

impl SsrOutbound {
    pub fn new(config: SsrConfig, dialer: Arc<dyn Dialer>) -> io::Result<Self> {
        let cipher = CipherKind::parse(&config.cipher)?;
        let obfs = ObfsKind::parse(&config.obfs)?;
        if !matches!(config.protocol.as_str(), "origin" | "") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported ssr protocol: {}", config.protocol),
            ));
        }
        let key = bytes_to_key(&config.password, cipher.key_len());
        Ok(Self {
            config,
            cipher,
            obfs,
            key,
            dialer,
        })
    }

    fn obfs_host(&self) -> String {
        self.config
            .obfs_param
            .clone()
            .unwrap_or_else(|| self.config.server.clone())
    }
}

#[async_trait]
impl OutboundAdapter for SsrOutbound {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::ShadowsocksR
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let target = TargetAddr::from_metadata(metadata)?;
        let inner = self
            .dialer
            .connect(&self.config.server, self.config.port)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let mut iv = vec![0u8; self.cipher.iv_len()];
        rand::Rng::fill(&mut rand::thread_rng(), iv.as_mut_slice());

        let mut stream = SsrStream {
            inner,
            kind: self.cipher,
            key: self.key.clone(),
            write_cipher: StreamCipherState::new(self.cipher, &self.key, &iv),
            write_iv: Some(iv),
            read_cipher: None,
            obfs: self.obfs,
            obfs_host: self.obfs_host(),
            obfs_port: self.config.port,
            obfs_sent: false,
            response_stripped: self.obfs == ObfsKind::Plain,
            scan: Vec::new(),
            carry: Vec::new(),
            pending: Vec::new(),
            pending_pos: 0,
        };

        // target address leads the plaintext stream
        let mut head = Vec::with_capacity(32);
        target.write_socks(&mut head);
        stream.write_all(&head).await?;

        Ok(Box::new(stream))
    }
}

struct SsrStream {
    inner: ProxyStream,
    kind: CipherKind,
    key: Vec<u8>,
    write_cipher: StreamCipherState,
    /// IV still owed to the wire; sent with the first data.
    write_iv: Option<Vec<u8>>,
    read_cipher: Option<StreamCipherState>,
    obfs: ObfsKind,
    obfs_host: String,
    obfs_port: u16,
    obfs_sent: bool,
    response_stripped: bool,
    /// Bytes scanned while looking for the end of the obfs response.
    scan: Vec<u8>,
    /// Raw wire bytes already consumed from the socket but not yet served.
    carry: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl SsrStream {
    fn http_wrap(&self, payload: &[u8]) -> Vec<u8> {
        let head_len = payload
            .len()
            .min(30 + (rand::random::<u8>() % 34) as usize);
        let (head, rest) = payload.split_at(head_len);
        let mut path = String::with_capacity(head_len * 3 + 1);
        path.push('/');
        for b in head {
            path.push_str(&format!("%{:02x}", b));
        }
        let host = if self.obfs_port == 80 {
            self.obfs_host.clone()
        } else {
            format!("{}:{}", self.obfs_host, self.obfs_port)
        };
        let mut out = format!(
            "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: curl/7.35.0\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n"
        )
        .into_bytes();
        out.extend_from_slice(rest);
        out
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let chunk = &self.pending[self.pending_pos..];
            match Pin::new(&mut self.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => self.pending_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Feeds raw wire bytes through IV parsing, returning decrypted bytes.
    fn ingest(&mut self, data: &mut Vec<u8>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        if self.read_cipher.is_none() {
            let need = self.kind.iv_len();
            self.carry.extend_from_slice(data);
            data.clear();
            if self.carry.len() < need {
                return Ok(out);
            }
            let iv: Vec<u8> = self.carry.drain(..need).collect();
            self.read_cipher = Some(StreamCipherState::new(self.kind, &self.key, &iv));
            let mut rest: Vec<u8> = std::mem::take(&mut self.carry);
            if let Some(c) = &mut self.read_cipher {
                c.apply(&mut rest);
            }
            out = rest;
            return Ok(out);
        }
        if let Some(c) = &mut self.read_cipher {
            c.apply(data.as_mut_slice());
        }
        out.append(data);
        Ok(out)
    }
}

impl AsyncWrite for SsrStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut cipher_text = buf.to_vec();
        me.write_cipher.apply(&mut cipher_text);
        let mut wire = match me.write_iv.take() {
            Some(mut iv) => {
                iv.extend_from_slice(&cipher_text);
                iv
            }
            None => cipher_text,
        };
        if me.obfs == ObfsKind::HttpSimple && !me.obfs_sent {
            wire = me.http_wrap(&wire);
            me.obfs_sent = true;
        }
        me.pending = wire;
        me.pending_pos = 0;
        let _ = me.poll_drain(cx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut me.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut me.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

impl AsyncRead for SsrStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        loop {
            // serve decrypted leftovers first
            if me.response_stripped && !me.carry.is_empty() && me.read_cipher.is_some() {
                let n = me.carry.len().min(buf.remaining());
                let chunk: Vec<u8> = me.carry.drain(..n).collect();
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut me.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let mut chunk = tmp_buf.filled().to_vec();
                    if chunk.is_empty() {
                        return Poll::Ready(Ok(())); // EOF
                    }

                    if !me.response_stripped {
                        me.scan.extend_from_slice(&chunk);
                        if let Some(pos) = find_header_end(&me.scan) {
                            let leftover = me.scan.split_off(pos + 4);
                            me.scan.clear();
                            me.response_stripped = true;
                            chunk = leftover;
                            if chunk.is_empty() {
                                continue;
                            }
                        } else if me.scan.len() > MAX_OBFS_RESPONSE {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "obfs response header too large",
                            )));
                        } else {
                            continue;
                        }
                    }

                    let plain = me.ingest(&mut chunk)?;
                    if plain.is_empty() {
                        continue; // still collecting the server IV
                    }
                    let n = plain.len().min(buf.remaining());
                    buf.put_slice(&plain[..n]);
                    if n < plain.len() {
                        // decrypted bytes beyond the caller's buffer wait here
                        me.carry = plain[n..].to_vec();
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}
