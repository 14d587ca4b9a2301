//! VMess AEAD outbound.
//!
//! Handshake: a 16-byte authenticated ID (AES-128 block over
//! `timestamp || random || crc32`), then the request header sealed with
//! AES-128-GCM under keys derived from the command key. Payload flows as
//! 2-byte length-prefixed AES-128-GCM chunks whose nonce is the chunk counter
//! followed by ten IV bytes. The response direction uses keys derived by
//! hashing the request body key/IV, and its first sealed chunk is the
//! response header (echoed verify byte), consumed lazily on first read.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit as AesKeyInit};
use aes::Aes128;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use shunt_transport::Dialer;

use super::addr::TargetAddr;
use super::{AdapterKind, OutboundAdapter, ProxyStream};
use crate::session::Metadata;

const CMD_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const LABEL_AUTH_ID: &[u8] = b"vmess auth id encryption";
const LABEL_HEADER_KEY: &[u8] = b"vmess header aead key";
const LABEL_HEADER_NONCE: &[u8] = b"vmess header aead nonce";

const CMD_TCP: u8 = 0x01;
const SECURITY_AES_128_GCM: u8 = 0x03;
const OPT_CHUNK_STREAM: u8 = 0x01;

/// Max plaintext per sealed chunk; the tag fits the 16 KiB frame.
const MAX_PLAIN: usize = 16 * 1024 - 16;

pub struct VmessConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: Uuid,
    /// Only "aes-128-gcm" is spoken.
    pub security: String,
}

pub struct VmessOutbound {
    config: VmessConfig,
    cmd_key: [u8; 16],
    dialer: Arc<dyn Dialer>,
}

impl VmessOutbound {
    pub fn new(config: VmessConfig, dialer: Arc<dyn Dialer>) -> io::Result<Self> {
        if config.security != "aes-128-gcm" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported vmess security: {}", config.security),
            ));
        }
        let mut hasher = Md5::new();
        hasher.update(config.uuid.as_bytes());
        hasher.update(CMD_KEY_SALT);
        let cmd_key: [u8; 16] = hasher.finalize().into();
        Ok(Self {
            config,
            cmd_key,
            dialer,
        })
    }
}

#[async_trait]
impl OutboundAdapter for VmessOutbound {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Vmess
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let target = TargetAddr::from_metadata(metadata)?;
        let mut stream = self
            .dialer
            .connect(&self.config.server, self.config.port)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let session = Session::random();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| io::Error::other(e.to_string()))?
            .as_secs();
        let request = seal_request(&self.cmd_key, &session, &target, now);
        stream.write_all(&request).await?;

        Ok(Box::new(VmessStream::new(stream, &session)))
    }
}

/// Per-connection key material.
struct Session {
    body_key: [u8; 16],
    body_iv: [u8; 16],
    verify: u8,
}

impl Session {
    fn random() -> Self {
        Self {
            body_key: rand::random(),
            body_iv: rand::random(),
            verify: rand::random(),
        }
    }
}

fn derive(key: &[u8], label: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac key");
    mac.update(label);
    mac.update(salt);
    mac.finalize().into_bytes().into()
}

fn derive16(key: &[u8], label: &[u8], salt: &[u8]) -> [u8; 16] {
    derive(key, label, salt)[..16].try_into().unwrap()
}

fn derive12(key: &[u8], label: &[u8], salt: &[u8]) -> [u8; 12] {
    derive(key, label, salt)[..12].try_into().unwrap()
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// `AES-128(kdf16(cmd_key), timestamp || random || crc32)`.
fn auth_id(cmd_key: &[u8; 16], now: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&now.to_be_bytes());
    let random: [u8; 4] = rand::random();
    block[8..12].copy_from_slice(&random);
    let crc = crc32fast::hash(&block[..12]);
    block[12..].copy_from_slice(&crc.to_be_bytes());

    let key = derive16(cmd_key, LABEL_AUTH_ID, &[]);
    let cipher = Aes128::new(GenericArray::from_slice(&key));
    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut ga);
    ga.into()
}

fn build_header(session: &Session, target: &TargetAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(96);
    header.push(1); // version
    header.extend_from_slice(&session.body_iv);
    header.extend_from_slice(&session.body_key);
    header.push(session.verify);
    header.push(OPT_CHUNK_STREAM);
    let padding_len = (rand::random::<u8>() % 16) as usize;
    header.push(((padding_len as u8) << 4) | SECURITY_AES_128_GCM);
    header.push(0); // reserved
    header.push(CMD_TCP);
    target.write_port_first(&mut header);
    for _ in 0..padding_len {
        header.push(rand::random());
    }
    header.extend_from_slice(&fnv1a32(&header).to_be_bytes());
    header
}

fn seal_request(cmd_key: &[u8; 16], session: &Session, target: &TargetAddr, now: u64) -> Vec<u8> {
    let aid = auth_id(cmd_key, now);
    let header = build_header(session, target);

    let key = derive16(cmd_key, LABEL_HEADER_KEY, &aid);
    let nonce = derive12(cmd_key, LABEL_HEADER_NONCE, &aid);
    let cipher = Aes128Gcm::new_from_slice(&key).expect("aead key");
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), header.as_slice())
        .expect("header seal");

    let mut out = Vec::with_capacity(16 + 2 + sealed.len());
    out.extend_from_slice(&aid);
    out.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    out.extend_from_slice(&sealed);
    out
}

/// One direction of the chunked AEAD stream.
struct DataCipher {
    cipher: Aes128Gcm,
    iv: [u8; 16],
    count: u16,
}

impl DataCipher {
    fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Gcm::new_from_slice(key).expect("aead key"),
            iv: *iv,
            count: 0,
        }
    }

    fn nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv[2..12]);
        self.count = self.count.wrapping_add(1);
        nonce
    }

    fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
        let nonce = self.nonce();
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .expect("chunk seal");
        let mut frame = Vec::with_capacity(2 + ct.len());
        frame.extend_from_slice(&(ct.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ct);
        frame
    }

    fn open(&mut self, ct: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ct)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "vmess chunk auth failed"))
    }
}

enum ReadState {
    Len { buf: [u8; 2], got: usize },
    Body { buf: Vec<u8>, got: usize },
}

struct VmessStream {
    inner: ProxyStream,
    write_cipher: DataCipher,
    read_cipher: DataCipher,
    verify: u8,
    got_response: bool,
    pending: Vec<u8>,
    pending_pos: usize,
    plain: Vec<u8>,
    plain_pos: usize,
    read_state: ReadState,
}

impl VmessStream {
    fn new(inner: ProxyStream, session: &Session) -> Self {
        let resp_key: [u8; 16] = Sha256::digest(session.body_key)[..16].try_into().unwrap();
        let resp_iv: [u8; 16] = Sha256::digest(session.body_iv)[..16].try_into().unwrap();
        Self {
            inner,
            write_cipher: DataCipher::new(&session.body_key, &session.body_iv),
            read_cipher: DataCipher::new(&resp_key, &resp_iv),
            verify: session.verify,
            got_response: false,
            pending: Vec::new(),
            pending_pos: 0,
            plain: Vec::new(),
            plain_pos: 0,
            read_state: ReadState::Len { buf: [0; 2], got: 0 },
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let chunk = &self.pending[self.pending_pos..];
            match Pin::new(&mut self.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.pending_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VmessStream {
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
        let n = buf.len().min(MAX_PLAIN);
        if n == 0 {
            return Poll::Ready(Ok(0));
        }
        me.pending = me.write_cipher.seal(&buf[..n]);
        me.pending_pos = 0;
        // opportunistic drain; leftovers go out on the next write or flush
        let _ = me.poll_drain(cx);
        Poll::Ready(Ok(n))
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

impl AsyncRead for VmessStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        loop {
            if me.plain_pos < me.plain.len() {
                let remaining = &me.plain[me.plain_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                me.plain_pos += n;
                if me.plain_pos >= me.plain.len() {
                    me.plain.clear();
                    me.plain_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut me.read_state {
                ReadState::Len { buf: len_buf, got } => {
                    let mut tmp = ReadBuf::new(&mut len_buf[*got..]);
                    match Pin::new(&mut me.inner).poll_read(cx, &mut tmp) {
                        Poll::Ready(Ok(())) => {
                            let n = tmp.filled().len();
                            if n == 0 {
                                return if *got == 0 {
                                    Poll::Ready(Ok(())) // clean EOF between chunks
                                } else {
                                    Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                                };
                            }
                            *got += n;
                            if *got == 2 {
                                let len = u16::from_be_bytes(*len_buf) as usize;
                                if len < 16 {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "vmess chunk too short",
                                    )));
                                }
                                me.read_state = ReadState::Body {
                                    buf: vec![0u8; len],
                                    got: 0,
                                };
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Body { buf: body, got } => {
                    let mut tmp = ReadBuf::new(&mut body[*got..]);
                    match Pin::new(&mut me.inner).poll_read(cx, &mut tmp) {
                        Poll::Ready(Ok(())) => {
                            let n = tmp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *got += n;
                            if *got == body.len() {
                                let ct = std::mem::take(body);
                                me.read_state = ReadState::Len { buf: [0; 2], got: 0 };
                                let plain = me.read_cipher.open(&ct)?;
                                if !me.got_response {
                                    // first sealed chunk is the response header
                                    if plain.first() != Some(&me.verify) {
                                        return Poll::Ready(Err(io::Error::new(
                                            io::ErrorKind::InvalidData,
                                            "vmess response verify mismatch",
                                        )));
                                    }
                                    me.got_response = true;
                                    continue;
                                }
                                me.plain = plain;
                                me.plain_pos = 0;
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn auth_id_is_one_block() {
        let key = [7u8; 16];
        let a = auth_id(&key, 1_700_000_000);
        let b = auth_id(&key, 1_700_000_000);
        // random tail differs, size stays one AES block
        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn header_carries_fnv_checksum() {
        let session = Session {
            body_key: [1; 16],
            body_iv: [2; 16],
            verify: 0x5a,
        };
        let target = TargetAddr::Domain("example.com".into(), 443);
        let header = build_header(&session, &target);
        let body = &header[..header.len() - 4];
        let sum = u32::from_be_bytes(header[header.len() - 4..].try_into().unwrap());
        assert_eq!(sum, fnv1a32(body));
        assert_eq!(header[0], 1);
    }

    #[test]
    fn data_cipher_round_trips_with_counter() {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let mut seal = DataCipher::new(&key, &iv);
        let mut open = DataCipher::new(&key, &iv);
        for msg in [&b"first"[..], &b"second chunk"[..]] {
            let frame = seal.seal(msg);
            let len = u16::from_be_bytes(frame[..2].try_into().unwrap()) as usize;
            assert_eq!(len, frame.len() - 2);
            let plain = open.open(&frame[2..]).unwrap();
            assert_eq!(plain, msg);
        }
    }

    #[test]
    fn tampered_chunk_fails_auth() {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let mut seal = DataCipher::new(&key, &iv);
        let mut open = DataCipher::new(&key, &iv);
        let mut frame = seal.seal(b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(open.open(&frame[2..]).is_err());
    }

    #[tokio::test]
    async fn stream_reads_response_then_payload() {
        let session = Session {
            body_key: [9; 16],
            body_iv: [8; 16],
            verify: 0x42,
        };
        let (near, far) = tokio::io::duplex(1 << 16);
        let mut stream = VmessStream::new(Box::new(near), &session);

        // server side: seal with the response-direction keys
        let resp_key: [u8; 16] = Sha256::digest(session.body_key)[..16].try_into().unwrap();
        let resp_iv: [u8; 16] = Sha256::digest(session.body_iv)[..16].try_into().unwrap();
        let mut server = DataCipher::new(&resp_key, &resp_iv);
        let (mut fr, mut fw) = tokio::io::split(far);
        fw.write_all(&server.seal(&[0x42, 0x00])).await.unwrap();
        fw.write_all(&server.seal(b"reply data")).await.unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply data");

        // client upload is sealed with the request-direction keys
        stream.write_all(b"up").await.unwrap();
        stream.flush().await.unwrap();
        let mut len = [0u8; 2];
        fr.read_exact(&mut len).await.unwrap();
        let mut ct = vec![0u8; u16::from_be_bytes(len) as usize];
        fr.read_exact(&mut ct).await.unwrap();
        let mut open = DataCipher::new(&session.body_key, &session.body_iv);
        assert_eq!(open.open(&ct).unwrap(), b"up");
    }

    #[tokio::test]
    async fn wrong_verify_byte_errors() {
        let session = Session {
            body_key: [9; 16],
            body_iv: [8; 16],
            verify: 0x42,
        };
        let (near, far) = tokio::io::duplex(4096);
        let mut stream = VmessStream::new(Box::new(near), &session);
        let resp_key: [u8; 16] = Sha256::digest(session.body_key)[..16].try_into().unwrap();
        let resp_iv: [u8; 16] = Sha256::digest(session.body_iv)[..16].try_into().unwrap();
        let mut server = DataCipher::new(&resp_key, &resp_iv);
        let (_fr, mut fw) = tokio::io::split(far);
        fw.write_all(&server.seal(&[0x41, 0x00])).await.unwrap();
        let mut buf = [0u8; 1];
        assert!(stream.read_exact(&mut buf).await.is_err());
    }
}
