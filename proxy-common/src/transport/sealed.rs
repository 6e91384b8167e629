//! KCP 之上的加密层
//!
//! 密钥由共享口令经 PBKDF2-HMAC-SHA1 派生。每个方向先发送 16 字节随机 IV，
//! 之后的字节按 AES-256-CTR 加密，所以握手里的密钥不会以明文出现在 UDP 包里。

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes256;
use ctr::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use rand::Rng;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const SALT: &[u8] = b"opensocks@2022";
const ROUNDS: u32 = 1024;
const IV_LEN: usize = 16;

pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(secret.as_bytes(), SALT, ROUNDS, &mut key);
    key
}

fn stream_cipher(key: &[u8; 32], iv: &[u8; IV_LEN]) -> Aes256Ctr {
    Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

pub struct SealedStream<S> {
    inner: S,
    key: [u8; 32],
    // 收到对端 IV 之前为 None
    decrypt: Option<Aes256Ctr>,
    peer_iv: [u8; IV_LEN],
    iv_read: usize,
    encrypt: Aes256Ctr,
    // 已加密、尚未写入底层连接的字节，开头是本端 IV
    pending: Vec<u8>,
    flushed: usize,
}

impl<S> SealedStream<S> {
    pub fn new(inner: S, key: [u8; 32]) -> Self {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill(&mut iv);
        Self {
            inner,
            key,
            decrypt: None,
            peer_iv: [0u8; IV_LEN],
            iv_read: 0,
            encrypt: stream_cipher(&key, &iv),
            pending: iv.to_vec(),
            flushed: 0,
        }
    }
}

impl<S: AsyncWrite + Unpin> SealedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.flushed < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.flushed..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.flushed += n;
        }
        self.pending.clear();
        self.flushed = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SealedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.decrypt.is_none() {
            let mut iv_buf = ReadBuf::new(&mut this.peer_iv[this.iv_read..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf))?;
            let n = iv_buf.filled().len();
            if n == 0 {
                if this.iv_read == 0 {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated iv")));
            }
            this.iv_read += n;
            if this.iv_read == IV_LEN {
                this.decrypt = Some(stream_cipher(&this.key, &this.peer_iv));
            }
        }

        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decrypt) = this.decrypt.as_mut() {
            decrypt.apply_keystream(&mut buf.filled_mut()[start..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SealedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        // 密钥流已经前进，这些字节必须全部写出，剩下的留给下一次 poll
        this.pending.extend_from_slice(buf);
        this.encrypt.apply_keystream(&mut this.pending);
        let _ = this.poll_drain(cx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_key_derivation_is_stable() {
        assert_eq!(derive_key("secret"), derive_key("secret"));
        assert_ne!(derive_key("secret"), derive_key("other"));
    }

    #[tokio::test]
    async fn test_sealed_round_trip() {
        let key = derive_key("secret");
        let (a, b) = duplex(4096);
        let mut a = SealedStream::new(a, key);
        let mut b = SealedStream::new(b, key);

        a.write_all(b"first").await.unwrap();
        a.write_all(b" second").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = [0u8; 12];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first second");

        b.write_all(b"reply").await.unwrap();
        b.flush().await.unwrap();
        let mut buf = [0u8; 5];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_wire_carries_iv_and_ciphertext() {
        let (a, mut wire) = duplex(4096);
        let mut a = SealedStream::new(a, derive_key("secret"));
        a.write_all(b"{\"Key\":\"secret\"}").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let mut raw = Vec::new();
        wire.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len(), IV_LEN + 16);
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage() {
        let (a, b) = duplex(4096);
        let mut a = SealedStream::new(a, derive_key("secret"));
        let mut b = SealedStream::new(b, derive_key("guess"));
        a.write_all(b"plain text").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = [0u8; 10];
        b.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"plain text");
    }

    #[tokio::test]
    async fn test_clean_eof_before_iv() {
        let (a, b) = duplex(64);
        drop(a);
        let mut b = SealedStream::new(b, derive_key("secret"));
        let mut rest = Vec::new();
        assert_eq!(b.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
