//! 双向转发
//!
//! 每个方向一个任务，任一方向结束（EOF、读错误、空闲超时）时另一方向随之终止，两端连接一起关闭。
//! 本地 → 隧道：先混淆再压缩；隧道 → 本地：先解压再还原。

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::{Cipher, Keystream};
use crate::compress;
use crate::counter::ByteCounters;
use crate::error::Result;
use crate::frame;
use crate::pool::BufferPool;

#[derive(Clone)]
pub struct PipeOptions {
    pub cipher: Option<Cipher>,
    pub compress: bool,
    pub idle_timeout: Duration,
    pub counters: Arc<ByteCounters>,
    pub pool: Arc<BufferPool>,
}

/// 在本地连接和隧道流之间转发，直到任一方向结束
pub async fn relay<L, S>(local: L, stream: S, options: PipeOptions)
where
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local_reader, local_writer) = tokio::io::split(local);
    let (stream_reader, stream_writer) = tokio::io::split(stream);

    let mut upstream = tokio::spawn(outbound(local_reader, stream_writer, options.clone()));
    let mut downstream = tokio::spawn(inbound(stream_reader, local_writer, options));

    tokio::select! {
        res = &mut upstream => {
            downstream.abort();
            log_end("上行", res);
        }
        res = &mut downstream => {
            upstream.abort();
            log_end("下行", res);
        }
    }
}

fn log_end(direction: &str, res: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => debug!("{}方向结束", direction),
        Ok(Err(e)) => debug!("{}方向出错: {}", direction, e),
        Err(e) => debug!("{}方向任务异常: {}", direction, e),
    }
}

/// 带空闲超时的读
async fn read_idle<R>(reader: &mut R, buf: &mut [u8], idle: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle, reader.read(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout").into()),
    }
}

async fn outbound<R, W>(mut reader: R, mut writer: W, options: PipeOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut keystream: Option<Keystream> = options.cipher.as_ref().map(Cipher::keystream);
    let mut buf = options.pool.get();
    loop {
        let n = read_idle(&mut reader, &mut buf, options.idle_timeout).await?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        if let Some(keystream) = keystream.as_mut() {
            keystream.apply(chunk);
        }
        if options.compress {
            frame::write_frame(&mut writer, &compress::compress(chunk)?).await?;
        } else {
            writer.write_all(chunk).await?;
        }
        writer.flush().await?;
        options.counters.incr_written(n);
    }
    writer.shutdown().await?;
    Ok(())
}

async fn inbound<R, W>(reader: R, writer: W, options: PipeOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if options.compress {
        inbound_framed(reader, writer, options).await
    } else {
        inbound_raw(reader, writer, options).await
    }
}

async fn inbound_raw<R, W>(mut reader: R, mut writer: W, options: PipeOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut keystream: Option<Keystream> = options.cipher.as_ref().map(Cipher::keystream);
    let mut buf = options.pool.get();
    loop {
        let n = read_idle(&mut reader, &mut buf, options.idle_timeout).await?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        if let Some(keystream) = keystream.as_mut() {
            keystream.apply(chunk);
        }
        writer.write_all(chunk).await?;
        writer.flush().await?;
        options.counters.incr_read(n);
    }
    writer.shutdown().await?;
    Ok(())
}

/// 压缩模式下每个帧是一个压缩块，解压后不需要池里的缓冲区
async fn inbound_framed<R, W>(mut reader: R, mut writer: W, options: PipeOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut keystream: Option<Keystream> = options.cipher.as_ref().map(Cipher::keystream);
    loop {
        let packed = match tokio::time::timeout(options.idle_timeout, frame::read_frame_or_eof(&mut reader)).await {
            Ok(Ok(Some(packed))) => packed,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout").into()),
        };
        let mut data = compress::decompress(&packed)?;
        if let Some(keystream) = keystream.as_mut() {
            keystream.apply(&mut data);
        }
        writer.write_all(&data).await?;
        writer.flush().await?;
        options.counters.incr_read(data.len());
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::error::Error;

    fn options(cipher: Option<Cipher>, compress: bool, counters: Arc<ByteCounters>) -> PipeOptions {
        PipeOptions {
            cipher,
            compress,
            idle_timeout: Duration::from_secs(5),
            counters,
            pool: BufferPool::new(4, 1024),
        }
    }

    /// 客户端一侧的 relay 和服务端一侧的 relay 通过内存流相连
    fn tunnel(cipher: Option<Cipher>, compress: bool) -> (DuplexStream, DuplexStream, Arc<ByteCounters>) {
        let (app, client_local) = duplex(8192);
        let (client_stream, server_stream) = duplex(8192);
        let (server_local, target) = duplex(8192);
        let counters = ByteCounters::new();

        tokio::spawn(relay(client_local, client_stream, options(cipher.clone(), compress, counters.clone())));
        tokio::spawn(relay(server_local, server_stream, options(cipher, compress, ByteCounters::new())));
        (app, target, counters)
    }

    async fn exchange(cipher: Option<Cipher>, compress: bool) {
        let (mut app, mut target, counters) = tunnel(cipher, compress);
        let request: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();

        app.write_all(&request).await.unwrap();
        let mut received = vec![0u8; request.len()];
        target.read_exact(&mut received).await.unwrap();
        assert_eq!(received, request);

        target.write_all(b"response").await.unwrap();
        let mut reply = [0u8; 8];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"response");

        assert_eq!(counters.total_written(), request.len() as u64);
        assert_eq!(counters.total_read(), 8);
    }

    #[tokio::test]
    async fn test_plain_relay() {
        exchange(None, false).await;
    }

    #[tokio::test]
    async fn test_obfuscated_relay() {
        exchange(Some(Cipher::new("secret")), false).await;
    }

    #[tokio::test]
    async fn test_compressed_obfuscated_relay() {
        exchange(Some(Cipher::new("secret")), true).await;
    }

    #[tokio::test]
    async fn test_stream_bytes_are_obfuscated() {
        let cipher = Cipher::new("secret");
        let (mut app, client_local) = duplex(1024);
        let (client_stream, mut wire) = duplex(1024);
        tokio::spawn(relay(client_local, client_stream, options(Some(cipher.clone()), false, ByteCounters::new())));

        app.write_all(b"plain text").await.unwrap();
        let mut seen = [0u8; 10];
        wire.read_exact(&mut seen).await.unwrap();
        assert_ne!(&seen, b"plain text");
        assert_eq!(cipher.xor(&seen), b"plain text");
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (app, mut target, _) = tunnel(None, false);
        drop(app);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), target.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_relay() {
        let (_app, client_local) = duplex(1024);
        let (client_stream, _wire) = duplex(1024);
        let mut opts = options(None, false, ByteCounters::new());
        opts.idle_timeout = Duration::from_millis(50);
        let finished = tokio::time::timeout(Duration::from_secs(5), relay(client_local, client_stream, opts)).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_truncated_compressed_frame_is_protocol_error() {
        let opts = options(None, true, ByteCounters::new());
        let pool = Arc::clone(&opts.pool);
        let mut data = frame::encode(&compress::compress(b"complete chunk").unwrap()).unwrap().to_vec();
        data.extend_from_slice(&[200, 0, 0, 0, 1, 2, 3]);

        let mut out = Vec::new();
        let res = inbound(&data[..], &mut out, opts).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
        assert_eq!(out, b"complete chunk");
        // 压缩模式不借用池中的缓冲区
        assert_eq!(pool.idle(), 0);
    }
}
