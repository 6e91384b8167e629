//! 服务端 UDP 转发：隧道流上每个帧对应一个数据报

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use proxy_common::cipher::Cipher;
use proxy_common::counter::ByteCounters;
use proxy_common::error::{Error, Result};
use proxy_common::frame;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, UdpSocket};

const MAX_DATAGRAM: usize = 64 * 1024;

/// 绑定临时端口并 connect 到目标，之后只收发该目标的数据报
pub async fn dial(target: &str, timeout: Duration) -> Result<UdpSocket> {
    let connect = async {
        let addr = lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok::<_, std::io::Error>(socket)
    };
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(source)) => Err(Error::Destination {
            addr: target.to_string(),
            source,
        }),
        Err(_) => Err(Error::Destination {
            addr: target.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
        }),
    }
}

/// 在隧道流和 UDP socket 之间转发，直到任一方向结束
pub async fn relay_datagrams<S>(
    stream: S,
    socket: UdpSocket,
    cipher: Option<Cipher>,
    idle: Duration,
    counters: Arc<ByteCounters>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    tokio::select! {
        res = to_target(&mut reader, &socket, cipher.as_ref(), idle, &counters) => {
            if let Err(e) = res {
                debug!("UDP 上行结束: {}", e);
            }
        }
        res = to_client(&mut writer, &socket, cipher.as_ref(), idle, &counters) => {
            if let Err(e) = res {
                debug!("UDP 下行结束: {}", e);
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn to_target<R>(
    reader: &mut R,
    socket: &UdpSocket,
    cipher: Option<&Cipher>,
    idle: Duration,
    counters: &ByteCounters,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut data = tokio::time::timeout(idle, frame::read_frame(reader))
            .await
            .map_err(|_| Error::transport("idle timeout"))??;
        if let Some(cipher) = cipher {
            cipher.apply(&mut data);
        }
        socket.send(&data).await?;
        counters.incr_read(data.len());
    }
}

async fn to_client<W>(
    writer: &mut W,
    socket: &UdpSocket,
    cipher: Option<&Cipher>,
    idle: Duration,
    counters: &ByteCounters,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = tokio::time::timeout(idle, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::transport("idle timeout"))??;
        let mut data = buf[..n].to_vec();
        if let Some(cipher) = cipher {
            cipher.apply(&mut data);
        }
        frame::write_frame(writer, &data).await?;
        writer.flush().await?;
        counters.incr_written(n);
    }
}
