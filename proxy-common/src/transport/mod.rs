//! 底层传输：所有传输只负责产生一条可读写的字节连接，多路复用在其上完成

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::counter::ByteCounters;
use crate::error::{Error, Result};

mod kcp;
mod sealed;
mod tcp;
mod ws;

pub use kcp::KcpTransport;
pub use tcp::TcpTransport;
pub use ws::{WsTransport, WS_PATH};

/// 一条底层连接
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, server_addr: &str) -> Result<BoxedConnection>;

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send {
    /// 监听器不可恢复时返回 `Error::ListenerClosed`，其余错误只影响本次 accept
    async fn accept(&mut self) -> Result<(BoxedConnection, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ws,
    Wss,
    Tcp,
    Kcp,
}

impl Protocol {
    /// kcp 用共享密钥加密底层连接；ws 服务端在 `/stats` 上展示 counters
    pub fn transport(self, key: &str, counters: Arc<ByteCounters>) -> Arc<dyn Transport> {
        match self {
            Protocol::Ws => Arc::new(WsTransport::new(false, counters)),
            Protocol::Wss => Arc::new(WsTransport::new(true, counters)),
            Protocol::Tcp => Arc::new(TcpTransport),
            Protocol::Kcp => Arc::new(KcpTransport::new(key)),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "tcp" => Ok(Protocol::Tcp),
            "kcp" => Ok(Protocol::Kcp),
            other => Err(Error::config(format!("unknown protocol: {other}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Tcp => "tcp",
            Protocol::Kcp => "kcp",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_protocol_parse_and_display() {
        for name in ["ws", "wss", "tcp", "kcp"] {
            let protocol: Protocol = name.parse().unwrap();
            assert_eq!(protocol.to_string(), name);
        }
        assert_eq!("WSS".parse::<Protocol>().unwrap(), Protocol::Wss);
        assert!("quic".parse::<Protocol>().is_err());
        assert_eq!(Protocol::default(), Protocol::Ws);
    }

    fn transport(protocol: Protocol) -> Arc<dyn Transport> {
        protocol.transport("transport-key", ByteCounters::new())
    }

    async fn echo_once(transport: Arc<dyn Transport>) {
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.flush().await.unwrap();
            // 连接交还给测试，保证对端读完之前不被关闭
            (conn, listener)
        });

        let mut conn = transport.dial(&addr.to_string()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();
        let _held = server.await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_echo() {
        echo_once(transport(Protocol::Tcp)).await;
    }

    #[tokio::test]
    async fn test_ws_echo() {
        echo_once(transport(Protocol::Ws)).await;
    }

    #[tokio::test]
    async fn test_kcp_echo() {
        echo_once(transport(Protocol::Kcp)).await;
    }

    #[tokio::test]
    async fn test_kcp_peers_need_same_key() {
        let mut listener = KcpTransport::new("server-key").listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            (buf, conn, listener)
        });

        let mut conn = KcpTransport::new("client-key").dial(&addr.to_string()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();
        let (received, _conn, _listener) = server.await.unwrap();
        assert_ne!(&received, b"hello");
    }
}
