use std::net::SocketAddr;

use async_trait::async_trait;
use log::debug;
use tokio::net::{TcpListener, TcpStream};

use super::{BoxedConnection, Listener, Transport};
use crate::error::{Error, Result};

/// 直接用 TCP 承载会话
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, server_addr: &str) -> Result<BoxedConnection> {
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|e| Error::transport(format!("dial {server_addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpTransportListener { listener }))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&mut self) -> Result<(BoxedConnection, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败 {}: {}", peer, e);
        }
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
