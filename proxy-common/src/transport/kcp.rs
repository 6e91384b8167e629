use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use super::sealed::{derive_key, SealedStream};
use super::{BoxedConnection, Listener, Transport};
use crate::error::{Error, Result};

const WINDOW_SIZE: u16 = 1024;

/// 基于 UDP 的 KCP 传输，使用流模式，连接上的字节经过加密层
#[derive(Clone)]
pub struct KcpTransport {
    config: KcpConfig,
    key: [u8; 32],
}

impl KcpTransport {
    pub fn new(secret: &str) -> Self {
        let mut config = KcpConfig::default();
        config.nodelay = KcpNoDelayConfig::fastest();
        config.wnd_size = (WINDOW_SIZE, WINDOW_SIZE);
        config.stream = true;
        Self {
            config,
            key: derive_key(secret),
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::transport(format!("cannot resolve {addr}")))
}

#[async_trait]
impl Transport for KcpTransport {
    async fn dial(&self, server_addr: &str) -> Result<BoxedConnection> {
        let addr = resolve(server_addr).await?;
        let stream = KcpStream::connect(&self.config, addr)
            .await
            .map_err(|e| Error::transport(format!("kcp dial {server_addr}: {e}")))?;
        Ok(Box::new(SealedStream::new(stream, self.key)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let addr = resolve(addr).await?;
        let listener = KcpListener::bind(self.config.clone(), addr)
            .await
            .map_err(|e| Error::transport(format!("kcp listen {addr}: {e}")))?;
        Ok(Box::new(KcpTransportListener { listener, key: self.key }))
    }
}

struct KcpTransportListener {
    listener: KcpListener,
    key: [u8; 32],
}

#[async_trait]
impl Listener for KcpTransportListener {
    async fn accept(&mut self) -> Result<(BoxedConnection, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::transport(format!("kcp accept: {e}")))?;
        Ok((Box::new(SealedStream::new(stream, self.key)), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
