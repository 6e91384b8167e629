//! SOCKS5 客户端
//!
//! 本地接受 SOCKS5 连接，TCP 和 UDP 都经同一个多路复用会话转发到服务端。

pub mod direct;
pub mod socks5;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use log::{debug, error, info};
use proxy_common::protocol::{self, HandshakeRequest, Network};
use proxy_common::{
    Address, BufferPool, ByteCounters, Cipher, Config, Multiplexer, MuxStream, PipeOptions, Result,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// 客户端实例，持有唯一的会话管理器
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    cipher: Option<Cipher>,
    mux: Multiplexer,
    counters: Arc<ByteCounters>,
    pool: Arc<BufferPool>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let counters = ByteCounters::new();
        let transport = config.protocol.transport(&config.key, Arc::clone(&counters));
        let mux = Multiplexer::new(transport, config.server_addr.clone(), config.timeout());
        Self {
            inner: Arc::new(Inner {
                cipher: config.cipher(),
                config,
                mux,
                counters,
                pool: Arc::new(BufferPool::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cipher(&self) -> Option<&Cipher> {
        self.inner.cipher.as_ref()
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.inner.counters)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    pub fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            cipher: self.inner.cipher.clone(),
            compress: self.inner.config.compress,
            idle_timeout: self.inner.config.timeout(),
            counters: self.counters(),
            pool: Arc::clone(&self.inner.pool),
        }
    }

    /// 打开一条逻辑流并完成握手，返回时服务端已连上目标
    pub async fn open_tunnel(&self, network: Network, target: &Address) -> Result<MuxStream> {
        let config = &self.inner.config;
        let mut stream = self.inner.mux.open_stream().await?;
        let request = HandshakeRequest::new(network, target, &config.key);
        debug!("[{}] 打开隧道 {:?} -> {}", request.nonce, network, target);

        if let Err(e) = protocol::send(&mut stream, &request, self.cipher()).await {
            let _ = stream.shutdown().await;
            return Err(e);
        }
        protocol::await_ack(&mut stream, config.timeout()).await?;
        Ok(stream)
    }

    pub async fn listen(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.inner.config.local_addr).await?)
    }

    /// SOCKS5 接受循环
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        info!(
            "SOCKS5 客户端启动在 {}，服务端 {} ({})",
            listener.local_addr()?,
            self.inner.config.server_addr,
            self.inner.config.protocol
        );
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("新 SOCKS5 连接来自: {}", peer);
                    let client = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = socks5::handle_connection(client, socket, peer).await {
                            debug!("处理 SOCKS5 连接 {} 时出错: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("接受 SOCKS5 连接时出错: {}", e);
                }
            }
        }
    }
}
