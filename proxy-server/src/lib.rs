//! 隧道服务端
//!
//! 每条底层连接上跑一个多路复用会话，每条逻辑流先校验握手，再按请求拨号 TCP 或 UDP 目标。

pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use proxy_common::protocol::{self, Network};
use proxy_common::{
    mux, relay, BoxedConnection, BufferPool, ByteCounters, Cipher, Config, Error, Listener, MuxStream,
    PipeOptions, Result, Transport,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use uuid::Uuid;

#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    cipher: Option<Cipher>,
    counters: Arc<ByteCounters>,
    pool: Arc<BufferPool>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            cipher: config.cipher(),
            config: Arc::new(config),
            counters: ByteCounters::new(),
            pool: Arc::new(BufferPool::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }

    /// 按配置的协议构造传输，ws 的 `/stats` 展示本实例的计数
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.config
            .protocol
            .transport(&self.config.key, self.counters())
    }

    /// 按配置的协议在 local_addr 上监听
    pub async fn listen(&self) -> Result<Box<dyn Listener>> {
        self.transport().listen(&self.config.local_addr).await
    }

    /// 接受循环，单个连接的错误不会终止循环
    pub async fn run(&self, mut listener: Box<dyn Listener>) -> Result<()> {
        info!("服务端启动在 {} ({})", listener.local_addr()?, self.config.protocol);
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(conn, peer).await });
                }
                Err(Error::ListenerClosed) => {
                    info!("监听器已关闭");
                    return Ok(());
                }
                Err(e) => {
                    error!("接受连接时出错: {}", e);
                }
            }
        }
    }

    async fn handle_connection(self, conn: BoxedConnection, peer: SocketAddr) {
        let session_id = Uuid::new_v4();
        info!("新会话 {} 来自: {}", session_id, peer);
        mux::serve(conn, move |stream| self.clone().handle_stream(stream)).await;
        info!("会话 {} 结束", session_id);
    }

    fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            cipher: self.cipher.clone(),
            compress: self.config.compress,
            idle_timeout: self.config.timeout(),
            counters: Arc::clone(&self.counters),
            pool: Arc::clone(&self.pool),
        }
    }

    /// 处理一条逻辑流。握手或拨号失败时直接关闭流，不回任何数据。
    async fn handle_stream(self, mut stream: MuxStream) {
        let timeout = self.config.timeout();
        let request = match protocol::receive(&mut stream, self.cipher.as_ref(), &self.config.key, timeout).await {
            Ok(request) => request,
            Err(e) => {
                warn!("握手失败: {}", e);
                let _ = stream.shutdown().await;
                return;
            }
        };
        let target = request.target();
        debug!("[{}] {:?} -> {}", request.nonce, request.network, target);

        match request.network {
            Network::Tcp => {
                let remote = match connect_tcp(&target, timeout).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!("{}", e);
                        let _ = stream.shutdown().await;
                        return;
                    }
                };
                if let Err(e) = protocol::acknowledge(&mut stream).await {
                    debug!("发送握手响应失败: {}", e);
                    return;
                }
                relay::relay(remote, stream, self.pipe_options()).await;
            }
            Network::Udp => {
                let socket = match udp::dial(&target, timeout).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("{}", e);
                        let _ = stream.shutdown().await;
                        return;
                    }
                };
                if let Err(e) = protocol::acknowledge(&mut stream).await {
                    debug!("发送握手响应失败: {}", e);
                    return;
                }
                udp::relay_datagrams(stream, socket, self.cipher.clone(), timeout, self.counters()).await;
            }
        }
        debug!("[{}] 连接关闭: {}", request.nonce, target);
    }
}

async fn connect_tcp(target: &str, timeout: Duration) -> Result<TcpStream> {
    let destination = |source| Error::Destination {
        addr: target.to_string(),
        source,
    };
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| destination(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")))?
        .map_err(destination)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use proxy_common::transport::{Protocol, TcpTransport};
    use proxy_common::Multiplexer;
    use proxy_common::Address;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    fn config(key: &str) -> Config {
        Config {
            key: key.to_string(),
            protocol: Protocol::Tcp,
            obfs: true,
            timeout: 5,
            ..Config::default()
        }
    }

    async fn start(config: Config) -> SocketAddr {
        let server = Server::new(config);
        let listener = server.transport().listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.run(listener).await });
        addr
    }

    #[tokio::test]
    async fn test_rejected_handshake_gets_no_bytes() {
        let addr = start(config("right")).await;
        let mux = Multiplexer::new(Arc::new(TcpTransport), addr.to_string(), Duration::from_secs(5));

        let cipher = Cipher::new("wrong");
        let mut stream = mux.open_stream().await.unwrap();
        let request = protocol::HandshakeRequest::new(Network::Tcp, &Address::Domain("example.com".into(), 80), "wrong");
        protocol::send(&mut stream, &request, Some(&cipher)).await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await.unwrap();
        assert!(read.is_err() || rest.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_destination_closes_stream() {
        // 先占用再释放一个端口，得到大概率无人监听的地址
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let addr = start(config("right")).await;
        let mux = Multiplexer::new(Arc::new(TcpTransport), addr.to_string(), Duration::from_secs(5));
        let cipher = Cipher::new("right");
        let mut stream = mux.open_stream().await.unwrap();
        let request = protocol::HandshakeRequest::new(Network::Tcp, &Address::from(closed), "right");
        protocol::send(&mut stream, &request, Some(&cipher)).await.unwrap();

        assert!(protocol::await_ack(&mut stream, Duration::from_secs(5)).await.is_err());
    }
}
