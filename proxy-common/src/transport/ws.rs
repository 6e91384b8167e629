//! WebSocket 传输
//!
//! 客户端用 tokio-tungstenite 拨号，服务端用 axum 接受升级。
//! 只有 `/freedom` 路径升级为隧道，`/ip` 返回访问者地址，`/stats` 返回流量统计，
//! 其余路径返回 nginx 默认页。
//! 二进制消息与字节流之间通过一对 duplex 管道转换。

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};
use url::Url;

use super::{BoxedConnection, Listener, Transport};
use crate::counter::ByteCounters;
use crate::error::{Error, Result};

pub const WS_PATH: &str = "/freedom";
pub const IP_PATH: &str = "/ip";
pub const STATS_PATH: &str = "/stats";

const BRIDGE_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 128;

const NGINX_WELCOME: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>Welcome to nginx!</title>
<style>
html { color-scheme: light dark; }
body { width: 35em; margin: 0 auto;
font-family: Tahoma, Verdana, Arial, sans-serif; }
</style>
</head>
<body>
<h1>Welcome to nginx!</h1>
<p>If you see this page, the nginx web server is successfully installed and
working. Further configuration is required.</p>

<p>For online documentation and support please refer to
<a href="http://nginx.org/">nginx.org</a>.<br/>
Commercial support is available at
<a href="http://nginx.com/">nginx.com</a>.</p>

<p><em>Thank you for using nginx.</em></p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct WsTransport {
    secure: bool,
    counters: Arc<ByteCounters>,
}

impl WsTransport {
    pub fn new(secure: bool, counters: Arc<ByteCounters>) -> Self {
        Self { secure, counters }
    }

    fn url(&self, server_addr: &str) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        Url::parse(&format!("{scheme}://{server_addr}{WS_PATH}"))
            .map_err(|e| Error::config(format!("invalid server address {server_addr}: {e}")))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn dial(&self, server_addr: &str) -> Result<BoxedConnection> {
        let url = self.url(server_addr)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::transport(format!("websocket dial {url}: {e}")))?;
        debug!("WebSocket 连接建立: {}", url);
        Ok(bridge(ws_stream, TungsteniteMessage::Binary, classify_tungstenite))
    }

    /// wss 时同样监听明文 ws，TLS 由前置的反向代理终结
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let app = Router::new()
            .route(WS_PATH, get(ws_handler))
            .route(IP_PATH, get(ip_handler))
            .route(STATS_PATH, get(stats_handler))
            .fallback(decoy_handler)
            .with_state(AppState {
                incoming: tx,
                counters: Arc::clone(&self.counters),
            });

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!("WebSocket 服务异常退出: {}", e);
            }
        });
        info!("WebSocket 监听 {}{}", local_addr, WS_PATH);

        Ok(Box::new(WsListener {
            incoming: rx,
            local_addr,
            server,
        }))
    }
}

#[derive(Clone)]
struct AppState {
    incoming: mpsc::Sender<(BoxedConnection, SocketAddr)>,
    counters: Arc<ByteCounters>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| async move {
        let conn = bridge(socket, |data: Vec<u8>| Message::Binary(data.into()), classify_axum);
        if state.incoming.send((conn, peer)).await.is_err() {
            debug!("监听器已关闭，丢弃来自 {} 的连接", peer);
        }
    })
}

/// 前面有反向代理时取 X-Forwarded-For
async fn ip_handler(headers: HeaderMap, ConnectInfo(peer): ConnectInfo<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn stats_handler(State(state): State<AppState>) -> String {
    state.counters.to_string()
}

async fn decoy_handler() -> Html<&'static str> {
    Html(NGINX_WELCOME)
}

struct WsListener {
    incoming: mpsc::Receiver<(BoxedConnection, SocketAddr)>,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Result<(BoxedConnection, SocketAddr)> {
        self.incoming.recv().await.ok_or(Error::ListenerClosed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.server.abort();
    }
}

enum Frame {
    Data(Vec<u8>),
    Close,
    Skip,
}

fn classify_tungstenite(msg: TungsteniteMessage) -> Frame {
    match msg {
        TungsteniteMessage::Binary(data) => Frame::Data(data),
        TungsteniteMessage::Text(text) => Frame::Data(text.into_bytes()),
        TungsteniteMessage::Close(_) => Frame::Close,
        _ => Frame::Skip,
    }
}

fn classify_axum(msg: Message) -> Frame {
    match msg {
        Message::Binary(data) => Frame::Data(data.to_vec()),
        Message::Text(text) => Frame::Data(text.as_str().as_bytes().to_vec()),
        Message::Close(_) => Frame::Close,
        _ => Frame::Skip,
    }
}

/// 把消息流转换成字节连接
fn bridge<S, M, E>(ws: S, into_msg: fn(Vec<u8>) -> M, classify: fn(M) -> Frame) -> BoxedConnection
where
    S: Stream<Item = std::result::Result<M, E>> + Sink<M> + Unpin + Send + 'static,
    <S as Sink<M>>::Error: Send,
    M: Send + 'static,
    E: Display + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut reader, mut writer) = tokio::io::split(remote);
    let (mut sink, mut stream) = ws.split();

    // WebSocket -> 字节流
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(msg) => match classify(msg) {
                    Frame::Data(data) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Frame::Close => break,
                    Frame::Skip => {}
                },
                Err(e) => {
                    debug!("WebSocket 读取失败: {}", e);
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    // 字节流 -> WebSocket
    tokio::spawn(async move {
        let mut buf = vec![0u8; BRIDGE_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink.send(into_msg(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    Box::new(local)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_url_scheme() {
        assert_eq!(
            transport(false).url("example.com:8081").unwrap().as_str(),
            "ws://example.com:8081/freedom"
        );
        assert_eq!(
            transport(true).url("example.com").unwrap().as_str(),
            "wss://example.com/freedom"
        );
    }

    fn transport(secure: bool) -> WsTransport {
        WsTransport::new(secure, ByteCounters::new())
    }

    async fn http_get(addr: SocketAddr, path: &str, extra_headers: &str) -> String {
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}Connection: close\r\n\r\n");
        conn.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_decoy_page_on_other_paths() {
        let listener = transport(false).listen("127.0.0.1:0").await.unwrap();
        let response = http_get(listener.local_addr().unwrap(), "/", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("Welcome to nginx!"));
    }

    #[tokio::test]
    async fn test_ip_route() {
        let listener = transport(false).listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let response = http_get(addr, IP_PATH, "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("127.0.0.1"));

        let response = http_get(addr, IP_PATH, "X-Forwarded-For: 203.0.113.7\r\n").await;
        assert!(response.ends_with("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_stats_route_renders_counters() {
        let counters = ByteCounters::new();
        counters.incr_read(2048);
        counters.incr_written(10);
        let listener = WsTransport::new(false, Arc::clone(&counters)).listen("127.0.0.1:0").await.unwrap();

        let response = http_get(listener.local_addr().unwrap(), STATS_PATH, "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(&counters.to_string()));
        assert!(!response.contains("Welcome to nginx!"));
    }
}
