//! UDP ASSOCIATE
//!
//! 每个 (客户端地址, 目标地址) 对应一个流，流上一个帧一个数据报。
//! 回程数据报前面拼上该流第一个数据报的 SOCKS5 头。
//! 流的建立在各自的任务里完成，接收循环只负责分发，某个目标握手慢不影响其它流。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use proxy_common::protocol::Network;
use proxy_common::{frame, Address, ByteCounters, Cipher, Error, MuxStream, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;

use crate::socks5::{reply_with_addr, Reply};
use crate::Client;

const MAX_DATAGRAM: usize = 64 * 1024;
/// 每个流排队等待发送的数据报上限，超出直接丢弃
const FLOW_QUEUE: usize = 64;

/// 解析 SOCKS5 UDP 头：RSV(2) FRAG(1) ATYP DST.ADDR DST.PORT，返回目标地址和头长度
pub fn parse_datagram(data: &[u8]) -> Result<(Address, usize)> {
    if data.len() < 4 {
        return Err(Error::protocol("datagram too short"));
    }
    if data[2] != 0 {
        return Err(Error::protocol(format!("fragmented datagram: {}", data[2])));
    }
    let (address, used) = Address::parse(&data[3..])?;
    Ok((address, 3 + used))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client: SocketAddr,
    pub destination: Address,
}

struct Flow {
    queue: mpsc::Sender<Vec<u8>>,
    header: Bytes,
}

type FlowMap = Arc<DashMap<FlowKey, Arc<Flow>>>;

/// 一个 UDP ASSOCIATE 会话的转发状态
pub struct UdpRelay {
    client: Client,
    socket: Arc<UdpSocket>,
    flows: FlowMap,
}

impl UdpRelay {
    pub fn new(client: Client, socket: UdpSocket) -> Self {
        Self {
            client,
            socket: Arc::new(socket),
            flows: Arc::new(DashMap::new()),
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// 入站循环，返回时所有流任务随之终止
    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = self.socket.recv_from(&mut buf).await?;
            while tasks.try_join_next().is_some() {}

            let data = &buf[..n];
            let (destination, header_len) = match parse_datagram(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("丢弃来自 {} 的数据报: {}", src, e);
                    continue;
                }
            };
            let key = FlowKey {
                client: src,
                destination,
            };

            let (flow, pending) = match self.flows.entry(key.clone()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), None),
                Entry::Vacant(entry) => {
                    let (queue, pending) = mpsc::channel(FLOW_QUEUE);
                    let flow = Arc::new(Flow {
                        queue,
                        header: Bytes::copy_from_slice(&data[..header_len]),
                    });
                    entry.insert(Arc::clone(&flow));
                    (flow, Some(pending))
                }
            };
            if let Some(pending) = pending {
                debug!("新 UDP 流 {} -> {}", key.client, key.destination);
                tasks.spawn(run_flow(
                    self.client.clone(),
                    key.clone(),
                    Arc::clone(&flow),
                    pending,
                    Arc::clone(&self.socket),
                    Arc::clone(&self.flows),
                ));
            }

            match flow.queue.try_send(data[header_len..].to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("UDP 流 {} 队列已满，丢弃数据报", key.destination),
                Err(TrySendError::Closed(_)) => debug!("UDP 流 {} 已结束，丢弃数据报", key.destination),
            }
        }
    }
}

/// 一个流的完整生命周期：开隧道、双向转发，结束时从表里删除自己
async fn run_flow(
    client: Client,
    key: FlowKey,
    flow: Arc<Flow>,
    pending: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    flows: FlowMap,
) {
    match client.open_tunnel(Network::Udp, &key.destination).await {
        Ok(stream) => {
            let (reader, writer) = tokio::io::split(stream);
            let cipher = client.cipher().cloned();
            let counters = client.counters();
            tokio::select! {
                res = upstream(writer, pending, cipher.clone(), Arc::clone(&counters)) => {
                    if let Err(e) = res {
                        debug!("UDP 流 {} 写入失败: {}", key.destination, e);
                    }
                }
                _ = return_path(reader, &key, &flow, &socket, cipher, client.config().timeout(), counters) => {}
            }
        }
        Err(e) => warn!("UDP 流 {} -> {} 建立失败: {}", key.client, key.destination, e),
    }
    flows.remove_if(&key, |_, current| Arc::ptr_eq(current, &flow));
}

/// 去程：把排队的负载逐个作为帧写入隧道
async fn upstream(
    mut writer: WriteHalf<MuxStream>,
    mut pending: mpsc::Receiver<Vec<u8>>,
    cipher: Option<Cipher>,
    counters: Arc<ByteCounters>,
) -> Result<()> {
    while let Some(mut payload) = pending.recv().await {
        if let Some(cipher) = &cipher {
            cipher.apply(&mut payload);
        }
        frame::write_frame(&mut writer, &payload).await?;
        writer.flush().await?;
        counters.incr_written(payload.len());
    }
    Ok(())
}

/// 回程：读帧、还原、拼上头部、发回客户端
async fn return_path(
    mut reader: ReadHalf<MuxStream>,
    key: &FlowKey,
    flow: &Flow,
    socket: &UdpSocket,
    cipher: Option<Cipher>,
    idle: Duration,
    counters: Arc<ByteCounters>,
) {
    loop {
        let mut data = match tokio::time::timeout(idle, frame::read_frame(&mut reader)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                debug!("UDP 流 {} 结束: {}", key.destination, e);
                return;
            }
            Err(_) => {
                debug!("UDP 流 {} 空闲超时", key.destination);
                return;
            }
        };
        if let Some(cipher) = &cipher {
            cipher.apply(&mut data);
        }
        let mut packet = BytesMut::with_capacity(flow.header.len() + data.len());
        packet.put_slice(&flow.header);
        packet.put_slice(&data);
        if let Err(e) = socket.send_to(&packet, key.client).await {
            debug!("UDP 回包发送失败 {}: {}", key.client, e);
            return;
        }
        counters.incr_read(data.len());
    }
}

/// 在控制连接的本地地址上绑定中继端口，失败属于资源错误
pub async fn bind_relay_socket(ip: IpAddr) -> Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(ip, 0))
        .await
        .map_err(|e| Error::Resource(format!("bind udp relay on {ip}: {e}")))
}

/// 绑定 UDP 端口、回复绑定地址，TCP 控制连接断开时结束
pub async fn handle_associate(client: &Client, mut control: TcpStream, peer: SocketAddr) -> Result<()> {
    let socket = bind_relay_socket(control.local_addr()?.ip()).await?;
    let bound = socket.local_addr()?;
    control.write_all(&reply_with_addr(Reply::Succeeded, bound)).await?;
    debug!("UDP ASSOCIATE {} 绑定 {}", peer, bound);

    let relay = UdpRelay::new(client.clone(), socket);
    tokio::select! {
        _ = wait_closed(&mut control) => {
            debug!("UDP ASSOCIATE {} 控制连接关闭", peer);
        }
        res = relay.run() => {
            if let Err(e) = res {
                warn!("UDP 转发出错: {}", e);
            }
        }
    }
    Ok(())
}

/// 控制连接上不承载数据，读到 EOF 或出错即视为关闭
async fn wait_closed(control: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match control.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_parse_datagram() {
        let data = [0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53, b'h', b'i'];
        let (address, header_len) = parse_datagram(&data).unwrap();
        assert_eq!(address, Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53));
        assert_eq!(header_len, 10);
        assert_eq!(&data[header_len..], b"hi");
    }

    #[test]
    fn test_parse_datagram_domain_header() {
        let mut data = vec![0, 0, 0, 0x03, 3, b'a', b'.', b'b', 0x01, 0xbb];
        data.extend_from_slice(b"payload");
        let (address, header_len) = parse_datagram(&data).unwrap();
        assert_eq!(address, Address::Domain("a.b".into(), 443));
        assert_eq!(header_len, 10);
    }

    #[test]
    fn test_fragmented_and_short_datagrams_rejected() {
        assert!(parse_datagram(&[0, 0, 1, 0x01, 8, 8, 8, 8, 0, 53]).is_err());
        assert!(parse_datagram(&[0, 0, 0]).is_err());
        assert!(parse_datagram(&[0, 0, 0, 0x05, 1]).is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_resource_error() {
        let err = bind_relay_socket(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))).await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));

        let socket = bind_relay_socket(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_flow_key_distinguishes_destinations() {
        let client: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let a = FlowKey {
            client,
            destination: Address::Ipv4(Ipv4Addr::new(1, 1, 1, 1), 53),
        };
        let b = FlowKey {
            client,
            destination: Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53),
        };
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
