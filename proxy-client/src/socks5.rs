//! SOCKS5 前端：只支持无认证，命令支持 CONNECT 和 UDP ASSOCIATE

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};
use proxy_common::address::{IPV4_ADDRESS, IPV6_ADDRESS};
use proxy_common::{Address, Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{tcp, udp, Client};

pub const SOCKS_VERSION: u8 = 0x05;
pub const NO_AUTHENTICATION: u8 = 0x00;
pub const CONNECT_COMMAND: u8 = 0x01;
pub const BIND_COMMAND: u8 = 0x02;
pub const UDP_ASSOCIATE_COMMAND: u8 = 0x03;

/// 应答码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// 客户端发来的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub address: Address,
}

/// 读问候并回复无认证。版本不是 5 时返回错误，不回任何字节。
pub async fn greet<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(Error::protocol(format!("unsupported socks version: {version}")));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS_VERSION, NO_AUTHENTICATION]).await?;
    Ok(())
}

/// 读命令帧：VER CMD RSV ATYP DST.ADDR DST.PORT
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!("unsupported socks version: {}", head[0])));
    }
    let address = Address::read_from(stream).await?;
    Ok(Request {
        command: head[1],
        address,
    })
}

/// 固定形状的应答，绑定地址一律为 0.0.0.0:0
pub fn reply_frame(reply: Reply) -> [u8; 10] {
    [SOCKS_VERSION, reply as u8, 0x00, IPV4_ADDRESS, 0, 0, 0, 0, 0, 0]
}

/// 带绑定地址的应答，用于 UDP ASSOCIATE
pub fn reply_with_addr(reply: Reply, bound: SocketAddr) -> BytesMut {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(0x00);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(IPV4_ADDRESS);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(IPV6_ADDRESS);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(bound.port());
    buf
}

pub async fn send_reply<W>(stream: &mut W, reply: Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&reply_frame(reply)).await?;
    Ok(())
}

/// 处理一条 SOCKS5 连接直到结束
pub async fn handle_connection(client: Client, mut socket: TcpStream, peer: SocketAddr) -> Result<()> {
    greet(&mut socket).await?;
    let request = read_request(&mut socket).await?;

    match request.command {
        CONNECT_COMMAND => tcp::handle_connect(&client, socket, request.address).await,
        UDP_ASSOCIATE_COMMAND => udp::handle_associate(&client, socket, peer).await,
        command => {
            log::debug!("不支持的命令 {} 来自 {}", command, peer);
            send_reply(&mut socket, Reply::CommandNotSupported).await?;
            let _ = socket.shutdown().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_greeting_replies_no_auth() {
        let (mut local, mut remote) = duplex(64);
        local.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        greet(&mut remote).await.unwrap();
        let mut reply = [0u8; 2];
        local.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_wrong_version_gets_no_reply() {
        let (mut local, mut remote) = duplex(64);
        local.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(greet(&mut remote).await, Err(Error::Protocol(_))));
        drop(remote);
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_read_connect_request() {
        let mut data: &[u8] = &[0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0x00, 0x50];
        let request = read_request(&mut data).await.unwrap();
        assert_eq!(request.command, CONNECT_COMMAND);
        assert_eq!(request.address, Address::Domain("example.com".into(), 80));
    }

    #[tokio::test]
    async fn test_read_request_bad_address_type() {
        let mut data: &[u8] = &[0x05, 0x01, 0x00, 0x09, 1, 2, 3, 4, 0, 80];
        assert!(read_request(&mut data).await.is_err());
    }

    #[test]
    fn test_reply_frames() {
        assert_eq!(reply_frame(Reply::Succeeded), [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reply_frame(Reply::ConnectionRefused)[1], 5);
        assert_eq!(reply_frame(Reply::CommandNotSupported)[1], 7);

        let bound = SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 0x1f90));
        assert_eq!(&reply_with_addr(Reply::Succeeded, bound)[..], &[5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90]);
    }
}
