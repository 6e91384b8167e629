//! SOCKS5 地址字段的解析与序列化
//!
//! ```plain
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;
pub const IPV6_ADDRESS: u8 = 0x04;

/// 地址类型，决定地址字段在报文中的长度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

impl AddressKind {
    pub fn from_atyp(atyp: u8) -> Option<Self> {
        match atyp {
            IPV4_ADDRESS => Some(AddressKind::Ipv4),
            DOMAIN_NAME => Some(AddressKind::Domain),
            IPV6_ADDRESS => Some(AddressKind::Ipv6),
            _ => None,
        }
    }

    pub fn atyp(self) -> u8 {
        match self {
            AddressKind::Ipv4 => IPV4_ADDRESS,
            AddressKind::Domain => DOMAIN_NAME,
            AddressKind::Ipv6 => IPV6_ADDRESS,
        }
    }
}

/// 目标端点，解析后不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Ipv4(..) => AddressKind::Ipv4,
            Address::Ipv6(..) => AddressKind::Ipv6,
            Address::Domain(..) => AddressKind::Domain,
        }
    }

    /// 主机部分，不带端口，IPv6 不加方括号
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => ip.to_string(),
            Address::Ipv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// 私有网段：10/8、172.16/12、192.168/16 以及 fc00::/7。域名一律不算。
    pub fn is_private(&self) -> bool {
        match self {
            Address::Ipv4(ip, _) => ip.is_private(),
            Address::Ipv6(ip, _) => (ip.segments()[0] & 0xfe00) == 0xfc00,
            Address::Domain(..) => false,
        }
    }

    /// 序列化后的字节数（含 ATYP）
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 1 + 4 + 2,
            Address::Ipv6(..) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// 从字节切片解析，返回地址和消耗的字节数
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let atyp = *data.first().ok_or_else(|| Error::protocol("empty address"))?;
        let kind = AddressKind::from_atyp(atyp)
            .ok_or_else(|| Error::protocol(format!("unsupported address type: {atyp}")))?;

        let (address, used) = match kind {
            AddressKind::Ipv4 => {
                let raw = take(data, 1, 4 + 2)?;
                let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                (Address::Ipv4(ip, u16::from_be_bytes([raw[4], raw[5]])), 1 + 6)
            }
            AddressKind::Ipv6 => {
                let raw = take(data, 1, 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                let port = u16::from_be_bytes([raw[16], raw[17]]);
                (Address::Ipv6(Ipv6Addr::from(octets), port), 1 + 18)
            }
            AddressKind::Domain => {
                let len = take(data, 1, 1)?[0] as usize;
                let raw = take(data, 2, len + 2)?;
                let domain = String::from_utf8(raw[..len].to_vec())
                    .map_err(|_| Error::protocol("domain is not valid utf-8"))?;
                let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
                (Address::Domain(domain, port), 2 + len + 2)
            }
        };
        Ok((address, used))
    }

    /// 从流中读取地址（ATYP 在内）
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        match AddressKind::from_atyp(atyp) {
            Some(AddressKind::Ipv4) => {
                let mut addr_buf = [0u8; 4];
                reader.read_exact(&mut addr_buf).await?;
                let port = reader.read_u16().await?;
                Ok(Address::Ipv4(Ipv4Addr::from(addr_buf), port))
            }
            Some(AddressKind::Domain) => {
                let domain_len = reader.read_u8().await? as usize;
                let mut domain_buf = vec![0u8; domain_len];
                reader.read_exact(&mut domain_buf).await?;
                let domain = String::from_utf8(domain_buf)
                    .map_err(|_| Error::protocol("domain is not valid utf-8"))?;
                let port = reader.read_u16().await?;
                Ok(Address::Domain(domain, port))
            }
            Some(AddressKind::Ipv6) => {
                let mut addr_buf = [0u8; 16];
                reader.read_exact(&mut addr_buf).await?;
                let port = reader.read_u16().await?;
                Ok(Address::Ipv6(Ipv6Addr::from(addr_buf), port))
            }
            None => Err(Error::protocol(format!("unsupported address type: {atyp}"))),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        if let Address::Domain(domain, _) = self {
            if domain.len() > u8::MAX as usize {
                return Err(Error::protocol(format!("domain too long: {}", domain.len())));
            }
        }
        buf.reserve(self.serialized_len());
        buf.put_u8(self.kind().atyp());
        match self {
            Address::Ipv4(ip, _) => buf.put_slice(&ip.octets()),
            Address::Ipv6(ip, _) => buf.put_slice(&ip.octets()),
            Address::Domain(domain, _) => {
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip, addr.port()),
            IpAddr::V6(ip) => Address::Ipv6(ip, addr.port()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            Address::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            Address::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len)
        .ok_or_else(|| Error::protocol(format!("address truncated: need {} bytes", offset + len)))
}
