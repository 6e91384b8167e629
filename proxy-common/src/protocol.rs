use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::cipher::{self, Cipher};
use crate::error::{AuthError, Error, Result};
use crate::frame;

/// 握手成功后服务端写回的单字节信号
pub const HANDSHAKE_OK: u8 = 0x00;

/// 流的承载类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

/// 握手请求结构体
/// 每条逻辑流在发送负载之前先发送一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    /// "tcp" 或 "udp"
    pub network: Network,
    /// 目标主机，IP 或域名
    pub host: String,
    #[serde(with = "decimal")]
    pub port: u16,
    /// 共享密钥
    pub key: String,
    /// 发送方构造请求时的 unix 秒
    #[serde(with = "decimal")]
    pub timestamp: i64,
    /// 随机串，只用于熵和日志关联
    #[serde(rename = "Random")]
    pub nonce: String,
}

impl HandshakeRequest {
    pub fn new(network: Network, target: &Address, key: &str) -> Self {
        Self {
            network,
            host: target.host(),
            port: target.port(),
            key: key.to_string(),
            timestamp: unix_now(),
            nonce: cipher::random_nonce(),
        }
    }

    /// 可直接传给 connect 的 "host:port"
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 先检查时间戳，再检查密钥。只拒绝过期的请求，不拒绝来自未来的时间戳。
    pub fn validate(&self, key: &str, timeout: Duration, now: i64) -> std::result::Result<(), AuthError> {
        let age = now.saturating_sub(self.timestamp);
        if age > i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX) {
            return Err(AuthError::Expired { age });
        }
        if !bool::from(self.key.as_bytes().ct_eq(key.as_bytes())) {
            return Err(AuthError::Unauthorized);
        }
        Ok(())
    }
}

/// 序列化、按需混淆、加长度前缀，一次写出
pub async fn send<W>(writer: &mut W, request: &HandshakeRequest, cipher: Option<&Cipher>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut data = serde_json::to_vec(request)
        .map_err(|e| Error::protocol(format!("encode handshake: {e}")))?;
    if let Some(cipher) = cipher {
        cipher.apply(&mut data);
    }
    frame::write_frame(writer, &data).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取并校验握手。失败时调用方直接关闭流，不回任何字节。
pub async fn receive<R>(
    reader: &mut R,
    cipher: Option<&Cipher>,
    key: &str,
    timeout: Duration,
) -> Result<HandshakeRequest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut data = tokio::time::timeout(timeout, frame::read_frame(reader))
        .await
        .map_err(|_| Error::protocol("handshake read timed out"))??;
    if let Some(cipher) = cipher {
        cipher.apply(&mut data);
    }
    let request: HandshakeRequest = serde_json::from_slice(&data)
        .map_err(|e| Error::protocol(format!("decode handshake: {e}")))?;
    request.validate(key, timeout, unix_now())?;
    Ok(request)
}

/// 服务端：目标连接建立后通知客户端
pub async fn acknowledge<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u8(HANDSHAKE_OK).await?;
    writer.flush().await?;
    Ok(())
}

/// 客户端：等待成功信号。流被关闭或超时都视为拒绝。
pub async fn await_ack<R>(reader: &mut R, timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let signal = tokio::time::timeout(timeout, reader.read_u8())
        .await
        .map_err(|_| Error::transport("no handshake response"))?
        .map_err(|e| Error::transport(format!("stream closed before handshake response: {e}")))?;
    if signal != HANDSHAKE_OK {
        return Err(Error::protocol(format!("unexpected handshake response: {signal}")));
    }
    Ok(())
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// 数字字段在线上以十进制字符串表示
mod decimal {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
