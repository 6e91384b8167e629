//! 长度前缀帧：4 字节小端长度 + 负载
//!
//! 用于握手报文、UDP 数据报和压缩块。

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const LENGTH_PREFIX: usize = 4;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame too large: {}", payload.len())));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// 读取一个完整的帧；长度超限按协议错误处理
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = reader.read_u32_le().await? as usize;
    if length > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame too large: {length}")));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// 在帧边界上读到 EOF 时返回 None；帧头或负载读到一半断开按协议错误处理
pub async fn read_frame_or_eof<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::protocol("truncated frame header"));
        }
        filled += n;
    }
    let length = u32::from_le_bytes(prefix) as usize;
    if length > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame too large: {length}")));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::protocol(format!("truncated frame: expected {length} bytes")),
        _ => Error::Io(e),
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_little_endian_prefix() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(&frame[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_read_consecutive_frames() {
        let mut data = Vec::new();
        data.extend_from_slice(&encode(b"first").unwrap());
        data.extend_from_slice(&encode(b"").unwrap());
        data.extend_from_slice(&encode(b"second").unwrap());

        let mut reader: &[u8] = &data;
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"");
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"second");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_and_truncated() {
        let huge = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let mut reader: &[u8] = &huge;
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Protocol(_))));

        let truncated = [10u8, 0, 0, 0, 1, 2];
        let mut reader: &[u8] = &truncated;
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_eof_only_clean_on_frame_boundary() {
        let mut reader: &[u8] = &[];
        assert_eq!(read_frame_or_eof(&mut reader).await.unwrap(), None);

        let data = encode(b"whole").unwrap();
        let mut reader: &[u8] = &data;
        assert_eq!(read_frame_or_eof(&mut reader).await.unwrap(), Some(b"whole".to_vec()));
        assert_eq!(read_frame_or_eof(&mut reader).await.unwrap(), None);

        let mut reader: &[u8] = &[5, 0];
        assert!(matches!(read_frame_or_eof(&mut reader).await, Err(Error::Protocol(_))));

        let mut reader: &[u8] = &[10, 0, 0, 0, 1, 2];
        assert!(matches!(read_frame_or_eof(&mut reader).await, Err(Error::Protocol(_))));
    }
}
