//! 可选的压缩阶段（snappy raw 格式）
//!
//! 压缩后的块总是放在一个帧里发送，接收端按帧解压。

use crate::error::{Error, Result};

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| Error::protocol(format!("compress failed: {e}")))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::protocol(format!("decompress failed: {e}")))
}
