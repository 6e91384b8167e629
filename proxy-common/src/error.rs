//! 错误类型
//!
//! 按照失败的来源划分：协议解析、握手认证、传输层、目标地址、资源。
//! 单个连接上的错误只影响该连接，不会终止监听循环。

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 握手认证失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// 时间戳超出允许的窗口
    #[error("handshake expired ({age}s old)")]
    Expired { age: i64 },
    /// 共享密钥不匹配
    #[error("unauthorized key")]
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum Error {
    /// SOCKS5 报文、地址字段、帧格式不合法
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// 拨号、会话建立、开流失败
    #[error("transport error: {0}")]
    Transport(String),

    /// 服务端无法连接目标地址
    #[error("destination {addr} unreachable: {source}")]
    Destination {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("listener closed")]
    ListenerClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
