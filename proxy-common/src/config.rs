use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::Cipher;
use crate::error::{Error, Result};
use crate::transport::Protocol;

pub const DEFAULT_KEY: &str = "6w9z$C&F)J@NcRfUjXn2r4u7x!A%D*G-";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// 客户端与服务端共用的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 本地监听地址：客户端是 SOCKS5 入口，服务端是隧道入口
    pub local_addr: String,
    /// 服务端地址，仅客户端使用
    pub server_addr: String,
    pub key: String,
    pub protocol: Protocol,
    /// 私有网段直连
    pub bypass: bool,
    /// 流上负载做混淆
    pub obfs: bool,
    pub compress: bool,
    /// 空闲超时和握手时间窗口（秒）
    pub timeout: u64,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_addr: "127.0.0.1:1080".to_string(),
            server_addr: "127.0.0.1:8081".to_string(),
            key: DEFAULT_KEY.to_string(),
            protocol: Protocol::default(),
            bypass: false,
            obfs: false,
            compress: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(data)
            .map_err(|e| Error::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::config("key must not be empty"));
        }
        if self.timeout == 0 {
            return Err(Error::config("timeout must be greater than zero"));
        }
        if self.local_addr.is_empty() {
            return Err(Error::config("local_addr must not be empty"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// 开启混淆时返回由共享密钥派生的密码
    pub fn cipher(&self) -> Option<Cipher> {
        self.obfs.then(|| Cipher::new(&self.key))
    }
}
