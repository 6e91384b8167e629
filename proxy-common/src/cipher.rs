use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use ctr::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// 混淆用的对称流密码
///
/// 密钥由共享口令做 SHA-256 得到，IV 固定为零。
/// 只提供混淆，不提供机密性和完整性保护。
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// 为一个方向的数据流创建独立的密钥流，跨 chunk 连续
    pub fn keystream(&self) -> Keystream {
        Keystream(Aes256Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&ZERO_IV),
        ))
    }

    /// 一次性变换：握手报文、单个 UDP 数据报
    pub fn apply(&self, data: &mut [u8]) {
        self.keystream().apply(data);
    }

    pub fn xor(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

pub struct Keystream(Aes256Ctr);

impl Keystream {
    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// 生成随机共享密钥（base64 编码的 32 字节）
pub fn generate_key() -> String {
    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill(&mut key_bytes);
    STANDARD.encode(key_bytes)
}

/// 握手里的随机串，只用于增加熵和日志关联
pub fn random_nonce() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(8..16);
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
