use std::time::Duration;

use log::debug;
use proxy_common::{Address, Result};
use tokio::net::TcpStream;

use crate::socks5::{send_reply, Reply};

/// 直连目标，原样转发字节，不经过会话也不发握手
pub async fn connect(mut socket: TcpStream, target: &Address, timeout: Duration) -> Result<()> {
    let mut remote = match tokio::time::timeout(timeout, TcpStream::connect(target.to_string())).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            debug!("直连 {} 失败: {}", target, e);
            send_reply(&mut socket, Reply::ConnectionRefused).await?;
            return Ok(());
        }
        Err(_) => {
            debug!("直连 {} 超时", target);
            send_reply(&mut socket, Reply::ConnectionRefused).await?;
            return Ok(());
        }
    };
    send_reply(&mut socket, Reply::Succeeded).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut socket, &mut remote).await?;
    debug!("直连 {} 结束，上行 {} 字节，下行 {} 字节", target, up, down);
    Ok(())
}
