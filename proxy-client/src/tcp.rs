//! CONNECT：经隧道转发，或在开启 bypass 时直连私有网段

use log::{debug, warn};
use proxy_common::protocol::Network;
use proxy_common::{relay, Address, Result};
use tokio::net::TcpStream;

use crate::socks5::{send_reply, Reply};
use crate::{direct, Client};

/// 是否绕过隧道直连
pub fn should_bypass(bypass: bool, target: &Address) -> bool {
    bypass && target.is_private()
}

pub async fn handle_connect(client: &Client, mut socket: TcpStream, target: Address) -> Result<()> {
    if should_bypass(client.config().bypass, &target) {
        debug!("直连私有地址 {}", target);
        return direct::connect(socket, &target, client.config().timeout()).await;
    }

    let stream = match client.open_tunnel(Network::Tcp, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("连接 {} 失败: {}", target, e);
            send_reply(&mut socket, Reply::ConnectionRefused).await?;
            return Ok(());
        }
    };
    send_reply(&mut socket, Reply::Succeeded).await?;
    debug!("隧道已建立: {}", target);

    relay::relay(socket, stream, client.pipe_options()).await;
    Ok(())
}
