use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::info;
use proxy_client::Client;
use proxy_common::counter::{spawn_stats_logger, STATS_INTERVAL};
use proxy_common::{Config, Protocol};

#[derive(Parser)]
#[command(name = "proxy-client")]
#[command(about = "SOCKS5 proxy client tunnelling through a multiplexed session")]
struct Args {
    /// SOCKS5 listen address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    local_addr: String,

    /// Tunnel server address
    #[arg(short, long, default_value = "127.0.0.1:8081")]
    server_addr: String,

    /// Shared key
    #[arg(short, long)]
    key: Option<String>,

    /// Transport protocol: ws, wss, tcp or kcp
    #[arg(short, long, default_value = "ws")]
    protocol: Protocol,

    /// Connect to private addresses directly
    #[arg(long)]
    bypass: bool,

    /// Obfuscate stream payloads
    #[arg(long)]
    obfs: bool,

    /// Compress stream payloads
    #[arg(long)]
    compress: bool,

    /// Idle and handshake timeout in seconds
    #[arg(short, long, default_value_t = 60)]
    timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Load configuration from a JSON file instead of flags
    #[arg(short, long)]
    config: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = &self.config {
            return Ok(Config::from_file(path)?);
        }
        let mut config = Config {
            local_addr: self.local_addr,
            server_addr: self.server_addr,
            protocol: self.protocol,
            bypass: self.bypass,
            obfs: self.obfs,
            compress: self.compress,
            timeout: self.timeout,
            verbose: self.verbose,
            ..Config::default()
        };
        if let Some(key) = self.key {
            config.key = key;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let client = Client::new(config);
    if client.config().verbose {
        spawn_stats_logger(client.counters(), STATS_INTERVAL);
    }
    let listener = client.listen().await?;

    tokio::select! {
        res = client.run(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("收到退出信号，客户端关闭"),
    }
    Ok(())
}
