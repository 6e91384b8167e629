use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::info;
use proxy_common::cipher::generate_key;
use proxy_common::counter::{spawn_stats_logger, STATS_INTERVAL};
use proxy_common::{Config, Protocol};
use proxy_server::Server;

#[derive(Parser)]
#[command(name = "proxy-server")]
#[command(about = "Tunnel server for the SOCKS5 proxy")]
struct Args {
    /// Tunnel listen address
    #[arg(short, long, default_value = "0.0.0.0:8081")]
    local_addr: String,

    /// Shared key
    #[arg(short, long)]
    key: Option<String>,

    /// Transport protocol: ws, wss, tcp or kcp
    #[arg(short, long, default_value = "ws")]
    protocol: Protocol,

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

    /// Generate a new random key and exit
    #[arg(long)]
    generate_key: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = &self.config {
            return Ok(Config::from_file(path)?);
        }
        let mut config = Config {
            local_addr: self.local_addr,
            protocol: self.protocol,
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
    let args = Args::parse();

    if args.generate_key {
        println!("{}", generate_key());
        return Ok(());
    }

    let config = args.into_config()?;
    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let server = Server::new(config);
    if server.config().verbose {
        spawn_stats_logger(server.counters(), STATS_INTERVAL);
    }
    let listener = server.listen().await?;

    tokio::select! {
        res = server.run(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("收到退出信号，服务端关闭"),
    }
    Ok(())
}
