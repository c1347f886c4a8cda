use clap::Parser;
use relay::network::Relay;
use std::time::Duration;

/// Session relay for rescue-sync peers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value = "7777")]
    port: u16,
    /// Upper bound on the capacity of any session
    #[arg(short, long, default_value = "3")]
    max_peers: usize,
    /// Seconds without a heartbeat before a peer is dropped
    #[arg(short, long, default_value_t = shared::PEER_TIMEOUT_SECS)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let mut relay = Relay::bind(&address, args.max_peers, Duration::from_secs(args.timeout)).await?;
    relay.run().await?;

    Ok(())
}
