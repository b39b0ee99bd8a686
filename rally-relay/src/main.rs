use clap::Parser;
use rally_relay::{RelayConfig, RelayServer};

#[derive(Parser)]
#[command(name = "rally-relay", about = "Relay server for live match sessions")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "RALLY_RELAY_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,
    /// Outbound frames buffered per connection
    #[arg(long, env = "RALLY_RELAY_CHANNEL_CAPACITY", default_value_t = 256)]
    channel_capacity: usize,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind,
            channel_capacity: self.channel_capacity,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = RelayServer::new(Cli::parse().into_config());
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
