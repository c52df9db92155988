use clap::Parser;
use log::{error, info};
use server::relay::{RelayConfig, VoiceRelay};
use server::world::{BotHandle, InMemoryDirectory, NoTestBots, SimTestBots};
use shared::{PlayerPosition, DEFAULT_PORT, TEST_BOT_ID_FLOOR};
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, starts the relay, and waits for Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Register synthetic test bots that bypass credential checks
        #[clap(long)]
        test_mode: bool,
    }

    env_logger::init();

    let args = Args::parse();

    let bots: BotHandle = if args.test_mode {
        let sim = SimTestBots::new();
        // A small cluster near the origin for soak-testing the fan-out path
        for i in 0..4u16 {
            let bot_id = TEST_BOT_ID_FLOOR + 1 + i;
            sim.register(bot_id, PlayerPosition::new(i as f32 * 3.0, 0.0, 1));
        }
        info!("Test mode: registered 4 synthetic bots");
        Arc::new(sim)
    } else {
        Arc::new(NoTestBots)
    };

    // TODO: swap for the live game-state directory once its RPC surface lands
    let directory = Arc::new(InMemoryDirectory::new());

    let config = RelayConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        ..RelayConfig::default()
    };

    let mut relay = VoiceRelay::new(config, directory, bots);
    match relay.start().await {
        Ok(addr) => info!("Voice relay started on {}", addr),
        Err(e) => {
            error!("Failed to start voice relay: {}", e);
            return Err(e.into());
        }
    }

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down gracefully...");
    relay.stop();

    Ok(())
}
