use clap::Parser;
use log::{error, info};
use server::network::Server;
use shared::WorldConfig;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, then runs the accept loop and the game loop
/// until one of them stops or Ctrl+C arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "9042")]
        port: u16,
        /// Map width in pixels
        #[clap(long, default_value = "500")]
        map_width: f32,
        /// Map height in pixels
        #[clap(long, default_value = "500")]
        map_height: f32,
        /// Player bounding box width in pixels
        #[clap(long, default_value = "20")]
        player_width: f32,
        /// Player bounding box height in pixels
        #[clap(long, default_value = "20")]
        player_height: f32,
        /// Player movement speed in pixels per second
        #[clap(long, default_value = "150")]
        player_speed: f32,
        /// Simulation tick interval in milliseconds
        #[clap(short, long, default_value = "10")]
        tick_interval: u64,
        /// World broadcast interval in milliseconds
        #[clap(short, long, default_value = "100")]
        broadcast_interval: u64,
    }

    env_logger::init();
    let args = Args::parse();

    let config = WorldConfig {
        map_width: args.map_width,
        map_height: args.map_height,
        player_width: args.player_width,
        player_height: args.player_height,
        player_speed: args.player_speed,
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = Arc::new(
        Server::new(
            &address,
            config,
            Duration::from_millis(args.tick_interval),
            Duration::from_millis(args.broadcast_interval),
        )
        .await?,
    );

    // Spawn accept loop
    let accept_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.accept_loop().await;
        })
    };

    // Spawn game loop
    let game_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.game_loop().await;
        })
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = accept_handle => {
            if let Err(e) = result {
                error!("Accept loop panicked: {}", e);
            }
        }
        result = game_handle => {
            if let Err(e) = result {
                error!("Game loop panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown().await;
        }
    }

    Ok(())
}
