//! CLI for quanttp: serve hardware TRNG entropy over HTTP and websockets.

mod commands;

use clap::{Parser, Subcommand};

use commands::DeviceArgs;
use quanttp_core::Limits;

#[derive(Parser)]
#[command(name = "quanttp")]
#[command(about = "quanttp: raw hardware TRNG entropy over HTTP and websocket streams")]
#[command(version = quanttp_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the entropy devices discovered on this machine
    Devices {
        #[command(flatten)]
        devices: DeviceArgs,
    },

    /// Start the HTTP and websocket entropy server
    Serve {
        /// Server name reported in every response envelope
        #[arg(long, default_value = "quanttp")]
        name: String,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Largest byte draw or batch count a request may ask for
        #[arg(long, default_value = "65536")]
        max_length: usize,

        /// Largest per-element size of a hex/base64 batch or websocket chunk
        #[arg(long, default_value = "65536")]
        max_size: usize,

        /// Largest total byte count (length * size) of one hex/base64 batch
        #[arg(long, default_value = "16777216")]
        max_batch_bytes: usize,

        #[command(flatten)]
        devices: DeviceArgs,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Devices { devices } => commands::devices::run(&devices),
        Commands::Serve {
            name,
            host,
            port,
            max_length,
            max_size,
            max_batch_bytes,
            devices,
        } => {
            let limits = Limits {
                max_length,
                max_size,
                max_batch_bytes,
            };
            commands::serve::run(name, host, port, limits, &devices)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
