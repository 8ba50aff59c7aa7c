use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod client;
mod commands;

/// Warden privilege-separation broker
///
/// `serve` runs the elevated broker host; the remaining subcommands are
/// the low-privilege client side, talking to a running broker over its
/// Unix socket.
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the elevated broker host
    Serve {
        /// Path to a JSON configuration file
        #[clap(long)]
        config: Option<String>,

        /// Socket path override
        #[clap(long)]
        socket: Option<PathBuf>,
    },

    /// List published zones and their operations
    Zones {
        /// Broker socket path
        #[clap(long)]
        socket: Option<PathBuf>,
    },

    /// Activate a zone and invoke one operation
    Call {
        /// Zone to activate
        zone: String,

        /// Operation to invoke
        operation: String,

        /// JSON input payload for the operation
        #[clap(long)]
        input: Option<String>,

        /// Broker socket path
        #[clap(long)]
        socket: Option<PathBuf>,
    },
}

fn socket_or_default(socket: Option<PathBuf>) -> PathBuf {
    socket.unwrap_or_else(warden_broker::config::default_socket_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, socket } => commands::serve::run(config, socket).await,
        Commands::Zones { socket } => commands::zone::list(socket_or_default(socket)).await,
        Commands::Call {
            zone,
            operation,
            input,
            socket,
        } => commands::zone::call(socket_or_default(socket), zone, operation, input).await,
    }
}
