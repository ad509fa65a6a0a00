use clap::Parser;
use log::{error, info};
use server::{ConnectionSupervisor, ServerConfig, TransportKind};
use std::net::SocketAddr;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = server::config::DEFAULT_PORT)]
    port: u16,
    /// Wire framing for client connections
    #[clap(short, long, value_enum, default_value_t = TransportKind::WebSocket)]
    transport: TransportKind,
    /// Maximum number of concurrent clients
    #[clap(short, long, default_value_t = server::config::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
    /// Drop a client whose socket does not accept a snapshot for this many
    /// seconds
    #[clap(long, default_value_t = server::config::DEFAULT_WRITE_TIMEOUT.as_secs())]
    write_timeout_secs: u64,
    /// Disconnect clients that send nothing for this many seconds
    #[clap(long)]
    idle_timeout_secs: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let bind_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;

        Ok(ServerConfig {
            bind_addr,
            transport: self.transport,
            max_clients: self.max_clients,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Parses command-line arguments, starts the supervisor and runs it until
/// Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let supervisor = ConnectionSupervisor::bind(config).await?;
    let shutdown = supervisor.shutdown_handle();

    let mut server_handle = tokio::spawn(supervisor.run());

    tokio::select! {
        result = &mut server_handle => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => {
                error!("Failed to listen for Ctrl+C, running until the server stops: {}", e);
                server_handle.await?;
                return Ok(());
            }
        }
    }

    shutdown.shutdown();
    if let Err(e) = server_handle.await {
        error!("Server task panicked: {}", e);
    }

    Ok(())
}
