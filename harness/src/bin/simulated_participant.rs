use clap::Parser;
use harness::{ReplyDelay, SimulatedParticipant};
use log::info;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Datagram participant that echoes every tick", long_about = None)]
struct Args {
    /// Harness host
    #[arg(long, env = "SWARMHOST", default_value = "127.0.0.1")]
    host: String,

    /// Harness port
    #[arg(short = 'p', long, env = "SWARMPORT", default_value = "8888")]
    port: u16,

    /// Participant id announced in the handshake
    #[arg(short = 'a', long, env = "AGENTID", default_value = "dummy-1")]
    agent: String,

    /// Reply delay in milliseconds
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Random extra reply delay in milliseconds
    #[arg(long, default_value = "0")]
    jitter_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server: SocketAddr = (args.host.as_str(), args.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("could not resolve {}", args.host))?;

    let delay = ReplyDelay {
        base: Duration::from_millis(args.delay_ms),
        jitter: Duration::from_millis(args.jitter_ms),
    };

    info!("Participant {} answering ticks from {}", args.agent, server);
    let participant = SimulatedParticipant::connect(server, &args.agent, delay).await?;

    tokio::select! {
        result = participant.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
