use clap::Parser;
use client::{Session, TickResult};
use log::{info, warn};
use protocol::Command;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Simulation server host
    #[arg(long, env = "SWARMHOST", default_value = "127.0.0.1")]
    host: String,

    /// Simulation server port
    #[arg(short = 'p', long, env = "SWARMPORT", default_value = "8080")]
    port: u16,

    /// Participant id announced in the handshake
    #[arg(short = 'a', long, env = "AGENTID", default_value = "participant-1")]
    agent: String,

    /// Seconds between ping requests, 0 disables them
    #[arg(long, default_value = "5")]
    ping_interval: u64,
}

/// Steers toward the top of the arena at a third of the allowed speed
fn steer(tick: u64, world: &Value) -> TickResult {
    let max_speed = world
        .pointer("/Specs/MaxSpeed")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);

    if tick % 100 == 0 {
        info!("Tick {}", tick);
    }

    Ok(vec![
        Some(Command::new("steer", json!([0.0, max_speed / 3.0]))),
        // Only shoot when something is in sight
        world
            .pointer("/Others/0/Position")
            .map(|target| Command::new("shoot", target.clone())),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    info!("Starting participant {}...", args.agent);
    info!("Connecting to: {}", addr);

    let mut session = Session::connect(&addr, &args.agent).await?;
    session.on_tick(steer)?;

    if args.ping_interval > 0 {
        let handle = session.handle();
        let period = Duration::from_secs(args.ping_interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut sequence: u64 = 0;
            while !handle.is_closed() {
                interval.tick().await;
                sequence += 1;

                let start = Instant::now();
                match handle
                    .request_timeout("ping", vec![json!(sequence)], period)
                    .await
                {
                    Ok(_) => info!(
                        "Ping {} answered in {:.2}ms",
                        sequence,
                        start.elapsed().as_secs_f64() * 1000.0
                    ),
                    Err(e) => warn!("Ping {} failed: {}", sequence, e),
                }
            }
        });
    }

    session.run().await?;
    info!("Session ended");

    Ok(())
}
