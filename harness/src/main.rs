use clap::{Parser, ValueEnum};
use client::{Session, TickResult};
use harness::{spawn_fleet, HarnessConfig, HarnessSummary, LoadHarness, ReplyDelay, StreamHarness};
use log::{error, info, warn};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// One JSON record per datagram
    Udp,
    /// Line-delimited session protocol
    Tcp,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport participants connect with
    #[arg(long, value_enum, default_value = "udp")]
    transport: Transport,

    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8888")]
    port: u16,

    /// Participants to wait for before ticking
    #[arg(short = 'n', long, default_value = "100")]
    participants: usize,

    /// Tick rate (ticks per second)
    #[arg(short, long, default_value = "100")]
    tick_rate: u32,

    /// Fraction of the tick period after which a reply is a timeout
    #[arg(long, default_value = "0.6")]
    timeout_ratio: f64,

    /// Milliseconds between latency reports
    #[arg(long, default_value = "1000")]
    report_ms: u64,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Milliseconds to wait for late replies after the last tick
    #[arg(long, default_value = "500")]
    drain_ms: u64,

    /// Spawn the participants in-process
    #[arg(long)]
    spawn_local: bool,

    /// Reply delay of spawned participants in milliseconds (udp only)
    #[arg(long, default_value = "3")]
    delay_ms: u64,

    /// Random extra reply delay of spawned participants in milliseconds (udp only)
    #[arg(long, default_value = "0")]
    jitter_ms: u64,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            participants: self.participants,
            ticks_per_second: self.tick_rate,
            timeout_ratio: self.timeout_ratio,
            report_interval: Duration::from_millis(self.report_ms),
            max_ticks: self.ticks,
            drain_period: Duration::from_millis(self.drain_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.config();

    info!("Starting harness...");
    info!(
        "{} participants at {} ticks/s, timeout after {:?}",
        config.participants,
        config.ticks_per_second,
        config.timeout_threshold()
    );

    let summary = match args.transport {
        Transport::Udp => run_datagram(&args, config).await?,
        Transport::Tcp => run_stream(&args, config).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    Ok(())
}

async fn run_datagram(
    args: &Args,
    config: HarnessConfig,
) -> Result<HarnessSummary, Box<dyn std::error::Error>> {
    let harness = LoadHarness::bind(config).await?;
    let shutdown = harness.shutdown_handle();

    let mut fleet = Vec::new();
    if args.spawn_local {
        let delay = ReplyDelay {
            base: Duration::from_millis(args.delay_ms),
            jitter: Duration::from_millis(args.jitter_ms),
        };
        fleet = spawn_fleet(harness.local_addr()?, "sim", args.participants, delay).await?;
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    });

    let summary = harness.run().await?;

    for participant in fleet {
        participant.abort();
    }

    Ok(summary)
}

async fn run_stream(
    args: &Args,
    config: HarnessConfig,
) -> Result<HarnessSummary, Box<dyn std::error::Error>> {
    let harness = StreamHarness::bind(config).await?;
    let shutdown = harness.shutdown_handle();
    let addr = harness.local_addr().to_string();

    let mut sessions = Vec::new();
    if args.spawn_local {
        if args.delay_ms > 0 || args.jitter_ms > 0 {
            warn!("Reply delays only apply to udp participants");
        }

        for n in 0..args.participants {
            let mut session = Session::connect(&addr, &format!("session-{}", n)).await?;
            session.on_tick(|_tick: u64, _world: &Value| -> TickResult { Ok(Vec::new()) })?;
            sessions.push(session);
        }
        info!("Connected {} local sessions", sessions.len());
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    });

    let summary = harness.run().await?;

    for session in sessions {
        session.close();
        if let Err(e) = session.run().await {
            error!("Local session failed: {}", e);
        }
    }

    Ok(summary)
}
