//! Performance benchmarks for the hot paths of a tick

use assert_approx_eq::assert_approx_eq;
use harness::{HarnessConfig, LatencyWindow, MetricSample, TickLedger};
use protocol::{decode, encode_line, Command, InboundMessage, LineBuffer, OutboundMessage};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmarks encoding a mutation batch
#[test]
fn benchmark_batch_encoding() {
    let message = OutboundMessage::Mutations {
        agent: "agent-1".to_string(),
        tick: 1234,
        commands: vec![
            Command::new("steer", json!([0.25, 3.0])),
            Command::new("shoot", json!([120.5, 88.0])),
        ],
    };

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = encode_line(&message).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Batch encoding: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks decoding a tick push with a realistic snapshot
#[test]
fn benchmark_tick_decoding() {
    let others: Vec<_> = (0..20)
        .map(|i| json!({"Id": i, "Position": [i as f64 * 10.0, 50.0]}))
        .collect();
    let tick = InboundMessage::tick(
        77,
        json!({"Specs": {"MaxSpeed": 9.0}, "Others": others}),
    );
    let mut frame = encode_line(&tick).unwrap();
    frame.pop();

    let iterations = 20_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let message: InboundMessage = decode(&frame).unwrap();
        let _ = message.into_tick().unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Tick decoding: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks reassembling a stream of frames from small reads
#[test]
fn benchmark_line_reassembly() {
    let frames = 10_000;
    let bytes: Vec<u8> = (0..frames)
        .flat_map(|t| encode_line(&InboundMessage::tick(t, json!({"Participants": 100}))).unwrap())
        .collect();

    let start = Instant::now();
    let mut buffer = LineBuffer::new();
    let mut decoded = 0;

    for chunk in bytes.chunks(512) {
        buffer.extend(chunk);
        while buffer.next_message::<InboundMessage>().unwrap().is_some() {
            decoded += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Line reassembly: {} frames ({} bytes) in {:?}",
        decoded,
        bytes.len(),
        duration
    );

    assert_eq!(decoded, frames);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks the latency ring at one second of 100 participants at 100 Hz
#[test]
fn benchmark_latency_window() {
    let participant: Arc<str> = Arc::from("agent-1");
    let mut window = LatencyWindow::new(10_000);

    let iterations = 1_000_000u64;
    let start = Instant::now();

    for i in 0..iterations {
        window.record(MetricSample {
            participant: Arc::clone(&participant),
            tick: i,
            latency: Duration::from_micros(3000 + i % 500),
            timed_out: false,
        });
    }
    let mean = window.mean_ms();
    let std_dev = window.std_dev_ms();

    let duration = start.elapsed();
    println!(
        "Latency window: {} samples in {:?} (mean {:.3} ms, std dev {:.3} ms)",
        iterations, duration, mean, std_dev
    );

    assert_eq!(window.len(), 10_000);
    assert_approx_eq!(mean, 3.2495, 1e-6);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks stamping and matching a full tick for 100 participants
#[test]
fn benchmark_ledger_tick_cycle() {
    let config = HarnessConfig::default();
    let mut ledger = TickLedger::new(&config);
    let participants: Vec<Arc<str>> = (0..config.participants)
        .map(|n| Arc::from(format!("agent-{}", n)))
        .collect();

    let ticks = 1_000u64;
    let start = Instant::now();

    for tick in 0..ticks {
        let sent_at = Instant::now();
        for participant in &participants {
            ledger.record_send(participant, tick, sent_at);
        }
        ledger.expire(tick);

        let replied_at = sent_at + Duration::from_millis(3);
        for participant in &participants {
            ledger.record_reply(participant, tick, replied_at);
        }
    }

    let duration = start.elapsed();
    println!(
        "Ledger: {} ticks x {} participants in {:?} ({:.2} μs/tick)",
        ticks,
        participants.len(),
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    assert_eq!(ledger.in_flight(), 0);
    assert_eq!(ledger.lost(), 0);
    assert_eq!(ledger.window().timeouts(), 0);
    assert!(duration.as_secs() < 5);
}
