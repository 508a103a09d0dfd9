//! mender-sim - synthetic DOT feed driver for the Roadmender Sentinel.
//!
//! Usage:
//!   mender-sim generate --count 500 --fault-rate 0.1
//!   mender-sim train --count 1000 --url http://localhost:8090
//!   mender-sim detect --count 200 --fault-rate 0.2
//!   mender-sim storm --count 50000 --concurrency 8

use std::collections::HashMap;
use std::time::Instant;

use clap::{Parser, Subcommand};
use mender_sim::{EventFactory, FeedFault, LabeledEvent};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "mender-sim")]
#[command(about = "Synthetic roadway event feeds with controlled fault injection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write synthetic events to stdout as JSON lines
    Generate {
        /// Number of events
        #[arg(short, long, default_value = "100")]
        count: usize,

        /// Probability an event carries an injected fault
        #[arg(short, long, default_value = "0.0")]
        fault_rate: f64,

        /// RNG seed for reproducible streams
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Emit {event, fault} pairs instead of bare events
        #[arg(long)]
        labeled: bool,
    },

    /// Generate a clean corpus and train the sentinel on it
    Train {
        #[arg(short, long, default_value = "1000")]
        count: usize,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Sentinel base URL
        #[arg(short, long, default_value = "http://localhost:8090")]
        url: String,
    },

    /// Stream events through the detect endpoint and score the verdicts
    /// against the injected ground truth
    Detect {
        #[arg(short, long, default_value = "200")]
        count: usize,

        #[arg(short, long, default_value = "0.2")]
        fault_rate: f64,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        #[arg(short, long, default_value = "http://localhost:8090")]
        url: String,
    },

    /// Concurrent batch ingest, reporting sustained events/sec
    Storm {
        #[arg(short, long, default_value = "50000")]
        count: usize,

        /// Events per ingest request
        #[arg(short, long, default_value = "500")]
        batch_size: usize,

        /// Concurrent ingest tasks
        #[arg(long, default_value = "8")]
        concurrency: usize,

        #[arg(short, long, default_value = "0.05")]
        fault_rate: f64,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        #[arg(short, long, default_value = "http://localhost:8090")]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Generate {
            count,
            fault_rate,
            seed,
            labeled,
        } => run_generate(count, fault_rate, seed, labeled),
        Commands::Train { count, seed, url } => run_train(count, seed, &url).await,
        Commands::Detect {
            count,
            fault_rate,
            seed,
            url,
        } => run_detect(count, fault_rate, seed, &url).await,
        Commands::Storm {
            count,
            batch_size,
            concurrency,
            fault_rate,
            seed,
            url,
        } => run_storm(count, batch_size, concurrency, fault_rate, seed, &url).await,
    };

    if let Err(err) = outcome {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run_generate(
    count: usize,
    fault_rate: f64,
    seed: u64,
    labeled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut factory = EventFactory::new(seed);
    let batch = factory.batch(count, fault_rate);

    let mut faulty = 0usize;
    for entry in &batch {
        if entry.fault.is_some() {
            faulty += 1;
        }
        if labeled {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!("{}", serde_json::to_string(&entry.event)?);
        }
    }

    eprintln!(
        "generated {} events ({} faulty, rate {:.1}%)",
        count,
        faulty,
        (faulty as f64 / count.max(1) as f64) * 100.0
    );
    Ok(())
}

async fn run_train(count: usize, seed: u64, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut factory = EventFactory::new(seed);
    let corpus = factory.training_batch(count);

    eprintln!("training sentinel at {url} on {count} clean events...");
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{url}/api/ml/anomaly/train"))
        .json(&corpus)
        .send()
        .await?;

    let status = resp.status();
    let body: Value = resp.json().await?;
    if !status.is_success() {
        return Err(format!("train failed ({status}): {body}").into());
    }

    eprintln!(
        "trained: {} samples, {} states profiled, model {}",
        body["metrics"]["training_samples"],
        body["metrics"]["states_profiled"],
        body["metrics"]["model_type"]
    );
    Ok(())
}

async fn run_detect(
    count: usize,
    fault_rate: f64,
    seed: u64,
    url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut factory = EventFactory::new(seed);
    let stream = factory.batch(count, fault_rate);
    let client = reqwest::Client::new();

    // Rolling caller-side context, the way a feed poller would replay its
    // recent history with each candidate.
    let mut context: Vec<Value> = Vec::new();
    let mut true_positives = 0usize;
    let mut false_positives = 0usize;
    let mut false_negatives = 0usize;
    let mut missed_by_fault: HashMap<&'static str, usize> = HashMap::new();
    let mut injected = 0usize;

    let start = Instant::now();
    for LabeledEvent { event, fault } in &stream {
        let body: Value = client
            .post(format!("{url}/api/ml/anomaly/detect"))
            .json(&json!({ "current_event": event, "events": &context }))
            .send()
            .await?
            .json()
            .await?;
        let flagged = body["is_anomaly"].as_bool().unwrap_or(false);

        match (fault, flagged) {
            (Some(_), true) => true_positives += 1,
            (Some(f), false) => {
                false_negatives += 1;
                *missed_by_fault.entry(f.name()).or_default() += 1;
            }
            (None, true) => false_positives += 1,
            (None, false) => {}
        }
        if fault.is_some() {
            injected += 1;
        }

        context.push(serde_json::to_value(event)?);
        if context.len() > 200 {
            context.remove(0);
        }
    }

    let elapsed = start.elapsed();
    let flagged_total = true_positives + false_positives;
    eprintln!(
        "scored {} events in {:.2}s ({:.0} events/sec)",
        count,
        elapsed.as_secs_f64(),
        count as f64 / elapsed.as_secs_f64()
    );
    eprintln!(
        "injected {} faults | flagged {} | recall {:.1}% | precision {:.1}%",
        injected,
        flagged_total,
        (true_positives as f64 / injected.max(1) as f64) * 100.0,
        (true_positives as f64 / flagged_total.max(1) as f64) * 100.0
    );
    for fault in FeedFault::ALL {
        if let Some(missed) = missed_by_fault.get(fault.name()) {
            eprintln!("  missed {:>3} x {}", missed, fault.name());
        }
    }
    Ok(())
}

async fn run_storm(
    count: usize,
    batch_size: usize,
    concurrency: usize,
    fault_rate: f64,
    seed: u64,
    url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let batch_size = batch_size.max(1);
    let concurrency = concurrency.max(1);

    eprintln!(
        "storm: {count} events in batches of {batch_size} across {concurrency} tasks -> {url}/api/v1/ingest"
    );

    // Pre-generate so the wire, not the factory, is what gets measured.
    let mut factory = EventFactory::new(seed);
    let events: Vec<Value> = factory
        .batch(count, fault_rate)
        .into_iter()
        .map(|labeled| serde_json::to_value(&labeled.event))
        .collect::<Result<_, _>>()?;
    let batches: Vec<Vec<Value>> = events.chunks(batch_size).map(<[Value]>::to_vec).collect();

    let client = reqwest::Client::new();
    let start = Instant::now();
    let mut accepted = 0usize;
    let mut dropped = 0usize;

    let mut tasks = tokio::task::JoinSet::new();
    for (i, batch) in batches.into_iter().enumerate() {
        while tasks.len() >= concurrency {
            if let Some(result) = tasks.join_next().await {
                let (a, d): (usize, usize) = result??;
                accepted += a;
                dropped += d;
            }
        }

        let client = client.clone();
        let endpoint = format!("{url}/api/v1/ingest");
        tasks.spawn(async move {
            // Stagger task start so batches do not arrive in lockstep.
            if i < 16 {
                let jitter = fastrand::u64(0..20);
                tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
            }
            let body: Value = client
                .post(endpoint)
                .json(&batch)
                .send()
                .await?
                .json()
                .await?;
            Ok::<(usize, usize), reqwest::Error>((
                body["accepted"].as_u64().unwrap_or(0) as usize,
                body["dropped"].as_u64().unwrap_or(0) as usize,
            ))
        });
    }
    while let Some(result) = tasks.join_next().await {
        let (a, d): (usize, usize) = result??;
        accepted += a;
        dropped += d;
    }

    let elapsed = start.elapsed();
    eprintln!(
        "storm complete: {} accepted, {} dropped in {:.2}s ({:.0} events/sec)",
        accepted,
        dropped,
        elapsed.as_secs_f64(),
        accepted as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    Ok(())
}
