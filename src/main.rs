use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{scope, sleep};
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam::channel::unbounded;
use readahead::dispatch::{handler_fn, DispatchCounts, Dispatcher, Feedback, ItemOutcome, TimeSummary, TimeTotals};
use readahead::{BufferConfig, RayonSpawner, ReadAheadBuffer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Drains a simulated slow source through a read-ahead buffer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Number of values the source yields before signaling completion
    #[arg(long, default_value_t = 200)]
    items: u64,
    /// Time each fetch from the source takes
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,
    /// Make every n-th fetch fail (0 disables failures)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,
    /// Number of dispatch loops draining the buffer concurrently
    #[arg(long, default_value_t = 4)]
    consumers: usize,
    /// Time each dispatch loop spends on one item
    #[arg(long, default_value_t = 5)]
    work_ms: u64,
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    padding: i64,
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    decay_interval: i64,
    /// Produce on a fixed rayon pool instead of one thread per fetch
    #[arg(long)]
    pool_threads: Option<usize>,
    /// Log a checkpoint every n processed items per loop
    #[arg(long, default_value_t = 50)]
    checkpoint_every: usize,
}

fn main() -> readahead::Result<()> {
    init_tracing();
    let args = Args::parse();

    let cursor = AtomicU64::new(0);
    let (items, fail_every, latency) = (args.items, args.fail_every, Duration::from_millis(args.latency_ms));
    let builder = ReadAheadBuffer::builder()
        .producer(move || {
            let idx = cursor.fetch_add(1, Ordering::Relaxed);
            sleep(latency);
            if idx >= items {
                return Ok(None);
            }
            if fail_every > 0 && (idx + 1) % fail_every == 0 {
                return Err(format!("fetch {idx} failed"));
            }
            Ok(Some(idx))
        })
        .config(BufferConfig::new(args.padding, args.decay_interval));
    let builder = match args.pool_threads {
        Some(threads) => builder.spawner(RayonSpawner::with_threads(threads)?),
        None => builder,
    };
    let buffer = builder.build()?;
    info!(?args, "starting dispatch");

    let started = Instant::now();
    let (tx, rx) = unbounded();
    scope(|s| {
        for id in 0..args.consumers {
            let (buffer, tx) = (buffer.clone(), tx.clone());
            let (work, checkpoint) = (Duration::from_millis(args.work_ms), args.checkpoint_every);
            s.spawn(move || {
                let handler = handler_fn(move |item: u64, _: &mut dyn TimeSummary| {
                    sleep(work);
                    if item % 97 == 96 {
                        return ItemOutcome::SkipItem(format!("item {item} is blacklisted"));
                    }
                    ItemOutcome::Continue
                });
                let mut dispatcher =
                    Dispatcher::new(buffer, handler).with_periodic(checkpoint, move || info!(consumer = id, "checkpoint"));
                loop {
                    match dispatcher.run() {
                        Feedback::Pause => warn!(consumer = id, "dispatch paused, resuming"),
                        Feedback::Continue => {}
                        Feedback::Finish | Feedback::Abort => break,
                    }
                }
                let _ = tx.send((id, dispatcher.counts(), dispatcher.into_summary()));
            });
        }
    });
    drop(tx);

    let elapsed = started.elapsed();
    let mut totals = TimeTotals::new();
    let mut all = DispatchCounts::default();
    let mut reports = rx.iter().collect::<Vec<_>>();
    reports.sort_by_key(|(id, _, _)| *id);
    for (id, counts, summary) in reports {
        println!(
            "consumer {id:>2}: processed {:>5}, skipped {:>4}, fetch errors {:>4}",
            counts.processed, counts.skipped, counts.fetch_errors
        );
        all.processed += counts.processed;
        all.skipped += counts.skipped;
        all.fetch_errors += counts.fetch_errors;
        totals.merge(&summary);
    }
    println!(
        "total: processed {}, skipped {}, fetch errors {} in {elapsed:.3?}",
        all.processed, all.skipped, all.fetch_errors
    );
    for (flag, phase) in totals.iter() {
        println!(
            "{:<22} total {:>10.3?} avg {:>10.3?} ({} samples)",
            flag.to_string(),
            phase.total,
            phase.average(),
            phase.samples
        );
    }
    println!("final buffer state: {:?}", buffer.stats());
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
