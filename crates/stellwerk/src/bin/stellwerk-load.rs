//! stellwerk-load — synthetic load driver for the optimizer stack.
//!
//! Submits a mixed-priority batch of scheduler jobs that exercise a
//! memoization cache and a buffer pool, offloads a round of requests to
//! the worker units, then prints a metrics snapshot as JSON and
//! terminates cleanly.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use stellwerk::{Optimizer, Priority, StellwerkConfig, StellwerkError, UnitWorker};

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic load driver for the stellwerk scheduler and dispatcher.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-load", version, about)]
struct Cli {
    /// Path to stellwerk.toml config file.
    #[arg(long, env = "STELLWERK_CONFIG", default_value = "config/stellwerk.toml")]
    config: String,

    /// Scheduler jobs to submit, spread across all priority classes.
    #[arg(long, env = "STELLWERK_LOAD_ITEMS", default_value_t = 200)]
    items: usize,

    /// Requests to offload to the worker units.
    #[arg(long, env = "STELLWERK_LOAD_OFFLOADS", default_value_t = 64)]
    offloads: usize,
}

// ── Load worker ─────────────────────────────────────────────────────

/// CPU-bound stand-in for a real offloaded computation.
struct HashWorker;

impl UnitWorker for HashWorker {
    type Request = u64;
    type Response = u64;

    fn process(&self, seed: u64) -> Result<u64, StellwerkError> {
        let mut acc = seed;
        for _ in 0..10_000 {
            acc = mix(acc);
        }
        Ok(acc)
    }
}

/// splitmix64 finalizer, enough work to be measurable.
fn mix(seed: u64) -> u64 {
    let mut x = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^ (x >> 29)
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match StellwerkConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded stellwerk config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config,
                "failed to load config, using defaults"
            );
            StellwerkConfig::default()
        }
    };

    let optimizer = Optimizer::new(config, HashWorker)?;

    let cache = Arc::new(optimizer.memo_cache("mix", |seed: &u64| mix(*seed)));
    let pool = Arc::new(optimizer.resource_pool(
        "buffers",
        || Vec::<u8>::with_capacity(1024),
        |buf| buf.clear(),
    ));

    info!(items = cli.items, offloads = cli.offloads, "driving load");

    // Mixed-priority scheduler jobs. Repeating cache arguments so some
    // calls hit; each job borrows and returns a pooled buffer.
    let mut scheduled = Vec::with_capacity(cli.items);
    for i in 0..cli.items {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let cache = Arc::clone(&cache);
        let pool = Arc::clone(&pool);
        let seed = (i % 16) as u64;

        let handle = optimizer.submit(priority, move || {
            let digest = cache.call(&seed);
            let mut buf = pool.acquire();
            buf.extend_from_slice(&digest.to_le_bytes());
            let sum: u64 = buf.iter().map(|b| *b as u64).sum();
            pool.release(buf);
            Ok(sum)
        })?;
        scheduled.push(handle);
    }

    let offloaded: Vec<_> = (0..cli.offloads)
        .map(|i| optimizer.offload(i as u64))
        .collect();

    let mut completed = 0usize;
    let mut failed = 0usize;
    for handle in scheduled {
        match handle.wait().await {
            Ok(_) => completed += 1,
            Err(_) => failed += 1,
        }
    }
    for handle in offloaded {
        match handle.wait().await {
            Ok(_) => completed += 1,
            Err(_) => failed += 1,
        }
    }
    info!(completed, failed, "load drained");

    let snapshot = optimizer.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    optimizer.terminate().await;
    info!("stellwerk-load exited cleanly");
    Ok(())
}
