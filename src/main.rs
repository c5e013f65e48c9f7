//! batch-cache-sim: drives a tiered cache machine with a synthetic workload.
//!
//! Producers fan batches out over several channels while a consumer drains
//! them in arrival order, forcing spills whenever the fast tiers fill up.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use half::f16;
use tracing::{error, info};

use batch_cache_tier::cache::entry::EntryMetadata;
use batch_cache_tier::cache::machine::CacheMachine;
use batch_cache_tier::config::{Cli, Config};
use batch_cache_tier::{Column, TabularBatch};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "batch_cache_tier=debug,batch_cache_sim=debug"
    } else {
        "batch_cache_tier=info,batch_cache_sim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("batch-cache-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);
    info!(
        tiers = config.tiers.len(),
        total_capacity = config.total_capacity(),
        promote_on_pull = config.promotion.promote_on_pull,
        prefetch_depth = config.promotion.prefetch_depth,
        "Configuration loaded"
    );

    let machine = Arc::new(CacheMachine::new(config).await?);
    let channels: Vec<String> = (0..cli.channels.max(1)).map(|c| format!("out-{c}")).collect();

    let started = Instant::now();

    // Producers.
    let mut producers = Vec::with_capacity(cli.producers);
    for p in 0..cli.producers {
        let machine = machine.clone();
        let channels = channels.clone();
        let (batches, rows) = (cli.batches, cli.rows);
        producers.push(tokio::spawn(async move {
            for k in 0..batches {
                let channel = &channels[(p + k) % channels.len()];
                let batch = synthetic_batch(p, k, rows)?;
                let metadata = EntryMetadata::new().with("producer", p.to_string());
                machine
                    .add(channel, format!("p{p}-{k}"), batch, metadata, false)
                    .await?;
            }
            anyhow::Ok(())
        }));
    }

    // Consumer.
    let consumer = {
        let machine = machine.clone();
        let channels = channels.clone();
        tokio::spawn(async move {
            let names: Vec<&str> = channels.iter().map(String::as_str).collect();
            let mut pulled = 0usize;
            let mut rows = 0usize;
            while let Some(idx) = machine.wait_for_any(&names).await? {
                if let Some(batch) = machine.pull_next(names[idx]).await? {
                    pulled += 1;
                    rows += batch.num_rows();
                }
            }
            anyhow::Ok((pulled, rows))
        })
    };

    for producer in producers {
        if let Err(e) = producer.await? {
            error!(error = %e, "Producer failed");
        }
    }
    for channel in &channels {
        machine.mark_finished(channel);
    }

    let (pulled, rows) = consumer.await??;
    let elapsed = started.elapsed();
    info!(
        pulled,
        rows,
        elapsed_ms = elapsed.as_millis() as u64,
        "Workload complete"
    );

    for stats in machine.stats().await {
        info!(
            tier = %stats.name,
            kind = %stats.kind,
            used = stats.bytes_used,
            capacity = stats.capacity,
            entries = stats.entry_count,
            "Tier stats"
        );
    }
    machine.check_invariants().await?;

    println!("{}", machine.metrics_text()?);

    machine.shutdown().await?;
    Ok(())
}

/// A batch with an id column, a float payload and a half-precision score.
fn synthetic_batch(producer: usize, seq: usize, rows: usize) -> anyhow::Result<TabularBatch> {
    let base = (producer * 1_000_000 + seq * rows) as i64;
    let ids: Vec<i64> = (0..rows as i64).map(|r| base + r).collect();
    let values: Vec<f32> = ids.iter().map(|&id| (id % 997) as f32 * 0.5).collect();
    let scores: Vec<f16> = values.iter().map(|&v| f16::from_f32(v / 500.0)).collect();

    Ok(TabularBatch::try_new([
        ("id", Column::from_values(&ids)),
        ("value", Column::from_values(&values)),
        ("score", Column::from_values(&scores)),
    ])?)
}
