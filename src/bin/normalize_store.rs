//! One-time migration: rewrites every lead batch in the store into the
//! canonical `{metadata?, leads: {<name>: lead}}` shape.
//!
//! Usage: `normalize_store [--dry-run]`

use anyhow::Context;
use rust_phone_leads::config::Config;
use rust_phone_leads::snapshot::{self, normalize_tree};
use rust_phone_leads::store::{LeadStore, RtdbStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dry_run = std::env::args().skip(1).any(|arg| arg == "--dry-run");
    let config = Config::from_env()?;
    let store = RtdbStore::new(
        &config.store_url,
        config.store_auth.clone(),
        config.adapter_settings().write_timeout.max(std::time::Duration::from_secs(60)),
    )
    .context("Failed to build store client")?;

    tracing::info!("Starting lead store normalization (dry run: {})", dry_run);

    let tree = store
        .fetch_tree()
        .await
        .context("Reading the lead tree")?;
    let before = snapshot::flatten(&tree);
    tracing::info!(
        "Read {} leads ({} malformed nodes)",
        before.records.len(),
        before.malformed.len()
    );

    let (normalized, report) = normalize_tree(&tree);
    tracing::info!(
        "Batches: {} (rewritten: {}), leads: {}, dropped nodes: {}",
        report.batches,
        report.rewritten_batches,
        report.leads,
        report.dropped_nodes
    );

    let after = snapshot::flatten(&normalized);
    if after.records.len() != before.records.len() {
        anyhow::bail!(
            "Normalized tree flattens to {} leads, the store has {}; refusing to write",
            after.records.len(),
            before.records.len()
        );
    }

    if dry_run {
        tracing::info!("Dry run, nothing written");
        return Ok(());
    }
    if report.rewritten_batches == 0 && report.dropped_nodes == 0 {
        tracing::info!("Store already canonical, nothing to write");
        return Ok(());
    }

    store
        .replace_tree(&normalized)
        .await
        .context("Writing the normalized tree")?;
    tracing::info!("Normalization complete: {} leads written", after.records.len());

    Ok(())
}
