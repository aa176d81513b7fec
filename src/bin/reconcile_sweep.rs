/// reconcile-sweep — batch market reconciliation over the live game list
///
/// Resolves every live game with one-shot queries, then pulls each game's
/// full market tree through the bounded bulk fetcher and logs a JSONL audit
/// trail (per unit + summary). Run it offline against the same upstream the
/// relay uses; it never touches the relay's subscriptions.
///
/// Run:
///   FEED_UPSTREAM_URL="wss://..." cargo run --bin reconcile-sweep

use anyhow::{Context, Result};
use dotenv::dotenv;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use bulk_fetch::{scrape_all, FetchOptions, Progress, WorkUnit};
use feed_client::{ClientConfig, FeedClient};
use logger::{now_iso, EventLogger, ReconcileSummaryEvent, ReconcileUnitEvent};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("=== OddsfeedLive Reconcile Sweep ===");

    let upstream_url =
        std::env::var("FEED_UPSTREAM_URL").context("FEED_UPSTREAM_URL not set")?;
    let concurrency = std::env::var("RECONCILE_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(3);

    let logger = Arc::new(EventLogger::new("logs"));
    let client = FeedClient::new(ClientConfig::new(upstream_url));
    client.connect().await.context("upstream connect")?;

    // 1. Resolve the live game list
    let list = client
        .fetch(json!({
            "source": "betting",
            "what": { "game": ["id", "team1_name", "team2_name"] },
            "where": { "game": { "is_live": 1 } }
        }))
        .await
        .context("live game list fetch")?;

    let units = work_units(&list);
    if units.is_empty() {
        info!("No live games upstream, nothing to reconcile.");
        return Ok(());
    }
    info!("Reconciling markets for {} live games (concurrency {})", units.len(), concurrency);

    // 2. Pull every game's market tree under the gate
    let fetch_client = client.clone();
    let unit_logger = Arc::clone(&logger);
    let summary = scrape_all(
        units,
        FetchOptions {
            concurrency,
            ..Default::default()
        },
        move |unit: WorkUnit| {
            let client = fetch_client.clone();
            async move {
                client
                    .fetch(json!({
                        "source": "betting",
                        "what": {
                            "game": ["id", "team1_name", "team2_name", "is_blocked"],
                            "market": ["id", "name", "type", "order", "base"],
                            "event": ["id", "name", "price", "order", "type_1"]
                        },
                        "where": { "game": { "id": unit.id } }
                    }))
                    .await
                    .with_context(|| format!("markets for game {}", unit.id))
            }
        },
        move |p: Progress| {
            info!(
                "[{}/{}] {} ({}) {}",
                p.completed,
                p.total,
                p.name,
                p.id,
                if p.success { "✅" } else { "❌" }
            );
            let _ = unit_logger.log(&ReconcileUnitEvent {
                ts: now_iso(),
                event: "RECONCILE_UNIT",
                id: p.id,
                name: p.name,
                completed: p.completed,
                total: p.total,
                success: p.success,
            });
        },
    )
    .await;

    for failure in &summary.failures {
        warn!(
            "game {} ({}) failed after {} attempts: {}",
            failure.id, failure.name, failure.attempts, failure.error
        );
    }
    let _ = logger.log(&ReconcileSummaryEvent {
        ts: now_iso(),
        event: "RECONCILE_SUMMARY",
        total: summary.total,
        succeeded: summary.succeeded,
        failed: summary.failed,
    });
    info!(
        "Sweep finished: {}/{} succeeded, {} failed.",
        summary.succeeded, summary.total, summary.failed
    );

    Ok(())
}

/// One work unit per game in the list response (bare or "data"-wrapped).
fn work_units(list: &Value) -> Vec<WorkUnit> {
    let data = list.get("data").unwrap_or(list);
    let Some(games) = data.get("game").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut units = Vec::with_capacity(games.len());
    for (id, game) in games {
        let Ok(id) = id.parse::<i64>() else {
            warn!("skipping game with non-numeric id {id:?}");
            continue;
        };
        let name = format!(
            "{} vs {}",
            game.get("team1_name").and_then(Value::as_str).unwrap_or("?"),
            game.get("team2_name").and_then(Value::as_str).unwrap_or("?")
        );
        units.push(WorkUnit::new(id, name));
    }
    units.sort_by_key(|u| u.id);
    units
}
