//! Bounded-concurrency bulk fetch with retry/backoff.
//!
//! Batch driver for reconciliation sweeps: every work unit runs through a
//! caller-supplied async fetch under a FIFO concurrency gate, with
//! exponential backoff between failed attempts. The progress callback fires
//! exactly once per unit, at its terminal success or failure.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: i64,
    pub name: String,
}

impl WorkUnit {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Concurrency gate size. The gate is FIFO: a finishing task releases
    /// the oldest waiter.
    pub concurrency: usize,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Backoff before retry `k` is `base_backoff * 2^(k-1)`; no sleep
    /// before the first attempt.
    pub base_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Terminal report for one unit, delivered through the progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub id: i64,
    pub name: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub id: i64,
    pub name: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<FailedUnit>,
}

struct UnitOutcome {
    unit: WorkUnit,
    attempts: u32,
    result: anyhow::Result<Value>,
}

/// Run one unit with retries. Returns the attempt count alongside the final
/// result.
async fn scrape_one<F, Fut>(unit: WorkUnit, opts: &FetchOptions, fetch: &F) -> UnitOutcome
where
    F: Fn(WorkUnit) -> Fut,
    Fut: Future<Output = anyhow::Result<Value>>,
{
    let max_attempts = 1 + opts.max_retries;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match fetch(unit.clone()).await {
            Ok(data) => {
                return UnitOutcome {
                    unit,
                    attempts: attempt,
                    result: Ok(data),
                };
            }
            Err(e) => {
                debug!(id = unit.id, attempt, "fetch attempt failed: {e:#}");
                last_err = Some(e);
                if attempt < max_attempts {
                    let backoff = opts.base_backoff * 2u32.pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    UnitOutcome {
        unit,
        attempts: max_attempts,
        result: Err(last_err.expect("at least one attempt ran")),
    }
}

/// Run all units under the concurrency gate and aggregate the outcome.
///
/// `on_progress` observes a gap-free completed counter: across `T` units it
/// fires exactly `T` times with completed values `{1, ..., T}`.
pub async fn scrape_all<F, Fut, P>(
    units: Vec<WorkUnit>,
    opts: FetchOptions,
    fetch: F,
    on_progress: P,
) -> Summary
where
    F: Fn(WorkUnit) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    P: FnMut(Progress) + Send + 'static,
{
    let total = units.len();
    let gate = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    // counter and callback move together so the completed sequence stays
    // gap-free under concurrent completions
    let progress = Arc::new(Mutex::new((0usize, on_progress)));
    let opts = Arc::new(opts);

    let mut tasks = JoinSet::new();
    for unit in units {
        let gate = Arc::clone(&gate);
        let fetch = fetch.clone();
        let opts = Arc::clone(&opts);
        let progress = Arc::clone(&progress);
        tasks.spawn(async move {
            let permit = gate.acquire_owned().await.expect("gate never closed");
            let outcome = scrape_one(unit, &opts, &fetch).await;
            drop(permit);

            {
                let mut p = progress.lock().unwrap();
                p.0 += 1;
                let completed = p.0;
                (p.1)(Progress {
                    completed,
                    total,
                    id: outcome.unit.id,
                    name: outcome.unit.name.clone(),
                    success: outcome.result.is_ok(),
                });
            }
            outcome
        });
    }

    let mut summary = Summary {
        total,
        ..Default::default()
    };
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(o) => o,
            Err(e) => {
                warn!("bulk fetch task panicked: {e}");
                continue;
            }
        };
        match outcome.result {
            Ok(_) => summary.succeeded += 1,
            Err(e) => {
                summary.failed += 1;
                summary.failures.push(FailedUnit {
                    id: outcome.unit.id,
                    name: outcome.unit.name,
                    error: format!("{e:#}"),
                    attempts: outcome.attempts,
                });
            }
        }
    }
    summary
}
