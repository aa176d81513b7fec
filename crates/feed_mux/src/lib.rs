//! Cross-process subscription multiplexer.
//!
//! Runs inside the one worker process holding the live protocol client and
//! deduplicates identical queries from N sibling workers into one upstream
//! subscription, reference-counted by worker id. Siblings talk to it
//! exclusively through [`MuxClient`] over channels; every call is a
//! request/response pair with its own timeout.
//!
//! After an upstream reconnect the stored entries are *not* re-subscribed
//! here — downstream topics detect staleness via their own fingerprint and
//! no-update timeouts and re-acquire.

pub mod key;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use feed_client::{FeedError, FeedUpdate, Result, SubMeta, SubscriptionHandle, UpstreamFeed};
pub use key::canonical_key;

/// How long a sibling worker waits for the mux process to answer.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Result of `acquire`: the current snapshot plus this worker's private
/// update stream. `degraded` means the upstream refused a push subscription
/// and the caller should poll instead; no entry was stored for it.
pub struct Acquired {
    pub key: String,
    pub snapshot: Value,
    pub updates: mpsc::UnboundedReceiver<FeedUpdate>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MuxEntryStats {
    pub key: String,
    pub subid: Option<String>,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MuxStats {
    pub entries: Vec<MuxEntryStats>,
}

enum MuxCmd {
    Acquire {
        query: Value,
        worker: WorkerId,
        reply: oneshot::Sender<Result<Acquired>>,
    },
    Release {
        query: Value,
        worker: WorkerId,
        reply: oneshot::Sender<()>,
    },
    Request {
        command: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Fetch {
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Stats {
        reply: oneshot::Sender<MuxStats>,
    },
}

type WorkerSet = Arc<StdMutex<HashMap<WorkerId, mpsc::UnboundedSender<FeedUpdate>>>>;

struct Entry {
    handle: SubscriptionHandle,
    workers: WorkerSet,
    relay: tokio::task::JoinHandle<()>,
}

/// Handle used by sibling workers. Cloneable; all clones talk to the same
/// mux task.
#[derive(Clone)]
pub struct MuxClient {
    tx: mpsc::Sender<MuxCmd>,
}

impl MuxClient {
    pub async fn acquire(&self, query: Value, worker: WorkerId) -> Result<Acquired> {
        let (reply, rx) = oneshot::channel();
        self.call(MuxCmd::Acquire { query, worker, reply }, rx).await?
    }

    pub async fn release(&self, query: Value, worker: WorkerId) {
        let (reply, rx) = oneshot::channel();
        let _ = self.call(MuxCmd::Release { query, worker, reply }, rx).await;
    }

    /// Miscellaneous command pass-through, correlated independently and
    /// never deduplicated.
    pub async fn request(&self, command: &str, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.call(
            MuxCmd::Request {
                command: command.to_string(),
                params,
                reply,
            },
            rx,
        )
        .await?
    }

    /// One-shot query pass-through (with the client's empty-result retry).
    pub async fn fetch(&self, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.call(MuxCmd::Fetch { params, reply }, rx).await?
    }

    pub async fn stats(&self) -> MuxStats {
        let (reply, rx) = oneshot::channel();
        self.call(MuxCmd::Stats { reply }, rx)
            .await
            .unwrap_or_default()
    }

    async fn call<T>(&self, cmd: MuxCmd, rx: oneshot::Receiver<T>) -> Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| FeedError::Connection("mux process gone".to_string()))?;
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(FeedError::Connection("mux dropped the call".to_string())),
            Err(_) => Err(FeedError::Connection("mux call timed out".to_string())),
        }
    }
}

/// Spawn the mux task around the one live upstream client and hand back the
/// sibling-facing handle.
pub fn spawn_mux(upstream: impl UpstreamFeed + 'static) -> MuxClient {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_mux(Box::new(upstream), rx));
    MuxClient { tx }
}

async fn run_mux(upstream: Box<dyn UpstreamFeed>, mut rx: mpsc::Receiver<MuxCmd>) {
    let mut entries: HashMap<String, Entry> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            MuxCmd::Acquire { query, worker, reply } => {
                let res = acquire(&*upstream, &mut entries, query, worker).await;
                let _ = reply.send(res);
            }
            MuxCmd::Release { query, worker, reply } => {
                release(&mut entries, &query, worker);
                let _ = reply.send(());
            }
            MuxCmd::Request {
                command,
                params,
                reply,
            } => {
                let _ = reply.send(upstream.request(&command, params, None).await);
            }
            MuxCmd::Fetch { params, reply } => {
                let _ = reply.send(upstream.fetch(params).await);
            }
            MuxCmd::Stats { reply } => {
                let stats = MuxStats {
                    entries: entries
                        .iter()
                        .map(|(key, e)| MuxEntryStats {
                            key: key.clone(),
                            subid: e.handle.subid().map(str::to_string),
                            workers: e.workers.lock().unwrap().len(),
                        })
                        .collect(),
                };
                let _ = reply.send(stats);
            }
        }
    }

    // Mux is going away; tear every shared subscription down.
    for (_, entry) in entries.drain() {
        entry.relay.abort();
        entry.handle.unsubscribe();
    }
}

async fn acquire(
    upstream: &dyn UpstreamFeed,
    entries: &mut HashMap<String, Entry>,
    query: Value,
    worker: WorkerId,
) -> Result<Acquired> {
    let key = canonical_key(&query);

    if let Some(entry) = entries.get(&key) {
        let (tx, updates) = mpsc::unbounded_channel();
        entry.workers.lock().unwrap().insert(worker, tx);
        debug!(key = %key, worker = %worker, "joined existing subscription");
        return Ok(Acquired {
            key,
            snapshot: entry.handle.data(),
            updates,
            degraded: false,
        });
    }

    let meta = SubMeta {
        tag: key.clone(),
        endpoint: worker.to_string(),
    };
    let handle = upstream.subscribe(query, meta).await?;
    let snapshot = handle.data();

    if handle.is_degraded() {
        // Nothing to share; the caller gets a closed update stream and
        // should poll. The next acquire tries upstream again.
        warn!(key = %key, "upstream refused subscription, not registering entry");
        let (_tx, updates) = mpsc::unbounded_channel();
        return Ok(Acquired {
            key,
            snapshot,
            updates,
            degraded: true,
        });
    }

    let (tx, updates) = mpsc::unbounded_channel();
    let workers: WorkerSet = Arc::new(StdMutex::new(HashMap::from([(worker, tx)])));

    // Relay every upstream update to every worker currently in the
    // reference set, not just the originator.
    let mut sub_updates = handle.updates();
    let relay_set = Arc::clone(&workers);
    let relay = tokio::spawn(async move {
        while let Some(upd) = sub_updates.recv().await {
            relay_set
                .lock()
                .unwrap()
                .retain(|_, tx| tx.send(upd.clone()).is_ok());
        }
    });

    info!(key = %key, subid = ?handle.subid(), worker = %worker, "shared subscription created");
    entries.insert(
        key.clone(),
        Entry {
            handle,
            workers,
            relay,
        },
    );

    Ok(Acquired {
        key,
        snapshot,
        updates,
        degraded: false,
    })
}

fn release(entries: &mut HashMap<String, Entry>, query: &Value, worker: WorkerId) {
    let key = canonical_key(query);
    let empty = match entries.get(&key) {
        Some(entry) => {
            let mut set = entry.workers.lock().unwrap();
            set.remove(&worker);
            set.is_empty()
        }
        None => {
            debug!(key = %key, worker = %worker, "release for unknown entry ignored");
            return;
        }
    };

    if empty {
        let entry = entries.remove(&key).unwrap();
        entry.relay.abort();
        entry.handle.unsubscribe();
        info!(key = %key, "last worker gone, shared subscription released");
    }
}
