//! Subscription state shared between the client's reader task and callers.
//!
//! The snapshot tree is mutated only through [`SubscriptionFeeder::apply_delta`],
//! which runs on the inbound-message path. Callers observe it through
//! [`SubscriptionHandle`]: cloned snapshots and channel-based update fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::merge::merge_delta;

/// One upstream update: the full merged snapshot plus the raw delta that
/// produced it.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub snapshot: Value,
    pub delta: Value,
}

/// Caller-supplied metadata, kept for the stats surface.
#[derive(Debug, Clone, Default)]
pub struct SubMeta {
    pub tag: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubInfo {
    pub subid: Option<String>,
    pub tag: String,
    pub endpoint: String,
    pub updates_total: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

struct SubShared {
    snapshot: Mutex<Value>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<FeedUpdate>>>,
    updates_total: AtomicU64,
    last_update: Mutex<Option<DateTime<Utc>>>,
    created: DateTime<Utc>,
    meta: SubMeta,
}

type UnsubFn = Box<dyn FnOnce() + Send>;

/// Handle returned from `subscribe`.
///
/// A degraded handle (no subscription id upstream) carries a frozen snapshot,
/// never receives updates, and has a no-op `unsubscribe` — callers treat it
/// as a signal to fall back to polling.
pub struct SubscriptionHandle {
    subid: Option<String>,
    shared: Arc<SubShared>,
    unsub: Mutex<Option<UnsubFn>>,
}

impl SubscriptionHandle {
    /// Live subscription: returns the handle plus the feeder the inbound
    /// path uses to merge deltas into it.
    pub fn channel(
        subid: impl Into<String>,
        snapshot: Value,
        meta: SubMeta,
        unsub: impl FnOnce() + Send + 'static,
    ) -> (Self, SubscriptionFeeder) {
        let subid = subid.into();
        let shared = Arc::new(SubShared {
            snapshot: Mutex::new(snapshot),
            listeners: Mutex::new(Vec::new()),
            updates_total: AtomicU64::new(0),
            last_update: Mutex::new(None),
            created: Utc::now(),
            meta,
        });
        let handle = Self {
            subid: Some(subid.clone()),
            shared: Arc::clone(&shared),
            unsub: Mutex::new(Some(Box::new(unsub))),
        };
        (handle, SubscriptionFeeder { subid, shared })
    }

    /// Frozen-snapshot fallback handle for a subscribe that returned no id.
    pub fn degraded(snapshot: Value, meta: SubMeta) -> Self {
        Self {
            subid: None,
            shared: Arc::new(SubShared {
                snapshot: Mutex::new(snapshot),
                listeners: Mutex::new(Vec::new()),
                updates_total: AtomicU64::new(0),
                last_update: Mutex::new(None),
                created: Utc::now(),
                meta,
            }),
            unsub: Mutex::new(None),
        }
    }

    pub fn subid(&self) -> Option<&str> {
        self.subid.as_deref()
    }

    pub fn is_degraded(&self) -> bool {
        self.subid.is_none()
    }

    /// Clone of the current merged snapshot.
    pub fn data(&self) -> Value {
        self.shared.snapshot.lock().unwrap().clone()
    }

    /// Register a new update listener. Dead receivers are pruned on the
    /// next fan-out.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<FeedUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Best-effort teardown. No-op on degraded handles and on repeated
    /// calls.
    pub fn unsubscribe(&self) {
        if let Some(f) = self.unsub.lock().unwrap().take() {
            f();
        }
    }

    pub fn info(&self) -> SubInfo {
        let s = &self.shared;
        SubInfo {
            subid: self.subid.clone(),
            tag: s.meta.tag.clone(),
            endpoint: s.meta.endpoint.clone(),
            updates_total: s.updates_total.load(Ordering::Relaxed),
            last_update: *s.last_update.lock().unwrap(),
            created: s.created,
        }
    }
}

/// Writer side of a live subscription, owned by the client's inbound path.
pub struct SubscriptionFeeder {
    subid: String,
    shared: Arc<SubShared>,
}

impl SubscriptionFeeder {
    pub fn subid(&self) -> &str {
        &self.subid
    }

    /// Merge one delta into the snapshot and fan the result out to every
    /// live listener. Listeners whose receiver is gone are dropped here.
    pub fn apply_delta(&self, delta: &Value) {
        let snapshot = {
            let mut snap = self.shared.snapshot.lock().unwrap();
            merge_delta(&mut snap, delta);
            snap.clone()
        };
        self.shared.updates_total.fetch_add(1, Ordering::Relaxed);
        *self.shared.last_update.lock().unwrap() = Some(Utc::now());

        let mut listeners = self.shared.listeners.lock().unwrap();
        listeners.retain(|tx| {
            tx.send(FeedUpdate {
                snapshot: snapshot.clone(),
                delta: delta.clone(),
            })
            .is_ok()
        });
    }

    pub fn info(&self) -> SubInfo {
        let s = &self.shared;
        SubInfo {
            subid: Some(self.subid.clone()),
            tag: s.meta.tag.clone(),
            endpoint: s.meta.endpoint.clone(),
            updates_total: s.updates_total.load(Ordering::Relaxed),
            last_update: *s.last_update.lock().unwrap(),
            created: s.created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn feeder_merges_and_fans_out() {
        let (handle, feeder) = SubscriptionHandle::channel(
            "7",
            json!({"game": {"10": {"price": "1.5"}}}),
            SubMeta::default(),
            || {},
        );
        let mut rx = handle.updates();

        feeder.apply_delta(&json!({"game": {"10": {"price": "1.6"}}}));
        let upd = rx.recv().await.unwrap();
        assert_eq!(upd.snapshot["game"]["10"]["price"], "1.6");
        assert_eq!(upd.delta["game"]["10"]["price"], "1.6");
        assert_eq!(handle.data()["game"]["10"]["price"], "1.6");
        assert_eq!(handle.info().updates_total, 1);
    }

    #[tokio::test]
    async fn dead_listener_is_pruned() {
        let (handle, feeder) =
            SubscriptionHandle::channel("7", json!({}), SubMeta::default(), || {});
        let rx = handle.updates();
        drop(rx);
        feeder.apply_delta(&json!({"a": 1}));
        // second apply exercises the pruned list
        feeder.apply_delta(&json!({"a": 2}));
        assert_eq!(handle.data()["a"], 2);
    }

    #[test]
    fn degraded_handle_is_frozen_and_noop() {
        let handle = SubscriptionHandle::degraded(json!({"game": {}}), SubMeta::default());
        assert!(handle.is_degraded());
        assert!(handle.subid().is_none());
        handle.unsubscribe(); // no-op
        assert_eq!(handle.data(), json!({"game": {}}));
    }

    #[test]
    fn unsubscribe_fires_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let (handle, _feeder) =
            SubscriptionHandle::channel("7", json!({}), SubMeta::default(), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
