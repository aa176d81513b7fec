//! Upstream feed protocol client.
//!
//! Owns the single WebSocket, the session, the pending-request table and the
//! subscription registry. One reader task per connection demultiplexes every
//! inbound frame; all snapshot merging happens on that path, so no two
//! deltas for the same subscription are ever merged concurrently.
//!
//! Reconnection is lazy: socket error or close clears the session, and the
//! next operation that needs a live session dials again. Concurrent callers
//! awaiting a connection share a single in-flight attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::subscription::{SubInfo, SubMeta, SubscriptionFeeder, SubscriptionHandle};
use crate::wire::{
    self, classify, is_empty_result, params_with_subscribe, upstream_message, Frame, Request,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Per-subid cap on buffered early deltas.
const EARLY_DELTA_CAP: usize = 32;
/// Cap on distinct subids holding buffered early deltas.
const EARLY_SUBID_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Session handshake timeout.
    pub session_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub sid: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub connected: bool,
    pub session: Option<SessionInfo>,
    pub pending_requests: usize,
    pub subscriptions: Vec<SubInfo>,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

struct Conn {
    sink: WsSink,
    session: Option<SessionInfo>,
    /// Monotonic connection generation; a stale reader's teardown must not
    /// kill a newer connection.
    epoch: u64,
}

/// Subscription registry plus a short hold for deltas that beat their own
/// registration: upstream may flush the first push in the same segment as
/// the subscribe response, so the reader can see the delta before
/// `subscribe` has inserted the feeder. One lock covers both maps so a
/// buffered delta can never slip past a concurrent drain.
#[derive(Default)]
struct SubTable {
    feeders: HashMap<String, SubscriptionFeeder>,
    early_deltas: HashMap<String, Vec<Value>>,
}

struct ClientInner {
    cfg: ClientConfig,
    phase: watch::Sender<Phase>,
    conn: Mutex<Option<Conn>>,
    epoch_counter: AtomicU64,
    pending: StdMutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    subs: StdMutex<SubTable>,
    dropped_frames: AtomicU64,
}

/// Cloneable handle to the one live upstream client.
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<ClientInner>,
}

impl FeedClient {
    pub fn new(cfg: ClientConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                cfg,
                phase,
                conn: Mutex::new(None),
                epoch_counter: AtomicU64::new(0),
                pending: StdMutex::new(HashMap::new()),
                subs: StdMutex::new(SubTable::default()),
                dropped_frames: AtomicU64::new(0),
            }),
        }
    }

    /// Open the socket and perform the session handshake. Safe to call
    /// concurrently: every caller awaiting the same attempt gets its
    /// outcome.
    pub async fn connect(&self) -> Result<()> {
        self.inner.ensure_connected().await
    }

    /// One correlated request/response round trip. `timeout` defaults to
    /// the configured request timeout.
    pub async fn send_request(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.inner.ensure_connected().await?;
        let timeout = timeout.unwrap_or(self.inner.cfg.request_timeout);
        self.inner.request_inner(command, params, timeout).await
    }

    /// One-shot query. An empty result (no entity containers at all)
    /// triggers exactly one forced reconnect-and-retry before surfacing an
    /// error.
    pub async fn fetch(&self, params: Value) -> Result<Value> {
        let data = self.send_request(wire::CMD_GET, params.clone(), None).await?;
        if !is_empty_result(&data) {
            return Ok(data);
        }
        warn!("empty one-shot result, forcing reconnect and retrying once");
        self.inner.force_disconnect("empty result recovery").await;
        let data = self.send_request(wire::CMD_GET, params, None).await?;
        if is_empty_result(&data) {
            return Err(FeedError::Protocol(
                "empty result persisted across reconnect".to_string(),
            ));
        }
        Ok(data)
    }

    /// Create an upstream subscription. If the response carries no
    /// subscription id the call still succeeds with a degraded handle —
    /// frozen snapshot, no-op unsubscribe — signaling the caller to poll.
    pub async fn subscribe(&self, query: Value, meta: SubMeta) -> Result<SubscriptionHandle> {
        let params = params_with_subscribe(query);
        let data = self.send_request(wire::CMD_GET, params, None).await?;
        let snapshot = data.get("data").cloned().unwrap_or_else(|| json!({}));

        let subid = match data.get("subid").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                warn!(tag = %meta.tag, "subscribe returned no subid, handing out degraded handle");
                return Ok(SubscriptionHandle::degraded(snapshot, meta));
            }
        };

        let client = self.clone();
        let unsub_id = subid.clone();
        let (handle, feeder) = SubscriptionHandle::channel(&subid, snapshot, meta, move || {
            tokio::spawn(async move {
                client.unsubscribe(&unsub_id).await;
            });
        });
        {
            let mut table = self.inner.subs.lock().unwrap();
            if let Some(early) = table.early_deltas.remove(&subid) {
                debug!(subid = %subid, n = early.len(), "replaying deltas that arrived before registration");
                for delta in &early {
                    feeder.apply_delta(delta);
                }
            }
            table.feeders.insert(subid.clone(), feeder);
        }
        info!(subid = %subid, "subscription registered");
        Ok(handle)
    }

    /// Best-effort upstream notify plus local removal. Upstream failure is
    /// ignored by design.
    pub async fn unsubscribe(&self, subid: &str) {
        {
            let mut table = self.inner.subs.lock().unwrap();
            table.feeders.remove(subid);
            table.early_deltas.remove(subid);
        }
        let res = self
            .send_request(
                wire::CMD_UNSUBSCRIBE,
                json!({ "subid": subid }),
                Some(Duration::from_secs(10)),
            )
            .await;
        match res {
            Ok(_) => info!(subid = %subid, "unsubscribed upstream"),
            Err(e) => debug!(subid = %subid, "upstream unsubscribe ignored: {e}"),
        }
    }

    pub async fn stats(&self) -> ClientStats {
        let session = self
            .inner
            .conn
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.session.clone());
        ClientStats {
            connected: *self.inner.phase.borrow() == Phase::Connected,
            session,
            pending_requests: self.inner.pending.lock().unwrap().len(),
            subscriptions: self
                .inner
                .subs
                .lock()
                .unwrap()
                .feeders
                .values()
                .map(|f| f.info())
                .collect(),
            dropped_frames: self.inner.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

impl ClientInner {
    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                Phase::Connected => return Ok(()),
                Phase::Connecting => {
                    // Someone else owns the attempt; share its outcome.
                    rx.changed()
                        .await
                        .map_err(|_| FeedError::Connection("client gone".to_string()))?;
                    return match *rx.borrow_and_update() {
                        Phase::Connected => Ok(()),
                        _ => Err(FeedError::Connection(
                            "shared connect attempt failed".to_string(),
                        )),
                    };
                }
                Phase::Disconnected => {
                    let claimed = self.phase.send_if_modified(|p| {
                        if *p == Phase::Disconnected {
                            *p = Phase::Connecting;
                            true
                        } else {
                            false
                        }
                    });
                    if !claimed {
                        continue; // lost the race, wait on the winner
                    }
                    let res = self.do_connect().await;
                    match res {
                        Ok(()) => {
                            self.phase.send_replace(Phase::Connected);
                            return Ok(());
                        }
                        Err(e) => {
                            self.phase.send_replace(Phase::Disconnected);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn do_connect(self: &Arc<Self>) -> Result<()> {
        let (ws, _) = connect_async(&self.cfg.url)
            .await
            .map_err(|e| FeedError::Connection(format!("dial {}: {e}", self.cfg.url)))?;
        let (sink, stream) = ws.split();
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        *self.conn.lock().await = Some(Conn {
            sink,
            session: None,
            epoch,
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            read_loop(inner, stream, epoch).await;
        });

        // Session handshake on the fresh socket.
        let resp = self
            .request_inner(wire::CMD_SESSION, json!({ "type": "feed" }), self.cfg.session_timeout)
            .await?;
        let sid = match resp.get("sid").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => {
                self.teardown(epoch, "handshake returned no session id").await;
                return Err(FeedError::Session(
                    "response carried no session id".to_string(),
                ));
            }
        };

        if let Some(conn) = self.conn.lock().await.as_mut() {
            conn.session = Some(SessionInfo {
                sid: sid.clone(),
                created: Utc::now(),
            });
        }
        info!(sid = %sid, "upstream session established");
        Ok(())
    }

    async fn request_inner(
        self: &Arc<Self>,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let rid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(rid.clone(), tx);

        let text = Request::new(command, params, rid.clone()).to_text();
        if let Err(e) = self.send_text(&text).await {
            self.pending.lock().unwrap().remove(&rid);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(FeedError::Connection("response channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&rid);
                Err(FeedError::RequestTimeout {
                    rid,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send_text(self: &Arc<Self>, text: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| FeedError::Connection("not connected".to_string()))?;
        let epoch = conn.epoch;
        match conn.sink.send(Message::Text(text.to_string().into())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                let reason = format!("write failed: {e}");
                self.teardown(epoch, &reason).await;
                Err(FeedError::Connection(reason))
            }
        }
    }

    async fn force_disconnect(self: &Arc<Self>, reason: &str) {
        let epoch = match self.conn.lock().await.as_ref() {
            Some(c) => c.epoch,
            None => return,
        };
        self.teardown(epoch, reason).await;
    }

    /// Clear session and socket, reject every pending request. No-op when
    /// `epoch` no longer matches the live connection.
    async fn teardown(self: &Arc<Self>, epoch: u64, reason: &str) {
        {
            let mut guard = self.conn.lock().await;
            match guard.as_ref() {
                Some(c) if c.epoch == epoch => *guard = None,
                _ => return,
            }
        }
        // Only a Connected phase flips here. A Connecting phase belongs to
        // the attempt that claimed it; it resolves the phase itself once its
        // handshake fails, and stomping it would let a second caller dial
        // while the first attempt is still in flight.
        self.phase.send_if_modified(|p| {
            if *p == Phase::Connected {
                *p = Phase::Disconnected;
                true
            } else {
                false
            }
        });
        warn!("upstream connection lost: {reason}");

        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(FeedError::Connection(reason.to_string())));
        }
        // Buffered early deltas reference subids of the dead session.
        self.subs.lock().unwrap().early_deltas.clear();
    }

    fn handle_text(&self, txt: &str) {
        let value: Value = match serde_json::from_str(txt) {
            Ok(v) => v,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!("dropping unparsable frame: {e}");
                return;
            }
        };

        match classify(value) {
            Frame::Response { rid, code, data } => {
                let tx = self.pending.lock().unwrap().remove(&rid);
                match tx {
                    Some(tx) => {
                        let res = if code != 0 {
                            Err(FeedError::Upstream {
                                code,
                                message: upstream_message(&data),
                            })
                        } else {
                            Ok(data)
                        };
                        let _ = tx.send(res);
                    }
                    None => {
                        // Unmatched or duplicate rid.
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(rid = %rid, "response without pending request dropped");
                    }
                }
            }
            Frame::Push { subid, data } => self.dispatch_delta(&subid, &data),
            Frame::BatchedPush { entries } => {
                for (subid, delta) in &entries {
                    self.dispatch_delta(subid, delta);
                }
            }
            Frame::Unknown(v) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!("unclassifiable frame dropped: {v}");
            }
        }
    }

    fn dispatch_delta(&self, subid: &str, delta: &Value) {
        let mut table = self.subs.lock().unwrap();
        if let Some(feeder) = table.feeders.get(subid) {
            feeder.apply_delta(delta);
            return;
        }
        // Likely a delta racing its own subscribe response; hold it for the
        // registration about to happen.
        if !table.early_deltas.contains_key(subid) && table.early_deltas.len() >= EARLY_SUBID_CAP {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            debug!(subid = %subid, "push for unknown subscription dropped");
            return;
        }
        let buf = table.early_deltas.entry(subid.to_string()).or_default();
        if buf.len() >= EARLY_DELTA_CAP {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            debug!(subid = %subid, "early delta buffer full, dropping push");
            return;
        }
        buf.push(delta.clone());
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: WsStream, epoch: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(txt))) => inner.handle_text(txt.as_str()),
            Some(Ok(Message::Close(_))) => break "closed by upstream".to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(e)) => break format!("read error: {e}"),
            None => break "stream ended".to_string(),
        }
    };
    inner.teardown(epoch, &reason).await;
}

/// Seam between the multiplexer and the one live client, mockable in tests.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    async fn request(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value>;
    async fn fetch(&self, params: Value) -> Result<Value>;
    /// Teardown goes through the returned handle's `unsubscribe`, so the
    /// seam stays this small.
    async fn subscribe(&self, query: Value, meta: SubMeta) -> Result<SubscriptionHandle>;
}

#[async_trait]
impl UpstreamFeed for FeedClient {
    async fn request(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        FeedClient::send_request(self, command, params, timeout).await
    }

    async fn fetch(&self, params: Value) -> Result<Value> {
        FeedClient::fetch(self, params).await
    }

    async fn subscribe(&self, query: Value, meta: SubMeta) -> Result<SubscriptionHandle> {
        FeedClient::subscribe(self, query, meta).await
    }
}
