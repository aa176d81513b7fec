//! Per-topic broadcast tasks and the consumer-facing hub.
//!
//! Every live topic is one tokio task owning its consumer set, transport
//! mode and fingerprint baselines. Consumers are channel senders: a failed
//! send means the downstream connection is gone, so the consumer is dropped
//! silently without disturbing the rest of the set.
//!
//! Transport: the task first tries to `acquire` a shared push subscription
//! through the mux; on failure it polls at the topic kind's cadence and
//! keeps retrying the upgrade. Push bursts are debounced into one cycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use feed_client::FeedUpdate;
use feed_mux::{MuxClient, WorkerId};
use logger::{now_iso, ConsumerDropEvent, EventLogger, TopicLifecycleEvent};

use crate::fingerprint::{fingerprint, fingerprint_each, FingerprintPolicy};
use crate::sse::{EventName, StreamMessage};
use crate::topic::{TopicConfig, TopicKey};

pub type ConsumerTx = mpsc::UnboundedSender<StreamMessage>;

/// Far enough to be "never" without overflowing `Instant + Duration`.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

enum TopicCmd {
    Register { id: u64, tx: ConsumerTx },
    Deregister { id: u64 },
    Stats { reply: oneshot::Sender<TopicStats> },
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub transport: String,
    pub consumers: usize,
    pub cycles: u64,
    pub last_event: Option<DateTime<Utc>>,
}

/// Registration handle; dropping it (or calling `close`) deregisters the
/// consumer.
pub struct ConsumerHandle {
    id: u64,
    cmd: mpsc::UnboundedSender<TopicCmd>,
    closed: bool,
}

impl ConsumerHandle {
    pub fn close(mut self) {
        self.send_close();
    }

    fn send_close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.cmd.send(TopicCmd::Deregister { id: self.id });
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.send_close();
    }
}

struct Inner {
    mux: MuxClient,
    worker: WorkerId,
    cfg: TopicConfig,
    logger: Arc<EventLogger>,
    topics: StdMutex<HashMap<TopicKey, mpsc::UnboundedSender<TopicCmd>>>,
    consumer_seq: AtomicU64,
}

/// Downstream fan-out hub: one instance per worker process.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(
        mux: MuxClient,
        worker: WorkerId,
        cfg: TopicConfig,
        logger: Arc<EventLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mux,
                worker,
                cfg,
                logger,
                topics: StdMutex::new(HashMap::new()),
                consumer_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Attach one downstream stream to a topic, creating the topic on first
    /// registration (which also cancels any pending idle teardown).
    pub fn register_consumer(&self, key: TopicKey, tx: ConsumerTx) -> ConsumerHandle {
        let id = self.inner.consumer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cmd = self.inner.register_raw(key, id, tx);
        ConsumerHandle {
            id,
            cmd,
            closed: false,
        }
    }

    pub async fn stats(&self) -> Vec<TopicStats> {
        let senders: Vec<_> = {
            let topics = self.inner.topics.lock().unwrap();
            topics.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(senders.len());
        for cmd in senders {
            let (reply, rx) = oneshot::channel();
            if cmd.send(TopicCmd::Stats { reply }).is_err() {
                continue;
            }
            if let Ok(Ok(stats)) = tokio::time::timeout(Duration::from_secs(1), rx).await {
                out.push(stats);
            }
        }
        out
    }
}

impl Inner {
    fn register_raw(
        self: &Arc<Self>,
        key: TopicKey,
        id: u64,
        tx: ConsumerTx,
    ) -> mpsc::UnboundedSender<TopicCmd> {
        let mut pending = TopicCmd::Register { id, tx };
        let mut topics = self.topics.lock().unwrap();

        if let Some(cmd) = topics.get(&key) {
            match cmd.send(pending) {
                Ok(()) => return cmd.clone(),
                // task already tore itself down; replace it
                Err(mpsc::error::SendError(ret)) => {
                    pending = ret;
                    topics.remove(&key);
                }
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let _ = cmd_tx.send(pending);
        topics.insert(key.clone(), cmd_tx.clone());

        let task = TopicTask::new(
            key,
            Arc::downgrade(self),
            self.mux.clone(),
            self.worker,
            self.cfg.clone(),
            Arc::clone(&self.logger),
            cmd_tx.clone(),
        );
        tokio::spawn(task.run(cmd_rx));
        cmd_tx
    }
}

struct Consumer {
    tx: ConsumerTx,
    last_write: Instant,
}

struct TopicTask {
    key: TopicKey,
    weak: Weak<Inner>,
    mux: MuxClient,
    worker: WorkerId,
    cfg: TopicConfig,
    logger: Arc<EventLogger>,
    cmd_tx: mpsc::UnboundedSender<TopicCmd>,

    consumers: HashMap<u64, Consumer>,
    snapshot: Option<Value>,
    fp_global: Option<String>,
    fp_entities: BTreeMap<String, String>,
    games_policy: FingerprintPolicy,
    odds_policy: FingerprintPolicy,

    cycles: u64,
    last_event: Option<DateTime<Utc>>,
    grace_at: Option<Instant>,
    debounce_at: Option<Instant>,
    pending_snapshot: Option<Value>,
    last_push: Instant,
    terminated: bool,
}

impl TopicTask {
    fn new(
        key: TopicKey,
        weak: Weak<Inner>,
        mux: MuxClient,
        worker: WorkerId,
        cfg: TopicConfig,
        logger: Arc<EventLogger>,
        cmd_tx: mpsc::UnboundedSender<TopicCmd>,
    ) -> Self {
        Self {
            key,
            weak,
            mux,
            worker,
            cfg,
            logger,
            cmd_tx,
            consumers: HashMap::new(),
            snapshot: None,
            fp_global: None,
            fp_entities: BTreeMap::new(),
            games_policy: FingerprintPolicy::default().skipping(&["market"]),
            odds_policy: FingerprintPolicy::default(),
            cycles: 0,
            last_event: None,
            grace_at: None,
            debounce_at: None,
            pending_snapshot: None,
            last_push: Instant::now(),
            terminated: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TopicCmd>) {
        let mut push_rx = self.try_acquire().await;
        let transport = if push_rx.is_some() { "push" } else { "poll" };
        info!(topic = %self.key.label(), transport, "topic opened");
        let _ = self.logger.log(&TopicLifecycleEvent {
            ts: now_iso(),
            event: "TOPIC_OPEN",
            topic: self.key.label(),
            transport: transport.to_string(),
            consumers: 0,
        });

        if push_rx.is_some() {
            if let Some(snap) = self.snapshot.clone() {
                self.prime(&snap);
            }
        }

        let mut poll = interval(self.cfg.poll_interval(&self.key));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let hb_tick = (self.cfg.heartbeat / 3).max(Duration::from_millis(50));
        let mut hb = interval(hb_tick);
        hb.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Until the first consumer registers the topic is empty; without a
        // registration the grace timer reaps it.
        self.grace_at = Some(Instant::now() + self.cfg.grace);
        let mut poll_cycles: u32 = 0;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TopicCmd::Register { id, tx }) => self.add_consumer(id, tx),
                    Some(TopicCmd::Deregister { id }) => {
                        self.consumers.remove(&id);
                        self.maybe_start_grace();
                    }
                    Some(TopicCmd::Stats { reply }) => {
                        let _ = reply.send(self.stats(push_rx.is_some()));
                    }
                    None => break,
                },

                upd = recv_push(&mut push_rx), if push_rx.is_some() => match upd {
                    Some(u) => {
                        self.last_push = Instant::now();
                        self.pending_snapshot = Some(u.snapshot);
                        // coalesce bursts into one debounced cycle
                        if self.debounce_at.is_none() {
                            self.debounce_at = Some(Instant::now() + self.cfg.debounce);
                        }
                    }
                    None => {
                        warn!(topic = %self.key.label(), "push stream closed, falling back to polling");
                        push_rx = None;
                        poll.reset();
                    }
                },

                _ = sleep_until(self.debounce_at.unwrap_or_else(far_future)),
                    if self.debounce_at.is_some() =>
                {
                    self.debounce_at = None;
                    if let Some(snap) = self.pending_snapshot.take() {
                        self.snapshot = Some(snap.clone());
                        self.cycle(&snap);
                    }
                }

                _ = poll.tick(), if push_rx.is_none() => {
                    poll_cycles += 1;
                    let mut upgraded = false;
                    if poll_cycles % self.cfg.poll_upgrade_every.max(1) == 0 {
                        if let Some(rx) = self.try_acquire().await {
                            info!(topic = %self.key.label(), "upgraded from poll to push");
                            push_rx = Some(rx);
                            self.last_push = Instant::now();
                            if let Some(snap) = self.snapshot.clone() {
                                self.cycle(&snap);
                            }
                            upgraded = true;
                        }
                    }
                    if !upgraded {
                        self.poll_cycle().await;
                    }
                }

                _ = hb.tick() => {
                    self.heartbeats();
                    if push_rx.is_some() && self.last_push.elapsed() > self.cfg.push_stale_after {
                        warn!(topic = %self.key.label(), "push subscription stale, re-acquiring");
                        self.release().await;
                        push_rx = self.try_acquire().await;
                        if push_rx.is_some() {
                            self.last_push = Instant::now();
                            // the fresh snapshot may contain changes the
                            // stale subscription never delivered
                            if let Some(snap) = self.snapshot.clone() {
                                self.cycle(&snap);
                            }
                        } else {
                            poll.reset();
                        }
                    }
                }

                _ = sleep_until(self.grace_at.unwrap_or_else(far_future)),
                    if self.grace_at.is_some() =>
                {
                    debug!(topic = %self.key.label(), "idle grace elapsed");
                    break;
                }
            }

            if self.terminated {
                break;
            }
        }

        self.teardown(cmd_rx, push_rx.is_some()).await;
    }

    // ── consumer management ─────────────────────────────────────────────

    fn add_consumer(&mut self, id: u64, tx: ConsumerTx) {
        self.grace_at = None;

        // ready + replay of the current view, to this consumer only
        let mut msgs = vec![StreamMessage::event(
            EventName::Ready,
            json!({ "topic": self.key.label() }),
        )];
        if let Some(snap) = &self.snapshot {
            msgs.extend(self.full_events(snap));
        }
        for msg in msgs {
            if tx.send(msg).is_err() {
                debug!(topic = %self.key.label(), consumer = id, "consumer gone before ready");
                self.maybe_start_grace();
                return;
            }
        }

        self.consumers.insert(
            id,
            Consumer {
                tx,
                last_write: Instant::now(),
            },
        );
    }

    fn drop_consumer(&mut self, id: u64, reason: &str) {
        if self.consumers.remove(&id).is_some() {
            debug!(topic = %self.key.label(), consumer = id, "consumer dropped: {reason}");
            let _ = self.logger.log(&ConsumerDropEvent {
                ts: now_iso(),
                event: "CONSUMER_DROP",
                topic: self.key.label(),
                consumer: id,
                reason: reason.to_string(),
            });
        }
    }

    fn maybe_start_grace(&mut self) {
        if self.consumers.is_empty() && self.grace_at.is_none() {
            self.grace_at = Some(Instant::now() + self.cfg.grace);
        }
    }

    // ── update cycles ───────────────────────────────────────────────────

    fn cycle(&mut self, data: &Value) {
        self.cycles += 1;
        let events = self.diff_events(data);
        if events.is_empty() {
            // fingerprint-equal cycle: heartbeat only
            self.broadcast(&[StreamMessage::ping()]);
        } else {
            self.last_event = Some(Utc::now());
            self.broadcast(&events);
        }
    }

    /// Events for the parts of `data` whose fingerprints moved; updates the
    /// baselines.
    fn diff_events(&mut self, data: &Value) -> Vec<StreamMessage> {
        let mut events = Vec::new();
        match &self.key {
            TopicKey::SportLive { sport_id } => {
                let games = data.get("game").cloned().unwrap_or_else(|| json!({}));
                let games_fp = fingerprint(&games, &self.games_policy);
                if self.fp_global.as_deref() != Some(games_fp.as_str()) {
                    events.push(StreamMessage::event(
                        EventName::Games,
                        json!({ "sport_id": sport_id, "games": strip_markets(&games) }),
                    ));
                    self.fp_global = Some(games_fp);
                }

                let per_game = fingerprint_each(&games, "market", &self.odds_policy);
                for (gid, fp) in &per_game {
                    if self.fp_entities.get(gid) != Some(fp) {
                        events.push(StreamMessage::event(
                            EventName::Odds,
                            json!({
                                "game_id": gid,
                                "markets": games.get(gid).and_then(|g| g.get("market"))
                                    .cloned().unwrap_or_else(|| json!({}))
                            }),
                        ));
                    }
                }
                self.fp_entities = per_game;
            }

            TopicKey::GameMarkets { game_id } => {
                let empty = match data.get("game") {
                    Some(Value::Object(m)) => m.is_empty(),
                    _ => true,
                };
                if empty {
                    // game disappeared upstream: terminal end for everyone
                    events.push(StreamMessage::event(
                        EventName::End,
                        json!({ "topic": self.key.label(), "game_id": game_id }),
                    ));
                    self.terminated = true;
                    return events;
                }
                let game = data.get("game").cloned().unwrap_or_else(|| json!({}));
                let fp = fingerprint(&game, &self.odds_policy);
                if self.fp_global.as_deref() != Some(fp.as_str()) {
                    events.push(StreamMessage::event(
                        EventName::Game,
                        json!({ "game_id": game_id, "game": game }),
                    ));
                    self.fp_global = Some(fp);
                }
            }

            TopicKey::Counts { group } => {
                let sports = data.get("sport").cloned().unwrap_or_else(|| json!({}));
                let fp = fingerprint(&sports, &self.odds_policy);
                if self.fp_global.as_deref() != Some(fp.as_str()) {
                    events.push(StreamMessage::event(
                        EventName::Counts,
                        json!({ "group": group, "sport": sports }),
                    ));
                    self.fp_global = Some(fp);
                }
            }
        }
        events
    }

    /// Seed the fingerprint baselines from the acquire snapshot. Consumers
    /// see that same view through registration replay, so no diff events
    /// are due for it.
    fn prime(&mut self, data: &Value) {
        match &self.key {
            TopicKey::SportLive { .. } => {
                let games = data.get("game").cloned().unwrap_or_else(|| json!({}));
                self.fp_global = Some(fingerprint(&games, &self.games_policy));
                self.fp_entities = fingerprint_each(&games, "market", &self.odds_policy);
            }
            TopicKey::GameMarkets { .. } => {
                if let Some(game @ Value::Object(_)) = data.get("game") {
                    self.fp_global = Some(fingerprint(game, &self.odds_policy));
                }
            }
            TopicKey::Counts { .. } => {
                let sports = data.get("sport").cloned().unwrap_or_else(|| json!({}));
                self.fp_global = Some(fingerprint(&sports, &self.odds_policy));
            }
        }
    }

    /// Full (non-diffed) view of `data`, used to bring a fresh consumer up
    /// to date without touching the shared baselines.
    fn full_events(&self, data: &Value) -> Vec<StreamMessage> {
        let mut events = Vec::new();
        match &self.key {
            TopicKey::SportLive { sport_id } => {
                let games = data.get("game").cloned().unwrap_or_else(|| json!({}));
                events.push(StreamMessage::event(
                    EventName::Games,
                    json!({ "sport_id": sport_id, "games": strip_markets(&games) }),
                ));
                if let Value::Object(map) = &games {
                    for (gid, game) in map {
                        if let Some(markets) = game.get("market") {
                            events.push(StreamMessage::event(
                                EventName::Odds,
                                json!({ "game_id": gid, "markets": markets }),
                            ));
                        }
                    }
                }
            }
            TopicKey::GameMarkets { game_id } => {
                if let Some(game @ Value::Object(_)) = data.get("game") {
                    events.push(StreamMessage::event(
                        EventName::Game,
                        json!({ "game_id": game_id, "game": game }),
                    ));
                }
            }
            TopicKey::Counts { group } => {
                let sports = data.get("sport").cloned().unwrap_or_else(|| json!({}));
                events.push(StreamMessage::event(
                    EventName::Counts,
                    json!({ "group": group, "sport": sports }),
                ));
            }
        }
        events
    }

    async fn poll_cycle(&mut self) {
        match self.mux.fetch(self.key.query()).await {
            Ok(resp) => {
                // one-shot responses may carry the entity container bare or
                // under a "data" wrapper
                let data = resp.get("data").cloned().unwrap_or(resp);
                self.snapshot = Some(data.clone());
                self.cycle(&data);
            }
            Err(e) => {
                warn!(topic = %self.key.label(), "poll cycle failed: {e}");
                self.broadcast(&[StreamMessage::event(
                    EventName::Error,
                    json!({ "topic": self.key.label(), "message": e.to_string() }),
                )]);
            }
        }
    }

    /// Write a batch to every consumer; a failed write drops that consumer
    /// and nobody else.
    fn broadcast(&mut self, events: &[StreamMessage]) {
        let mut dead = Vec::new();
        for (id, consumer) in &mut self.consumers {
            let mut ok = true;
            for ev in events {
                if consumer.tx.send(ev.clone()).is_err() {
                    ok = false;
                    break;
                }
            }
            if ok {
                consumer.last_write = Instant::now();
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            self.drop_consumer(id, "write failed");
        }
        self.maybe_start_grace();
    }

    /// Ping consumers that have not been written to for a full heartbeat
    /// period, so proxies keep the stream open and dead peers surface.
    fn heartbeats(&mut self) {
        let idle: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.last_write.elapsed() >= self.cfg.heartbeat)
            .map(|(id, _)| *id)
            .collect();
        let mut dead = Vec::new();
        for id in idle {
            if let Some(consumer) = self.consumers.get_mut(&id) {
                if consumer.tx.send(StreamMessage::ping()).is_ok() {
                    consumer.last_write = Instant::now();
                } else {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.drop_consumer(id, "heartbeat write failed");
        }
        self.maybe_start_grace();
    }

    // ── transport ───────────────────────────────────────────────────────

    async fn try_acquire(&mut self) -> Option<mpsc::UnboundedReceiver<FeedUpdate>> {
        match self.mux.acquire(self.key.query(), self.worker).await {
            Ok(acq) if !acq.degraded => {
                self.snapshot = Some(acq.snapshot);
                Some(acq.updates)
            }
            Ok(_) => {
                debug!(topic = %self.key.label(), "push refused upstream, polling");
                None
            }
            Err(e) => {
                warn!(topic = %self.key.label(), "acquire failed: {e}");
                None
            }
        }
    }

    async fn release(&mut self) {
        self.mux.release(self.key.query(), self.worker).await;
    }

    fn stats(&self, push: bool) -> TopicStats {
        TopicStats {
            topic: self.key.label(),
            transport: if push { "push" } else { "poll" }.to_string(),
            consumers: self.consumers.len(),
            cycles: self.cycles,
            last_event: self.last_event,
        }
    }

    async fn teardown(self, mut cmd_rx: mpsc::UnboundedReceiver<TopicCmd>, was_push: bool) {
        if let Some(inner) = self.weak.upgrade() {
            {
                let mut topics = inner.topics.lock().unwrap();
                let ours = topics
                    .get(&self.key)
                    .is_some_and(|tx| tx.same_channel(&self.cmd_tx));
                if ours {
                    topics.remove(&self.key);
                }
            }
            // a register racing with teardown gets re-routed to a fresh task
            cmd_rx.close();
            while let Ok(cmd) = cmd_rx.try_recv() {
                if let TopicCmd::Register { id, tx } = cmd {
                    inner.register_raw(self.key.clone(), id, tx);
                }
            }
        }

        if was_push {
            self.mux.release(self.key.query(), self.worker).await;
        }
        info!(topic = %self.key.label(), "topic torn down");
        let _ = self.logger.log(&TopicLifecycleEvent {
            ts: now_iso(),
            event: "TOPIC_TEARDOWN",
            topic: self.key.label(),
            transport: if was_push { "push" } else { "poll" }.to_string(),
            consumers: self.consumers.len(),
        });
    }
}

async fn recv_push(rx: &mut Option<mpsc::UnboundedReceiver<FeedUpdate>>) -> Option<FeedUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn strip_markets(games: &Value) -> Value {
    let mut out = games.clone();
    if let Value::Object(map) = &mut out {
        for game in map.values_mut() {
            if let Value::Object(g) = game {
                g.remove("market");
            }
        }
    }
    out
}
