/// OddsfeedLive — Logger
/// JSONL audit event stream, NTFY ops alerts

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub struct EventLogger {
    log_dir: PathBuf,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let dir = log_dir.into();
        fs::create_dir_all(&dir).ok();
        Self { log_dir: dir }
    }

    pub fn log<T: Serialize>(&self, event: &T) -> Result<()> {
        let date  = Utc::now().format("%Y-%m-%d").to_string();
        let path  = self.log_dir.join(format!("{date}.jsonl"));
        let line  = serde_json::to_string(event)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ── Event types ───────────────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub struct SessionEvent {
    pub ts:     String,
    pub event:  &'static str,      // "SESSION_UP" | "SESSION_LOST"
    pub sid:    Option<String>,
    pub detail: String,
}

#[derive(Serialize, Debug)]
pub struct SubscriptionEvent {
    pub ts:      String,
    pub event:   &'static str,     // "SUB_OPEN" | "SUB_CLOSE" | "SUB_DEGRADED"
    pub key:     String,
    pub subid:   Option<String>,
    pub workers: usize,
}

#[derive(Serialize, Debug)]
pub struct TopicLifecycleEvent {
    pub ts:        String,
    pub event:     &'static str,   // "TOPIC_OPEN" | "TOPIC_TEARDOWN"
    pub topic:     String,
    pub transport: String,         // "push" | "poll" | "none"
    pub consumers: usize,
}

#[derive(Serialize, Debug)]
pub struct ConsumerDropEvent {
    pub ts:       String,
    pub event:    &'static str,    // "CONSUMER_DROP"
    pub topic:    String,
    pub consumer: u64,
    pub reason:   String,
}

#[derive(Serialize, Debug)]
pub struct RelayHeartbeatEvent {
    pub ts:             String,
    pub event:          &'static str,  // "RELAY_HEARTBEAT"
    pub topics:         usize,
    pub consumers:      usize,
    pub subscriptions:  usize,
    pub dropped_frames: u64,
}

#[derive(Serialize, Debug)]
pub struct ReconcileUnitEvent {
    pub ts:        String,
    pub event:     &'static str,   // "RECONCILE_UNIT"
    pub id:        i64,
    pub name:      String,
    pub completed: usize,
    pub total:     usize,
    pub success:   bool,
}

#[derive(Serialize, Debug)]
pub struct ReconcileSummaryEvent {
    pub ts:        String,
    pub event:     &'static str,   // "RECONCILE_SUMMARY"
    pub total:     usize,
    pub succeeded: usize,
    pub failed:    usize,
}

/// Push a readable ops alert (sustained upstream outage etc.)
pub async fn send_ntfy_alert(msg: &str, title: &str) {
    let topic = std::env::var("NTFY_TOPIC").unwrap_or_else(|_| "oddsfeed-live".to_string());
    let client = reqwest::Client::new();
    match client
        .post(format!("https://ntfy.sh/{topic}"))
        .header("Title", title)
        .header("Priority", "high")
        .header("Tags", "satellite_antenna")
        .body(msg.to_string())
        .send()
        .await
    {
        Ok(_)  => tracing::info!("NTFY sent: {}", title),
        Err(e) => tracing::warn!("NTFY failed: {}", e),
    }
}
