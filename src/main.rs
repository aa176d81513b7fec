/// OddsfeedLive — Feed Relay
///
/// What it does:
///   1. Holds the single live upstream protocol client (session + subscriptions)
///   2. Deduplicates topic queries through the subscription mux
///   3. Broadcasts fingerprint-diffed topic events to SSE consumers
///   4. Serves GET /health, /state plus the event streams
///
/// What it does NOT do: persistence, auth, horizontal scaling.
///
/// Run:
///   FEED_UPSTREAM_URL="wss://..." cargo run --bin feed-relay

use anyhow::{Context, Result};
use chrono::Utc;
use dotenv::dotenv;
use serde::Serialize;
use std::env;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use feed_client::{ClientConfig, ClientStats, FeedClient};
use feed_mux::{spawn_mux, MuxClient, MuxStats, WorkerId};
use logger::{now_iso, send_ntfy_alert, EventLogger, RelayHeartbeatEvent, SessionEvent};
use topic_broadcast::{Broadcaster, StreamMessage, TopicConfig, TopicKey, TopicStats};

/// Consecutive failed reconnects before the ops alert fires.
const ALERT_AFTER_FAILURES: u32 = 6;

#[derive(Debug, Clone, Serialize)]
struct HttpStateResponse {
    ts: String,
    client: ClientStats,
    mux: MuxStats,
    topics: Vec<TopicStats>,
}

#[derive(Clone)]
struct RelayState {
    client: FeedClient,
    mux: MuxClient,
    hub: Broadcaster,
    logger: Arc<EventLogger>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("=== OddsfeedLive Relay — UPSTREAM FEED ACTIVE ===");
    info!("Logs: ./logs/");

    // Single instance lock: exactly one live upstream session per deployment
    let lock_file_path = env::temp_dir().join("oddsfeed_relay.lock");
    let lock_file = match File::create(&lock_file_path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to create lock file at {:?}: {}", lock_file_path, e);
            return Ok(());
        }
    };

    let mut lock = fd_lock::RwLock::new(lock_file);
    let _write_guard = match lock.try_write() {
        Ok(guard) => {
            info!("Acquired single-instance lock.");
            guard
        }
        Err(_) => {
            warn!("Another instance of feed-relay is already running! Exiting.");
            return Ok(());
        }
    };

    let upstream_url = env::var("FEED_UPSTREAM_URL").context("FEED_UPSTREAM_URL not set")?;
    let bind = env::var("RELAY_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8070".to_string());
    let addr: SocketAddr = bind.parse().context("Invalid RELAY_HTTP_BIND")?;
    let worker_id = env::var("RELAY_WORKER_ID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1);
    let heartbeat_secs = env::var("RELAY_HEARTBEAT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);

    let logger = Arc::new(EventLogger::new("logs"));
    let client = FeedClient::new(ClientConfig::new(upstream_url));
    let mux = spawn_mux(client.clone());
    let hub = Broadcaster::new(
        mux.clone(),
        WorkerId(worker_id),
        TopicConfig::default(),
        Arc::clone(&logger),
    );

    let state = RelayState {
        client: client.clone(),
        mux,
        hub,
        logger: Arc::clone(&logger),
    };

    // Session supervisor: keeps the upstream connected, alerts on a
    // sustained outage
    {
        let client = client.clone();
        let logger = Arc::clone(&logger);
        tokio::spawn(async move {
            session_supervisor(client, logger).await;
        });
    }

    // Heartbeat summary
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(heartbeat_secs)).await;

                let client_stats = state.client.stats().await;
                let topics = state.hub.stats().await;
                let consumers: usize = topics.iter().map(|t| t.consumers).sum();

                let hb = RelayHeartbeatEvent {
                    ts: now_iso(),
                    event: "RELAY_HEARTBEAT",
                    topics: topics.len(),
                    consumers,
                    subscriptions: client_stats.subscriptions.len(),
                    dropped_frames: client_stats.dropped_frames,
                };
                let _ = state.logger.log(&hb);
                info!(
                    "HB: topics={}, consumers={}, subs={}, dropped={} (see logs/*.jsonl)",
                    hb.topics, hb.consumers, hb.subscriptions, hb.dropped_frames
                );
            }
        });
    }

    let listener = TcpListener::bind(addr).await.context("http bind")?;
    info!(
        "feed-relay listening on http://{} (GET /health, /state, /live/<sport>, /game/<id>, /counts/<group>)",
        addr
    );

    loop {
        let (stream, peer) = listener.accept().await.context("http accept")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_http_connection(stream, state).await {
                debug!("http handler err {}: {}", peer, e);
            }
        });
    }
}

async fn session_supervisor(client: FeedClient, logger: Arc<EventLogger>) {
    let mut was_up = false;
    let mut failures: u32 = 0;

    loop {
        match client.connect().await {
            Ok(()) => {
                if !was_up {
                    let sid = client.stats().await.session.map(|s| s.sid);
                    info!("🚀 upstream session up (sid={:?})", sid);
                    let _ = logger.log(&SessionEvent {
                        ts: now_iso(),
                        event: "SESSION_UP",
                        sid,
                        detail: "connected".to_string(),
                    });
                }
                was_up = true;
                failures = 0;
            }
            Err(e) => {
                if was_up {
                    warn!("upstream session lost: {e}");
                    let _ = logger.log(&SessionEvent {
                        ts: now_iso(),
                        event: "SESSION_LOST",
                        sid: None,
                        detail: e.to_string(),
                    });
                }
                was_up = false;
                failures += 1;
                warn!("upstream connect failed ({failures} in a row): {e}");
                if failures == ALERT_AFTER_FAILURES {
                    send_ntfy_alert(
                        &format!("feed-relay: upstream unreachable, {failures} failed reconnects: {e}"),
                        "Oddsfeed upstream outage",
                    )
                    .await;
                }
            }
        }
        sleep(Duration::from_secs(5)).await;
    }
}

async fn handle_http_connection(mut stream: TcpStream, state: RelayState) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await.context("http read")?;
    if n == 0 {
        return Ok(());
    }

    let req = String::from_utf8_lossy(&buf[..n]);
    let first_line = req.lines().next().unwrap_or_default();
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method != "GET" {
        return write_plain(&mut stream, "HTTP/1.1 405 Method Not Allowed", "method not allowed")
            .await;
    }

    if let Some(key) = parse_topic_path(path) {
        return serve_stream(stream, state, key).await;
    }

    match path {
        "/health" => write_plain(&mut stream, "HTTP/1.1 200 OK", "ok").await,
        "/state" => {
            let snap = HttpStateResponse {
                ts: Utc::now().to_rfc3339(),
                client: state.client.stats().await,
                mux: state.mux.stats().await,
                topics: state.hub.stats().await,
            };
            let json = serde_json::to_string_pretty(&snap).unwrap_or_else(|_| "{}".to_string());
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                json.len(),
                json
            );
            stream.write_all(resp.as_bytes()).await.context("http write")
        }
        _ => write_plain(&mut stream, "HTTP/1.1 404 Not Found", "not found").await,
    }
}

fn parse_topic_path(path: &str) -> Option<TopicKey> {
    let path = path.split('?').next().unwrap_or(path);
    let mut segs = path.trim_start_matches('/').splitn(2, '/');
    let (head, rest) = (segs.next()?, segs.next()?);
    match head {
        "live" => rest.parse().ok().map(|sport_id| TopicKey::SportLive { sport_id }),
        "game" => rest.parse().ok().map(|game_id| TopicKey::GameMarkets { game_id }),
        "counts" if !rest.is_empty() => Some(TopicKey::Counts {
            group: rest.to_string(),
        }),
        _ => None,
    }
}

/// Bridge one topic consumer channel onto a raw SSE response.
async fn serve_stream(mut stream: TcpStream, state: RelayState, key: TopicKey) -> Result<()> {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n";
    stream.write_all(head.as_bytes()).await.context("sse head")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamMessage>();
    let handle = state.hub.register_consumer(key.clone(), tx);
    debug!("sse consumer attached to {}", key.label());

    while let Some(msg) = rx.recv().await {
        if stream.write_all(msg.to_sse().as_bytes()).await.is_err() {
            break;
        }
        if msg.is_terminal() {
            break;
        }
    }

    handle.close();
    debug!("sse consumer detached from {}", key.label());
    Ok(())
}

async fn write_plain(stream: &mut TcpStream, status_line: &str, body: &str) -> Result<()> {
    let resp = format!(
        "{status_line}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await.context("http write")
}
