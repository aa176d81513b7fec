//! Round-trip tests against a local in-process WebSocket upstream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use feed_client::{ClientConfig, FeedClient, FeedError, SubMeta};

/// Spawn a scripted upstream. The handler sees every inbound request plus a
/// zero-based connection index and returns the frames to send back.
async fn spawn_upstream<F>(handler: F) -> String
where
    F: Fn(Value, u32) -> Vec<Value> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let conn_index = Arc::new(AtomicU32::new(0));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            let idx = conn_index.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut rx) = ws.split();
                while let Some(Ok(msg)) = rx.next().await {
                    if let Message::Text(txt) = msg {
                        let req: Value = match serde_json::from_str(txt.as_str()) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        for frame in handler(req.clone(), idx) {
                            let _ = sink.send(Message::Text(frame.to_string().into())).await;
                        }
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

fn session_reply(req: &Value) -> Value {
    json!({"rid": req["rid"], "code": 0, "data": {"sid": "sess-1"}})
}

#[tokio::test]
async fn handshake_and_one_shot_request() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") => vec![json!({
            "rid": req["rid"], "code": 0,
            "data": {"data": {"sport": {"1": {"name": "CS2"}}}}
        })],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    client.connect().await.unwrap();

    let data = client
        .send_request("get", json!({"source": "betting"}), None)
        .await
        .unwrap();
    assert_eq!(data["data"]["sport"]["1"]["name"], "CS2");

    let stats = client.stats().await;
    assert!(stats.connected);
    assert_eq!(stats.session.unwrap().sid, "sess-1");
    assert_eq!(stats.pending_requests, 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let sessions = Arc::new(AtomicU32::new(0));
    let s = Arc::clone(&sessions);
    let url = spawn_upstream(move |req, _| match req["command"].as_str() {
        Some("session") => {
            s.fetch_add(1, Ordering::SeqCst);
            vec![session_reply(&req)]
        }
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.connect());
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(sessions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handshake_without_sid_is_session_error() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![json!({"rid": req["rid"], "code": 0, "data": {}})],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    match client.connect().await {
        Err(FeedError::Session(_)) => {}
        other => panic!("expected session error, got {other:?}"),
    }
}

#[tokio::test]
async fn upstream_error_code_is_surfaced() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") => vec![json!({
            "rid": req["rid"], "code": 12, "data": {"message": "rate limited"}
        })],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    match client.send_request("get", json!({}), None).await {
        Err(FeedError::Upstream { code, message }) => {
            assert_eq!(code, 12);
            assert_eq!(message, "rate limited");
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn swallowed_request_times_out_without_breaking_socket() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") if req["params"]["swallow"] == true => vec![],
        Some("get") => vec![json!({
            "rid": req["rid"], "code": 0, "data": {"data": {"game": {"10": {"n": 1}}}}
        })],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let res = client
        .send_request(
            "get",
            json!({"swallow": true}),
            Some(Duration::from_millis(150)),
        )
        .await;
    assert!(matches!(res, Err(FeedError::RequestTimeout { .. })));

    // The socket is still good; the next request succeeds on the same
    // session.
    let data = client.send_request("get", json!({}), None).await.unwrap();
    assert_eq!(data["data"]["game"]["10"]["n"], 1);
    assert!(client.stats().await.connected);
}

#[tokio::test]
async fn subscribe_merges_direct_and_batched_pushes() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") => {
            assert_eq!(req["params"]["subscribe"], true);
            vec![json!({
                "rid": req["rid"], "code": 0,
                "data": {
                    "subid": "sub-9",
                    "data": {"game": {"10": {"price": "1.5", "blocked": false}}}
                }
            })]
        }
        // scripted trigger so the pushes arrive strictly after the
        // subscription is registered
        Some("nudge") => vec![
            // direct push
            json!({"subid": "sub-9", "data": {"game": {"10": {"price": "1.6"}}}}),
            // batched push; the unknown subid entry must not disturb sub-9
            json!({"rid": 0, "data": {
                "sub-9": {"game": {"10": {"blocked": true}, "11": {"price": "3.0"}}},
                "sub-unknown": {"game": {}}
            }}),
            json!({"rid": req["rid"], "code": 0, "data": {}}),
        ],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let handle = client
        .subscribe(json!({"source": "betting", "what": {"game": []}}), SubMeta::default())
        .await
        .unwrap();
    assert_eq!(handle.subid(), Some("sub-9"));
    assert_eq!(handle.data()["game"]["10"]["price"], "1.5");

    let mut updates = handle.updates();
    client.send_request("nudge", json!({}), None).await.unwrap();
    let first = updates.recv().await.unwrap();
    assert_eq!(first.snapshot["game"]["10"]["price"], "1.6");
    assert_eq!(first.snapshot["game"]["10"]["blocked"], false);

    let second = updates.recv().await.unwrap();
    assert_eq!(second.snapshot["game"]["10"]["blocked"], true);
    assert_eq!(second.snapshot["game"]["11"]["price"], "3.0");
    // previous merge survives
    assert_eq!(second.snapshot["game"]["10"]["price"], "1.6");

    let stats = client.stats().await;
    assert_eq!(stats.subscriptions.len(), 1);
    assert_eq!(stats.subscriptions[0].updates_total, 2);
}

#[tokio::test]
async fn first_delta_flushed_with_subscribe_response_is_merged() {
    // Upstream sends the first delta back to back with the subscribe
    // response, so the reader can see it before the subscription is
    // registered. It must be held and replayed, not dropped.
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") => vec![
            json!({
                "rid": req["rid"], "code": 0,
                "data": {
                    "subid": "sub-1",
                    "data": {"game": {"10": {"price": "1.5"}}}
                }
            }),
            json!({"subid": "sub-1", "data": {"game": {"10": {"price": "1.6"}}}}),
        ],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let handle = client
        .subscribe(json!({"what": {"game": []}}), SubMeta::default())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while handle.data()["game"]["10"]["price"] != "1.6" {
        assert!(
            tokio::time::Instant::now() < deadline,
            "first delta was lost, snapshot stuck at {}",
            handle.data()["game"]["10"]["price"]
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.info().updates_total, 1);
    assert_eq!(client.stats().await.dropped_frames, 0);
}

#[tokio::test]
async fn connect_failure_mid_handshake_is_shared_and_recoverable() {
    // Connection 0 dies without answering the handshake; later connections
    // behave. The reader death during the attempt must not reopen the
    // connect gate for a second concurrent dial.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dials = Arc::new(AtomicU32::new(0));
    let d = Arc::clone(&dials);
    tokio::spawn(async move {
        let mut idx = 0u32;
        while let Ok((stream, _)) = listener.accept().await {
            d.fetch_add(1, Ordering::SeqCst);
            let conn = idx;
            idx += 1;
            tokio::spawn(async move {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                if conn == 0 {
                    drop(ws);
                    return;
                }
                let (mut sink, mut rx) = ws.split();
                while let Some(Ok(Message::Text(txt))) = rx.next().await {
                    let req: Value = match serde_json::from_str(txt.as_str()) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if req["command"] == "session" {
                        let _ = sink
                            .send(Message::Text(session_reply(&req).to_string().into()))
                            .await;
                    }
                }
            });
        }
    });

    let client = FeedClient::new(ClientConfig::new(format!("ws://{addr}")));
    let (a, b) = tokio::join!(client.connect(), client.connect());
    assert!(a.is_err());
    assert!(b.is_err());
    // both callers shared the one failed dial
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    client.connect().await.unwrap();
    assert!(client.stats().await.connected);
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn subscribe_without_subid_degrades() {
    let url = spawn_upstream(|req, _| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") => vec![json!({
            "rid": req["rid"], "code": 0,
            "data": {"data": {"game": {"10": {"price": "2.0"}}}}
        })],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let handle = client
        .subscribe(json!({"what": {"game": []}}), SubMeta::default())
        .await
        .unwrap();
    assert!(handle.is_degraded());
    assert_eq!(handle.data()["game"]["10"]["price"], "2.0");
    handle.unsubscribe(); // must be a no-op
    assert!(client.stats().await.subscriptions.is_empty());
}

#[tokio::test]
async fn empty_one_shot_result_reconnects_once() {
    let url = spawn_upstream(|req, conn| match req["command"].as_str() {
        Some("session") => vec![session_reply(&req)],
        Some("get") if conn == 0 => vec![json!({
            "rid": req["rid"], "code": 0, "data": {"data": {"game": {}}}
        })],
        Some("get") => vec![json!({
            "rid": req["rid"], "code": 0,
            "data": {"data": {"game": {"10": {"price": "1.5"}}}}
        })],
        _ => vec![],
    })
    .await;

    let client = FeedClient::new(ClientConfig::new(url));
    let data = client.fetch(json!({"what": {"game": []}})).await.unwrap();
    assert_eq!(data["data"]["game"]["10"]["price"], "1.5");
}
