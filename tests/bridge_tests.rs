//! Integration tests for the token bridge
//!
//! Each test starts a real bridge on ephemeral ports and talks to it with
//! the extension relay and the consumer client.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use recaptcha_bridge::relay::{BridgeCommand, GenerationKind};
use recaptcha_bridge::{
    BridgeConfig, BridgeError, ExtensionRelay, FreshTokenClient, RelayState, RunningBridge,
    TokenSource,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn test_config() -> BridgeConfig {
    BridgeConfig {
        ws_port: 0,
        http_port: 0,
        min_available: 0,
        fresh_timeout: Duration::from_secs(5),
        check_interval: Duration::from_secs(60),
        ..BridgeConfig::default()
    }
}

async fn wait_connected(bridge: &RunningBridge) {
    timeout(Duration::from_secs(5), async {
        while !bridge.server.is_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("extension never connected");
}

/// Connect an extension relay; returns the page-side ends of its channels
async fn connect_extension(
    bridge: &RunningBridge,
) -> (
    mpsc::Sender<serde_json::Value>,
    mpsc::Receiver<BridgeCommand>,
    tokio::sync::watch::Receiver<RelayState>,
) {
    let relay = ExtensionRelay::new(bridge.ws_url());
    let state = relay.subscribe_state();
    let (page_in, page_rx) = mpsc::channel(32);
    let (page_tx, page_out) = mpsc::channel(32);

    tokio::spawn(async move {
        if let Err(e) = relay.run(page_rx, page_tx).await {
            eprintln!("relay ended: {}", e);
        }
    });

    wait_connected(bridge).await;
    (page_in, page_out, state)
}

#[tokio::test]
async fn test_fresh_triggers_generation_end_to_end() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (page_in, mut page_out, mut state) = connect_extension(&bridge).await;

    // Page script: answer a generation request with a token
    tokio::spawn(async move {
        while let Some(command) = page_out.recv().await {
            if command == BridgeCommand::GenerateToken {
                page_in
                    .send(json!({"type": "VEO3_RECAPTCHA_GENERATED", "token": "abc123"}))
                    .await
                    .unwrap();
            }
        }
    });

    let client = FreshTokenClient::new(bridge.http_url(), Duration::from_secs(10)).unwrap();
    let fresh = client.fetch_fresh().await.unwrap();
    assert_eq!(fresh.token, "abc123");
    assert_eq!(fresh.source, TokenSource::Generated);

    timeout(Duration::from_secs(2), state.wait_for(|s| *s == RelayState::Idle))
        .await
        .unwrap()
        .unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_no_extension_reports_distinct_failure() {
    let bridge = RunningBridge::start(BridgeConfig {
        fresh_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await
    .unwrap();

    let client = FreshTokenClient::new(bridge.http_url(), Duration::from_secs(5)).unwrap();
    let started = std::time::Instant::now();
    let err = client.fetch_fresh().await.unwrap_err();

    assert!(matches!(err, BridgeError::NoClientConnected), "got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(300));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_connected_but_silent_extension_reports_pool_empty() {
    let bridge = RunningBridge::start(BridgeConfig {
        fresh_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await
    .unwrap();
    let (_page_in, _page_out, _state) = connect_extension(&bridge).await;

    let client = FreshTokenClient::new(bridge.http_url(), Duration::from_secs(5)).unwrap();
    let err = client.fetch_fresh().await.unwrap_err();
    assert!(matches!(err, BridgeError::PoolEmpty), "got {:?}", err);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_captured_tokens_are_single_use_and_deduplicated() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (page_in, _page_out, _state) = connect_extension(&bridge).await;

    for token in ["first", "second", "second"] {
        page_in
            .send(json!({"type": "VEO3_REQUEST_CAPTURED", "token": token}))
            .await
            .unwrap();
    }
    // Not allow-listed, never reaches the bridge
    page_in
        .send(json!({"type": "PAGE_NOISE", "token": "ignored"}))
        .await
        .unwrap();

    let client = FreshTokenClient::new(bridge.http_url(), Duration::from_secs(10)).unwrap();
    timeout(Duration::from_secs(5), async {
        while client.status().await.unwrap().pool.size < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.status().await.unwrap().pool.size, 2);

    let newest = client.fetch_fresh().await.unwrap();
    assert_eq!(newest.token, "second");
    assert_eq!(newest.source, TokenSource::Push);
    assert_eq!(client.fetch_fresh().await.unwrap().token, "first");
    assert_eq!(client.status().await.unwrap().pool.size, 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_send_one_generation_command() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (page_in, mut page_out, _state) = connect_extension(&bridge).await;

    let url = bridge.http_url();
    let mut requests = Vec::new();
    for _ in 0..3 {
        let url = url.clone();
        requests.push(tokio::spawn(async move {
            let client = FreshTokenClient::new(url, Duration::from_secs(10)).unwrap();
            client.fetch_fresh().await
        }));
    }

    let first = timeout(Duration::from_secs(5), page_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, BridgeCommand::GenerateToken);

    // Give the other callers time to (not) send their own commands
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(page_out.try_recv().is_err());

    for token in ["t1", "t2", "t3"] {
        page_in
            .send(json!({"type": "VEO3_REQUEST_CAPTURED", "token": token}))
            .await
            .unwrap();
    }

    let mut served = Vec::new();
    for request in requests {
        served.push(request.await.unwrap().unwrap().token);
    }
    served.sort();
    assert_eq!(served, vec!["t1", "t2", "t3"]);
    assert!(page_out.try_recv().is_err());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_low_pool_requests_batch_on_connect() {
    let bridge = RunningBridge::start(BridgeConfig {
        min_available: 2,
        batch_size: 4,
        ..test_config()
    })
    .await
    .unwrap();
    let (page_in, mut page_out, mut state) = connect_extension(&bridge).await;

    let command = timeout(Duration::from_secs(5), page_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command, BridgeCommand::GenerateBatch { count: 4 });
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == RelayState::Generating(GenerationKind::Batch { count: 4 })),
    )
    .await
    .unwrap()
    .unwrap();

    for i in 0..4 {
        page_in
            .send(json!({"type": "VEO3_RECAPTCHA_GENERATED", "token": format!("batch-{}", i)}))
            .await
            .unwrap();
    }
    page_in
        .send(json!({"type": "VEO3_RECAPTCHA_BATCH_DONE", "generated": 4, "failed": 0}))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), state.wait_for(|s| *s == RelayState::Idle))
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            let status = bridge.server.status().await;
            if status.pool.size == 4 && status.generating.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!bridge.server.status().await.pool.below_watermark);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (ws, _) = connect_async(bridge.ws_url()).await.unwrap();
    let (mut write, mut read) = ws.split();

    write.send(Message::Text("not json".to_string())).await.unwrap();
    write
        .send(Message::Text(r#"{"type":"token","value":"x"}"#.to_string()))
        .await
        .unwrap();
    write
        .send(Message::Text(
            r#"{"type":"VEO3_REQUEST_CAPTURED","token":""}"#.to_string(),
        ))
        .await
        .unwrap();
    write
        .send(Message::Text(
            r#"{"type":"VEO3_REQUEST_CAPTURED","value":"good"}"#.to_string(),
        ))
        .await
        .unwrap();

    let ack = timeout(Duration::from_secs(5), async {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let command: BridgeCommand = serde_json::from_str(&text).unwrap();
                    if let BridgeCommand::TokenAccepted { .. } = command {
                        return command;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(ack, BridgeCommand::TokenAccepted { pool_size: 1, inserted: true });
    assert!(bridge.server.is_connected().await);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_http_routes() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let http = reqwest::Client::new();
    let base = bridge.http_url();

    let status = http.get(format!("{}/status", base)).send().await.unwrap();
    assert_eq!(status.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = status.json().await.unwrap();
    assert_eq!(body["connected"], json!(false));

    let generate = http
        .post(format!("{}/recaptcha/generate", base))
        .json(&json!({"count": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(generate.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = generate.json().await.unwrap();
    assert_eq!(body["code"], json!("no_client_connected"));

    let bad = http
        .post(format!("{}/recaptcha/generate", base))
        .body("{oops")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

    let missing = http.get(format!("{}/nope", base)).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(
        missing.headers()["access-control-allow-origin"],
        reqwest::header::HeaderValue::from_static("*")
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_generate_endpoint_coalesces() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (_page_in, mut page_out, _state) = connect_extension(&bridge).await;
    let http = reqwest::Client::new();
    let url = format!("{}/recaptcha/generate", bridge.http_url());

    let first = http.post(&url).json(&json!({"count": 3})).send().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
    let second = http.post(&url).send().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);

    let command = timeout(Duration::from_secs(5), page_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command, BridgeCommand::GenerateBatch { count: 3 });

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_failed_batches_do_not_flood_extension() {
    let bridge = RunningBridge::start(BridgeConfig {
        min_available: 2,
        batch_size: 4,
        ..test_config()
    })
    .await
    .unwrap();
    let (page_in, mut page_out, _state) = connect_extension(&bridge).await;

    // Page script: every batch fails outright
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = page_out.recv().await {
            if let BridgeCommand::GenerateBatch { count } = command {
                let _ = seen_tx.send(command.clone());
                page_in
                    .send(json!({"type": "VEO3_RECAPTCHA_BATCH_DONE", "generated": 0, "failed": count}))
                    .await
                    .unwrap();
            }
        }
    });

    let first = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, BridgeCommand::GenerateBatch { count: 4 });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(seen_rx.try_recv().is_err(), "batch re-requested before the next tick");

    let status = bridge.server.status().await;
    assert!(status.generating.is_none());
    assert!(status.pool.below_watermark);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_generation_error_retries_within_one_fetch() {
    let bridge = RunningBridge::start(BridgeConfig {
        fresh_timeout: Duration::from_secs(3),
        ..test_config()
    })
    .await
    .unwrap();
    let (page_in, mut page_out, _state) = connect_extension(&bridge).await;

    // Page script: first attempt fails, second succeeds
    tokio::spawn(async move {
        let mut attempts = 0;
        while let Some(command) = page_out.recv().await {
            if command != BridgeCommand::GenerateToken {
                continue;
            }
            attempts += 1;
            let reply = if attempts == 1 {
                json!({"type": "VEO3_RECAPTCHA_ERROR", "error": "grecaptcha not ready"})
            } else {
                json!({"type": "VEO3_RECAPTCHA_GENERATED", "token": "abc123"})
            };
            page_in.send(reply).await.unwrap();
        }
    });

    let client = FreshTokenClient::new(bridge.http_url(), Duration::from_secs(10)).unwrap();
    let started = std::time::Instant::now();
    let fresh = client.fetch_fresh().await.unwrap();
    assert_eq!(fresh.token, "abc123");
    assert!(started.elapsed() < Duration::from_secs(2));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_extension() {
    let bridge = RunningBridge::start(test_config()).await.unwrap();
    let (_page_in, _page_out, mut state) = connect_extension(&bridge).await;
    let server = bridge.server.clone();

    bridge.shutdown().await;
    assert!(!server.is_connected().await);

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == RelayState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}
