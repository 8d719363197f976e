//! WebSocket server for the token relay extension

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use super::generation::{GenerationKind, GenerationTracker};
use super::refill::{RefillTrigger, Refiller};
use super::types::*;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::pool::{preview, TokenPool, TokenRecord, TokenSource};

/// Bridge state shared by the WebSocket handlers, the HTTP API and the
/// refill task. Cloning is cheap; all clones share the same pool.
#[derive(Clone)]
pub struct BridgeServer {
    config: BridgeConfig,
    pool: Arc<Mutex<TokenPool>>,
    /// Currently connected extension
    connection: Arc<RwLock<Option<ExtensionConnection>>>,
    generation: Arc<Mutex<GenerationTracker>>,
    /// Woken on every accepted token, every new connection and every
    /// failed single-token request
    token_arrived: Arc<Notify>,
    refiller: Arc<Refiller>,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    /// Server running flag
    running: Arc<RwLock<bool>>,
}

struct ExtensionConnection {
    id: Uuid,
    connected_at: DateTime<Utc>,
    /// Channel to the connection's writer task
    outgoing_tx: mpsc::Sender<String>,
    /// Tells the connection handler to drop the socket
    close: Arc<Notify>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig) -> Self {
        let pool = TokenPool::new(config.max_size, config.min_available, config.max_age);
        let generation = GenerationTracker::new(config.fresh_timeout);
        let refiller = Refiller::new(config.check_interval);

        Self {
            config,
            pool: Arc::new(Mutex::new(pool)),
            connection: Arc::new(RwLock::new(None)),
            generation: Arc::new(Mutex::new(generation)),
            token_arrived: Arc::new(Notify::new()),
            refiller: Arc::new(refiller),
            local_addr: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn refiller(&self) -> &Refiller {
        &self.refiller
    }

    /// Start the WebSocket server, returning the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        // Check if already running
        {
            let running = self.running.read().await;
            if *running {
                if let Some(addr) = *self.local_addr.read().await {
                    return Ok(addr);
                }
            }
        }

        let addr = self.config.ws_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BridgeError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind to {}: {}", addr, e),
            ))
        })?;
        let bound = listener.local_addr()?;

        log::info!("Token bridge listening on ws://{}", bound);

        *self.local_addr.write().await = Some(bound);
        *self.running.write().await = true;

        let server = self.clone();

        // Spawn server loop
        tokio::spawn(async move {
            loop {
                if !*server.running.read().await {
                    break;
                }

                // Accept with timeout so the running flag is rechecked
                match tokio::time::timeout(std::time::Duration::from_secs(1), listener.accept())
                    .await
                {
                    Ok(Ok((stream, addr))) => {
                        log::info!("Extension connected from: {}", addr);
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                log::error!("Connection error: {}", e);
                            }
                        });
                    }
                    Ok(Err(e)) => {
                        log::error!("Accept error: {}", e);
                    }
                    Err(_) => continue,
                }
            }
            log::info!("Token bridge stopped");
        });

        Ok(bound)
    }

    /// Stop accepting connections and drop the connected extension
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.disconnect().await;
    }

    /// Close the active extension connection, if any
    pub async fn disconnect(&self) {
        let closed = self.connection.write().await.take();
        if let Some(conn) = closed {
            log::info!("Closing extension connection {}", conn.id);
            conn.close.notify_one();
            self.generation.lock().await.clear();
        }
    }

    async fn is_current(&self, id: Uuid) -> bool {
        self.connection.read().await.as_ref().map(|c| c.id) == Some(id)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    pub async fn status(&self) -> BridgeStatus {
        let connected_at = self
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.connected_at.to_rfc3339());
        let generating = self.generation.lock().await.current(Instant::now());
        let pool = self.pool.lock().await.stats(Utc::now());

        BridgeStatus {
            connected: connected_at.is_some(),
            connected_at,
            generating,
            pool,
        }
    }

    /// Serve a fresh token, asking the extension for one if the pool is
    /// empty and waiting up to the fresh timeout for it to arrive.
    pub async fn fresh_token(&self) -> Result<TokenRecord> {
        let deadline = Instant::now() + self.config.fresh_timeout;

        loop {
            // Register before looking at the pool so a push in between is not lost
            let notified = self.token_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(token) = self.take_token().await {
                return Ok(token);
            }

            match self.request_generation(GenerationKind::Single).await {
                Ok(()) | Err(BridgeError::GenerationInProgress) => {}
                Err(BridgeError::NoClientConnected) => {
                    log::debug!("Pool empty and no extension connected, waiting");
                }
                Err(e) => log::warn!("Failed to request token generation: {}", e),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if let Ok(token) = self.take_token().await {
                    return Ok(token);
                }
                return Err(if self.is_connected().await {
                    log::warn!("No token arrived within {:?}", self.config.fresh_timeout);
                    BridgeError::PoolEmpty
                } else {
                    log::warn!("No extension connected, fresh token request timed out");
                    BridgeError::NoClientConnected
                });
            }
        }
    }

    async fn take_token(&self) -> Result<TokenRecord> {
        let token = self.pool.lock().await.take_fresh(Utc::now())?;
        log::info!("Served {} token {}", source_name(token.source), token.preview());
        self.schedule_refill();
        Ok(token)
    }

    /// Ask the extension to generate tokens, unless a request is already out
    pub async fn request_generation(&self, kind: GenerationKind) -> Result<()> {
        if !self.is_connected().await {
            return Err(BridgeError::NoClientConnected);
        }

        if !self.generation.lock().await.try_begin(kind, Instant::now()) {
            log::debug!("Generation already outstanding, coalescing {:?}", kind);
            return Err(BridgeError::GenerationInProgress);
        }

        if let Err(e) = self.send_command(&BridgeCommand::from(kind)).await {
            self.generation.lock().await.clear();
            return Err(e);
        }

        log::info!("Requested generation: {:?}", kind);
        Ok(())
    }

    /// Send a command to the connected extension
    pub async fn send_command(&self, command: &BridgeCommand) -> Result<()> {
        let outgoing_tx = match &*self.connection.read().await {
            Some(conn) => conn.outgoing_tx.clone(),
            None => return Err(BridgeError::NoClientConnected),
        };

        let json_msg = serde_json::to_string(command)?;
        outgoing_tx
            .send(json_msg)
            .await
            .map_err(|e| BridgeError::network(format!("Failed to send command: {}", e)))
    }

    /// Store a token and wake anyone waiting for one
    pub async fn ingest_token(&self, value: String, source: TokenSource) -> BridgeCommand {
        let record = TokenRecord::new(value, source);
        let token_preview = record.preview().to_string();

        let (inserted, pool_size) = {
            let mut pool = self.pool.lock().await;
            let inserted = pool.push(record);
            (inserted, pool.size())
        };

        if inserted {
            log::info!(
                "Stored {} token {} (pool size {})",
                source_name(source),
                token_preview,
                pool_size
            );
            self.token_arrived.notify_waiters();
        } else {
            log::debug!("Duplicate token {} ignored", token_preview);
        }

        BridgeCommand::TokenAccepted { pool_size, inserted }
    }

    /// Apply one inbound text frame received on connection `from`.
    /// Returns the acknowledgement to send back.
    pub async fn handle_message(&self, text: &str, from: Uuid) -> Option<BridgeCommand> {
        let message = match ExtensionMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping message: {} ({})", e, truncate(text));
                return None;
            }
        };

        log::debug!("Received {}", message.type_name());

        // A replaced connection must not settle its successor's request
        let settled = if self.is_current(from).await {
            self.generation.lock().await.observe(&message)
        } else {
            log::debug!("Message from replaced connection {}", from);
            None
        };
        if let Some(kind) = settled {
            log::debug!("Generation {:?} settled", kind);
        }

        match message {
            ExtensionMessage::RequestCaptured { token, url } => {
                if let Some(url) = url {
                    log::debug!("Token {} captured from {}", preview(&token), url);
                }
                Some(self.ingest_token(token, TokenSource::Push).await)
            }
            ExtensionMessage::RecaptchaGenerated { token } => {
                Some(self.ingest_token(token, TokenSource::Generated).await)
            }
            ExtensionMessage::RecaptchaError { error } => {
                log::warn!("Extension failed to generate token: {}", error);
                if settled == Some(GenerationKind::Single) {
                    // Waiters retry with a new request
                    self.token_arrived.notify_waiters();
                }
                None
            }
            ExtensionMessage::BatchDone { generated, failed } => {
                log::info!("Batch done: {} generated, {} failed", generated, failed);
                self.schedule_refill();
                None
            }
        }
    }

    /// Run a watermark check in the background
    pub fn schedule_refill(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            server.refiller.check(&server, RefillTrigger::Event).await;
        });
    }

    pub(crate) async fn pool_snapshot(&self) -> (bool, usize, usize) {
        let mut pool = self.pool.lock().await;
        let pruned = pool.prune_expired(Utc::now());
        if pruned > 0 {
            log::info!("Pruned {} expired tokens", pruned);
        }
        (pool.below_watermark(), pool.deficit(), pool.headroom())
    }

    /// Handle a single WebSocket connection
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| BridgeError::network(format!("WebSocket handshake failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        // Create channel for outgoing messages
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(100);

        let id = Uuid::new_v4();
        let close = Arc::new(Notify::new());
        {
            let mut conn = self.connection.write().await;
            if let Some(previous) = conn.as_ref() {
                log::info!("Replacing previous extension connection {}", previous.id);
                previous.close.notify_one();
            }
            *conn = Some(ExtensionConnection {
                id,
                connected_at: Utc::now(),
                outgoing_tx: outgoing_tx.clone(),
                close: close.clone(),
            });
        }
        // Requests sent to a previous connection will never be answered
        self.generation.lock().await.clear();

        // Spawn writer task
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                log::debug!("Sending WebSocket message: {}", truncate(&msg));
                if let Err(e) = write.send(Message::Text(msg)).await {
                    log::error!("Failed to send message: {}", e);
                    break;
                }
            }
            log::debug!("Writer task ended");
        });

        log::info!("WebSocket connection {} established", id);
        self.token_arrived.notify_waiters();
        self.schedule_refill();

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = close.notified() => {
                    log::info!("Connection {} closed by bridge", id);
                    break;
                }
            };
            let Some(msg) = msg else {
                break;
            };

            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(ack) = self.handle_message(&text, id).await {
                        match serde_json::to_string(&ack) {
                            Ok(json) => {
                                if outgoing_tx.send(json).await.is_err() {
                                    log::warn!("Writer gone, dropping acknowledgement");
                                }
                            }
                            Err(e) => log::error!("Failed to serialize ack: {}", e),
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    log::warn!("Ignoring binary frame");
                }
                Ok(Message::Close(_)) => {
                    log::info!("Extension disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        // Only clear state that still belongs to this connection
        let owned = {
            let mut conn = self.connection.write().await;
            if conn.as_ref().map(|c| c.id) == Some(id) {
                *conn = None;
                true
            } else {
                false
            }
        };
        if owned {
            self.generation.lock().await.clear();
        }

        write_handle.abort();
        log::info!("Connection handler {} finished", id);

        Ok(())
    }
}

fn source_name(source: TokenSource) -> &'static str {
    match source {
        TokenSource::Push => "captured",
        TokenSource::Generated => "generated",
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
