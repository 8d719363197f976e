//! Extension-side relay
//!
//! The browser extension runs two scripts: one in the page world that sees
//! network traffic, and one in the extension world that owns the bridge
//! socket. This is the extension-world half. Page messages arrive on an
//! mpsc channel, only allow-listed types are forwarded to the bridge, and
//! generation commands from the bridge are passed back down to the page.

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{BridgeError, Result};
use crate::relay::{BridgeCommand, GenerationKind, INBOUND_TYPES};

/// Connection state as seen from the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Idle,
    Generating(GenerationKind),
}

impl RelayState {
    /// State after receiving a command from the bridge
    pub fn on_command(self, command: &BridgeCommand) -> Self {
        if self == Self::Disconnected {
            return self;
        }
        match command {
            BridgeCommand::GenerateToken => Self::Generating(GenerationKind::Single),
            BridgeCommand::GenerateBatch { count } => {
                Self::Generating(GenerationKind::Batch { count: *count })
            }
            BridgeCommand::TokenAccepted { .. } => self,
        }
    }

    /// State after forwarding a page message of the given type
    pub fn on_page_message(self, msg_type: &str) -> Self {
        match (self, msg_type) {
            (
                Self::Generating(GenerationKind::Single),
                "VEO3_RECAPTCHA_GENERATED" | "VEO3_RECAPTCHA_ERROR",
            ) => Self::Idle,
            (Self::Generating(GenerationKind::Batch { .. }), "VEO3_RECAPTCHA_BATCH_DONE") => {
                Self::Idle
            }
            _ => self,
        }
    }
}

/// Message type of a page message, if it may be relayed to the bridge
pub fn allowed_type(message: &serde_json::Value) -> Option<&str> {
    message
        .get("type")
        .and_then(|t| t.as_str())
        .filter(|t| INBOUND_TYPES.contains(t))
}

pub struct ExtensionRelay {
    url: String,
    state_tx: watch::Sender<RelayState>,
}

impl ExtensionRelay {
    pub fn new(url: impl Into<String>) -> Self {
        let (state_tx, _state_rx) = watch::channel(RelayState::Disconnected);
        Self {
            url: url.into(),
            state_tx,
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Relay state {:?} -> {:?}", previous, state);
        }
    }

    /// Connect to the bridge and relay until either side goes away.
    ///
    /// Returns `Ok(())` when the page channel closes or the bridge closes
    /// the socket cleanly.
    pub async fn run(
        &self,
        mut page_rx: mpsc::Receiver<serde_json::Value>,
        page_tx: mpsc::Sender<BridgeCommand>,
    ) -> Result<()> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::network(format!("Failed to connect to {}: {}", self.url, e)))?;

        log::info!("Connected to token bridge at {}", self.url);
        self.set_state(RelayState::Idle);

        let (mut write, mut read) = ws_stream.split();

        let result = loop {
            tokio::select! {
                page = page_rx.recv() => match page {
                    Some(message) => {
                        let Some(msg_type) = allowed_type(&message) else {
                            log::debug!("Blocked page message: {}", message);
                            continue;
                        };
                        let next = self.state().on_page_message(msg_type);
                        if let Err(e) = write.send(Message::Text(message.to_string())).await {
                            break Err(BridgeError::network(format!("Failed to relay message: {}", e)));
                        }
                        self.set_state(next);
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break Ok(());
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BridgeCommand>(&text) {
                            Ok(BridgeCommand::TokenAccepted { pool_size, inserted }) => {
                                log::debug!("Bridge accepted token (inserted: {}, pool: {})", inserted, pool_size);
                            }
                            Ok(command) => {
                                self.set_state(self.state().on_command(&command));
                                if page_tx.send(command).await.is_err() {
                                    log::warn!("Page script gone, dropping command");
                                }
                            }
                            Err(e) => log::warn!("Ignoring unknown bridge message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(BridgeError::network(format!("WebSocket error: {}", e))),
                },
            }
        };

        self.set_state(RelayState::Disconnected);
        log::info!("Disconnected from token bridge");
        result
    }
}
