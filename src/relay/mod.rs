//! Token Relay Module
//!
//! WebSocket server the browser extension pushes captured and generated
//! tokens into, plus the HTTP API consumers call to get a fresh token.

pub mod generation;
pub mod http_api;
pub mod refill;
pub mod server;
pub mod types;

pub use generation::{GenerationKind, GenerationTracker};
pub use http_api::BridgeHttpApi;
pub use refill::{spawn_refill_task, RefillOutcome, RefillTrigger, Refiller};
pub use server::BridgeServer;
pub use types::*;
