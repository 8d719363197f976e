//! Token pool bridge between a browser extension and HTTP consumers.
//!
//! The extension pushes reCAPTCHA tokens over a WebSocket; consumers ask
//! for a fresh one over HTTP. See [`relay`] for the server side,
//! [`extension`] for the extension relay and [`consumer`] for the client.

use std::net::SocketAddr;

use tokio::task::JoinHandle;

pub mod config;
pub mod consumer;
pub mod error;
pub mod extension;
pub mod pool;
pub mod relay;

pub use config::BridgeConfig;
pub use consumer::FreshTokenClient;
pub use error::{BridgeError, Result};
pub use extension::{ExtensionRelay, RelayState};
pub use pool::{TokenPool, TokenRecord, TokenSource};
pub use relay::{BridgeHttpApi, BridgeServer};

/// A started bridge: WebSocket server, HTTP API and refill task
pub struct RunningBridge {
    pub server: BridgeServer,
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    http_api: BridgeHttpApi,
    refill_task: JoinHandle<()>,
}

impl RunningBridge {
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let interval = config.check_interval;

        let server = BridgeServer::new(config);
        let ws_addr = server.start().await?;

        let http_api = BridgeHttpApi::new();
        let http_addr = match http_api.start(server.clone()).await {
            Ok(addr) => addr,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };

        let refill_task = relay::spawn_refill_task(server.clone(), interval);

        Ok(Self {
            server,
            ws_addr,
            http_addr,
            http_api,
            refill_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.ws_addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    pub async fn shutdown(self) {
        self.refill_task.abort();
        self.http_api.stop().await;
        self.server.stop().await;
        log::info!("Token bridge shut down");
    }
}

/// Install the log subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Run the bridge until Ctrl-C
pub async fn run(config: BridgeConfig) -> Result<()> {
    log::info!(
        "Starting token bridge (watermark {}, batch {}, capacity {})",
        config.min_available,
        config.batch_size,
        config.max_size
    );

    let bridge = RunningBridge::start(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");

    bridge.shutdown().await;
    Ok(())
}
