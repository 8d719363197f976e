//! HTTP API for token consumers
//!
//! `GET /recaptcha/fresh` hands out a single-use token, waiting for the
//! extension to generate one if the pool is empty.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use super::generation::GenerationKind;
use super::server::BridgeServer;
use super::types::*;
use crate::error::{BridgeError, Result};

/// HTTP API server for token consumers
pub struct BridgeHttpApi {
    running: Arc<RwLock<bool>>,
}

impl BridgeHttpApi {
    pub fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the HTTP API server, returning the bound address
    pub async fn start(&self, bridge: BridgeServer) -> Result<SocketAddr> {
        let addr = bridge.config().http_addr();

        // Check if already running
        {
            let running = self.running.read().await;
            if *running {
                return Err(BridgeError::config("HTTP API already running"));
            }
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BridgeError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind HTTP server to {}: {}", addr, e),
            ))
        })?;
        let bound = listener.local_addr()?;

        log::info!("Token HTTP API listening on http://{}", bound);

        *self.running.write().await = true;
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }

                // Accept connections with timeout
                match tokio::time::timeout(std::time::Duration::from_secs(1), listener.accept())
                    .await
                {
                    Ok(Ok((stream, _addr))) => {
                        let bridge = bridge.clone();
                        let io = TokioIo::new(stream);

                        tokio::spawn(async move {
                            let service =
                                service_fn(move |req| handle_request(req, bridge.clone()));

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await
                            {
                                log::error!("HTTP connection error: {}", e);
                            }
                        });
                    }
                    Ok(Err(e)) => {
                        log::error!("HTTP accept error: {}", e);
                    }
                    Err(_) => continue,
                }
            }
            log::info!("Token HTTP API stopped");
        });

        Ok(bound)
    }

    /// Stop the HTTP API server
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

impl Default for BridgeHttpApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<Incoming>,
    bridge: BridgeServer,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    // Handle preflight
    if req.method() == Method::OPTIONS {
        return Ok(with_cors(Response::new(Full::new(Bytes::new()))));
    }

    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = match (method, path.as_str()) {
        (Method::GET, "/recaptcha/fresh") => match bridge.fresh_token().await {
            Ok(token) => json_response(StatusCode::OK, &FreshTokenResponse::from(token)),
            Err(e) => error_response(&e),
        },

        (Method::GET, "/status") => json_response(StatusCode::OK, &bridge.status().await),

        (Method::POST, "/recaptcha/generate") => match parse_body::<GenerateRequest>(req).await {
            Ok(body) => match generation_kind(&body, bridge.config().max_size) {
                Ok(kind) => match bridge.request_generation(kind).await {
                    Ok(()) => json_response(
                        StatusCode::ACCEPTED,
                        &GenerateAccepted { requested: kind },
                    ),
                    Err(e) => error_response(&e),
                },
                Err(e) => error_response(&e),
            },
            Err(e) => error_response(&e),
        },

        (method, path) => {
            log::debug!("No route for {} {}", method, path);
            json_response(
                StatusCode::NOT_FOUND,
                &ApiError {
                    error: format!("Not found: {} {}", method, path),
                    code: "not_found".to_string(),
                },
            )
        }
    };

    Ok(with_cors(response))
}

fn generation_kind(body: &GenerateRequest, capacity: usize) -> Result<GenerationKind> {
    match body.count {
        None | Some(1) => Ok(GenerationKind::Single),
        Some(0) => Err(BridgeError::validation("count must be at least 1")),
        Some(count) => Ok(GenerationKind::Batch {
            count: count.min(capacity),
        }),
    }
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Parse JSON request body; an empty body parses as the default
async fn parse_body<T: for<'de> Deserialize<'de> + Default>(req: Request<Incoming>) -> Result<T> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|e| BridgeError::validation(format!("Failed to read body: {}", e)))?
        .to_bytes();

    if body_bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(&body_bytes)
        .map_err(|e| BridgeError::validation(format!("Failed to parse JSON: {}", e)))
}

fn error_response(err: &BridgeError) -> Response<Full<Bytes>> {
    json_response(err.status(), &ApiError::from(err))
}

/// Create JSON response
fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(data).unwrap_or_else(|_| {
        r#"{"error":"Serialization failed","code":"internal"}"#.to_string()
    });
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
}
