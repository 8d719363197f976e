//! Wire types for extension and consumer communication

use serde::{Deserialize, Serialize};

use super::generation::GenerationKind;
use crate::error::{BridgeError, Result};
use crate::pool::{PoolStats, TokenRecord, TokenSource};

/// Longest token value accepted from the extension
pub const MAX_TOKEN_LEN: usize = 8192;

/// Message types the extension may send to the bridge
pub const INBOUND_TYPES: &[&str] = &[
    "VEO3_REQUEST_CAPTURED",
    "VEO3_RECAPTCHA_GENERATED",
    "VEO3_RECAPTCHA_ERROR",
    "VEO3_RECAPTCHA_BATCH_DONE",
];

/// Message from the extension to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtensionMessage {
    /// Token seen in intercepted page traffic
    #[serde(rename = "VEO3_REQUEST_CAPTURED")]
    RequestCaptured {
        #[serde(alias = "value", alias = "recaptchaToken")]
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Token produced on request
    #[serde(rename = "VEO3_RECAPTCHA_GENERATED")]
    RecaptchaGenerated {
        #[serde(alias = "value", alias = "recaptchaToken")]
        token: String,
    },
    /// Generation attempt failed in the page
    #[serde(rename = "VEO3_RECAPTCHA_ERROR")]
    RecaptchaError {
        #[serde(default)]
        error: String,
    },
    /// A batch request finished
    #[serde(rename = "VEO3_RECAPTCHA_BATCH_DONE")]
    BatchDone {
        #[serde(default)]
        generated: u32,
        #[serde(default)]
        failed: u32,
    },
}

impl ExtensionMessage {
    /// Parse and validate a raw text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::validation(format!("not JSON: {}", e)))?;

        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| BridgeError::validation("missing type"))?;
        if !INBOUND_TYPES.contains(&msg_type) {
            return Err(BridgeError::validation(format!(
                "unknown message type: {}",
                msg_type
            )));
        }

        let message: Self = serde_json::from_value(value)
            .map_err(|e| BridgeError::validation(format!("bad payload: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        if let Some(token) = self.token() {
            if token.trim().is_empty() {
                return Err(BridgeError::validation("empty token"));
            }
            if token.len() > MAX_TOKEN_LEN {
                return Err(BridgeError::validation(format!(
                    "token longer than {} bytes",
                    MAX_TOKEN_LEN
                )));
            }
        }
        Ok(())
    }

    /// Token carried by the message, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::RequestCaptured { token, .. } | Self::RecaptchaGenerated { token } => Some(token),
            Self::RecaptchaError { .. } | Self::BatchDone { .. } => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RequestCaptured { .. } => "VEO3_REQUEST_CAPTURED",
            Self::RecaptchaGenerated { .. } => "VEO3_RECAPTCHA_GENERATED",
            Self::RecaptchaError { .. } => "VEO3_RECAPTCHA_ERROR",
            Self::BatchDone { .. } => "VEO3_RECAPTCHA_BATCH_DONE",
        }
    }
}

/// Command from the bridge to the extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeCommand {
    #[serde(rename = "GENERATE_RECAPTCHA_TOKEN")]
    GenerateToken,
    #[serde(rename = "GENERATE_RECAPTCHA_BATCH")]
    GenerateBatch { count: usize },
    /// Acknowledges a pushed token
    #[serde(rename = "TOKEN_ACCEPTED")]
    TokenAccepted {
        #[serde(rename = "poolSize")]
        pool_size: usize,
        inserted: bool,
    },
}

impl From<GenerationKind> for BridgeCommand {
    fn from(kind: GenerationKind) -> Self {
        match kind {
            GenerationKind::Single => Self::GenerateToken,
            GenerationKind::Batch { count } => Self::GenerateBatch { count },
        }
    }
}

/// Body of a successful `GET /recaptcha/fresh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshTokenResponse {
    pub token: String,
    pub source: TokenSource,
    /// Capture time, epoch milliseconds
    pub timestamp: i64,
}

impl From<TokenRecord> for FreshTokenResponse {
    fn from(record: TokenRecord) -> Self {
        Self {
            timestamp: record.captured_at.timestamp_millis(),
            token: record.value,
            source: record.source,
        }
    }
}

/// Error body returned by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl From<&BridgeError> for ApiError {
    fn from(err: &BridgeError) -> Self {
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

/// Body of `POST /recaptcha/generate`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAccepted {
    pub requested: GenerationKind,
}

/// Connection status for `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connected: bool,
    pub connected_at: Option<String>,
    pub generating: Option<GenerationKind>,
    pub pool: PoolStats,
}
