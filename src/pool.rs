//! In-memory token pool
//!
//! Tokens are kept newest first. A token is unique by value, served at most
//! once, and never served once older than the configured maximum age.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Where a token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    /// Captured from page traffic
    Push,
    /// Produced on request by the extension
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub value: String,
    pub source: TokenSource,
    pub captured_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(value: impl Into<String>, source: TokenSource) -> Self {
        Self::captured_at(value, source, Utc::now())
    }

    pub fn captured_at(value: impl Into<String>, source: TokenSource, at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            source,
            captured_at: at,
        }
    }

    /// Age at `now`; tokens stamped in the future count as brand new
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Short prefix for logs
    pub fn preview(&self) -> &str {
        preview(&self.value)
    }
}

/// First few characters of a token, safe for logging
pub fn preview(value: &str) -> &str {
    match value.char_indices().nth(12) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Snapshot of pool state for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub size: usize,
    pub capacity: usize,
    pub min_available: usize,
    pub below_watermark: bool,
    pub newest_age_ms: Option<u64>,
    pub oldest_age_ms: Option<u64>,
}

pub struct TokenPool {
    /// Newest at the front
    tokens: VecDeque<TokenRecord>,
    capacity: usize,
    min_available: usize,
    max_age: Duration,
}

impl TokenPool {
    pub fn new(capacity: usize, min_available: usize, max_age: Duration) -> Self {
        Self {
            tokens: VecDeque::new(),
            capacity: capacity.max(1),
            min_available,
            max_age,
        }
    }

    /// Insert a token unless one with the same value is already held.
    /// Returns `true` when the record was inserted.
    pub fn push(&mut self, record: TokenRecord) -> bool {
        if self.tokens.iter().any(|t| t.value == record.value) {
            return false;
        }

        // Keep newest-first ordering even if a late push carries an older stamp
        let pos = self
            .tokens
            .iter()
            .position(|t| t.captured_at <= record.captured_at)
            .unwrap_or(self.tokens.len());
        self.tokens.insert(pos, record);

        while self.tokens.len() > self.capacity {
            if let Some(evicted) = self.tokens.pop_back() {
                log::debug!("Pool full, evicted oldest token {}", evicted.preview());
            }
        }
        true
    }

    /// Remove and return the newest token that is still fresh at `now`
    pub fn take_fresh(&mut self, now: DateTime<Utc>) -> Result<TokenRecord> {
        self.prune_expired(now);
        self.tokens.pop_front().ok_or(BridgeError::PoolEmpty)
    }

    /// Drop every token older than the maximum age, returning how many went
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        let max_age = self.max_age;
        self.tokens.retain(|t| t.age(now) < max_age);
        before - self.tokens.len()
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn below_watermark(&self) -> bool {
        self.tokens.len() < self.min_available
    }

    /// Tokens missing to reach the watermark
    pub fn deficit(&self) -> usize {
        self.min_available.saturating_sub(self.tokens.len())
    }

    /// Free slots before eviction kicks in
    pub fn headroom(&self) -> usize {
        self.capacity.saturating_sub(self.tokens.len())
    }

    pub fn stats(&self, now: DateTime<Utc>) -> PoolStats {
        let age_ms = |t: &TokenRecord| t.age(now).as_millis() as u64;
        PoolStats {
            size: self.tokens.len(),
            capacity: self.capacity,
            min_available: self.min_available,
            below_watermark: self.below_watermark(),
            newest_age_ms: self.tokens.front().map(age_ms),
            oldest_age_ms: self.tokens.back().map(age_ms),
        }
    }
}
