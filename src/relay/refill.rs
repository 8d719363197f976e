//! Periodic watermark check that keeps the pool topped up

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::generation::GenerationKind;
use super::server::BridgeServer;
use crate::error::BridgeError;

/// What a single watermark check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Another check was still running
    AlreadyRunning,
    /// Pool at or above the watermark
    Sufficient,
    /// Below watermark but no extension to ask
    NoClient,
    /// Below watermark, a request is already outstanding
    Coalesced,
    /// A batch was requested too recently for an event-driven check
    Throttled,
    Requested(GenerationKind),
    Failed,
}

/// What started a watermark check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillTrigger {
    /// The interval ticker
    Periodic,
    /// A connect, a consumed token or a finished batch
    Event,
}

/// Runs watermark checks, never more than one at a time
pub struct Refiller {
    in_progress: AtomicBool,
    /// Minimum gap between batches requested by event-driven checks
    min_gap: Duration,
    last_batch: Mutex<Option<Instant>>,
}

/// Clears the in-progress flag on drop
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Refiller {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            min_gap,
            last_batch: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn try_enter(&self) -> Option<CheckGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard(&self.in_progress))
    }

    fn last_batch(&self) -> Option<Instant> {
        self.last_batch.lock().map(|last| *last).unwrap_or(None)
    }

    fn record_batch(&self, at: Instant) {
        if let Ok(mut last) = self.last_batch.lock() {
            *last = Some(at);
        }
    }

    /// Prune expired tokens and request a batch if the pool is low.
    ///
    /// Event-driven checks request at most one batch per `min_gap`; the
    /// periodic ticker is what retries after failed batches.
    pub async fn check(&self, server: &BridgeServer, trigger: RefillTrigger) -> RefillOutcome {
        let Some(_guard) = self.try_enter() else {
            return RefillOutcome::AlreadyRunning;
        };

        let (below, deficit, headroom) = server.pool_snapshot().await;
        if !below {
            return RefillOutcome::Sufficient;
        }

        let now = Instant::now();
        if trigger == RefillTrigger::Event && throttled(self.last_batch(), now, self.min_gap) {
            log::debug!("Pool below watermark, batch requested recently, waiting for next tick");
            return RefillOutcome::Throttled;
        }

        let count = batch_count(server.config().batch_size, deficit, headroom);
        let kind = GenerationKind::Batch { count };
        match server.request_generation(kind).await {
            Ok(()) => {
                self.record_batch(now);
                log::info!("Pool below watermark, requested batch of {}", count);
                RefillOutcome::Requested(kind)
            }
            Err(BridgeError::NoClientConnected) => {
                log::debug!("Pool below watermark but no extension connected");
                RefillOutcome::NoClient
            }
            Err(BridgeError::GenerationInProgress) => RefillOutcome::Coalesced,
            Err(e) => {
                log::warn!("Refill request failed: {}", e);
                RefillOutcome::Failed
            }
        }
    }
}

/// Batch size needed to reach the watermark without overflowing capacity
pub fn batch_count(batch_size: usize, deficit: usize, headroom: usize) -> usize {
    batch_size.max(deficit).min(headroom).max(1)
}

fn throttled(last: Option<Instant>, now: Instant, min_gap: Duration) -> bool {
    last.is_some_and(|last| now.saturating_duration_since(last) < min_gap)
}

/// Spawn the repeating watermark check
pub fn spawn_refill_task(server: BridgeServer, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = server.refiller().check(&server, RefillTrigger::Periodic).await;
            log::trace!("Watermark check: {:?}", outcome);
        }
    })
}
