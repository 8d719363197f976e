//! Tracks the outstanding generation request so that concurrent
//! "pool is low" triggers collapse into a single command.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::types::ExtensionMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GenerationKind {
    Single,
    Batch { count: usize },
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    kind: GenerationKind,
    started: Instant,
}

#[derive(Debug)]
pub struct GenerationTracker {
    outstanding: Option<Outstanding>,
    /// An unanswered request stops blocking new ones after this long
    stale_after: Duration,
}

impl GenerationTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            outstanding: None,
            stale_after,
        }
    }

    /// Claim the generation slot. Returns `false` if a live request holds it.
    pub fn try_begin(&mut self, kind: GenerationKind, now: Instant) -> bool {
        if self.current(now).is_some() {
            return false;
        }
        self.outstanding = Some(Outstanding { kind, started: now });
        true
    }

    /// Outstanding request at `now`, ignoring stale ones
    pub fn current(&self, now: Instant) -> Option<GenerationKind> {
        self.outstanding
            .filter(|o| now.saturating_duration_since(o.started) < self.stale_after)
            .map(|o| o.kind)
    }

    /// Update from an extension message. Returns the settled request, if any.
    pub fn observe(&mut self, message: &ExtensionMessage) -> Option<GenerationKind> {
        let kind = self.outstanding?.kind;
        let settles = match (kind, message) {
            (GenerationKind::Single, ExtensionMessage::RecaptchaGenerated { .. })
            | (GenerationKind::Single, ExtensionMessage::RecaptchaError { .. })
            | (GenerationKind::Batch { .. }, ExtensionMessage::BatchDone { .. }) => true,
            _ => false,
        };
        if settles {
            self.outstanding = None;
            Some(kind)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.outstanding = None;
    }
}
