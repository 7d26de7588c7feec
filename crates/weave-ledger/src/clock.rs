//! Hybrid Logical Clock.
//!
//! Timestamps pair wall-clock milliseconds with a logical counter so that the
//! order they induce is total and consistent with causality: an event's HLC is
//! always greater than the HLC of every event it depends on.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A hybrid logical timestamp, ordered lexicographically on
/// `(physical_ms, logical)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hlc {
    pub physical_ms: u64,
    pub logical: u32,
}

impl Hlc {
    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Hlc {
            physical_ms,
            logical,
        }
    }

    /// Total order: physical time first, then the logical counter.
    pub fn compare(a: &Hlc, b: &Hlc) -> Ordering {
        a.physical_ms
            .cmp(&b.physical_ms)
            .then(a.logical.cmp(&b.logical))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        Hlc::compare(self, other)
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_ms, self.logical)
    }
}

/// Source of wall-clock milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually driven time source for tests and simulations.
#[derive(Clone, Debug, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        ManualTimeSource {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

/// Generator of local HLC timestamps.
pub struct HybridClock {
    last: Hlc,
    source: Arc<dyn TimeSource>,
}

impl HybridClock {
    /// A clock driven by the system wall clock.
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemTimeSource))
    }

    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        HybridClock {
            last: Hlc::default(),
            source,
        }
    }

    /// The most recently issued or merged timestamp.
    pub fn last(&self) -> Hlc {
        self.last
    }

    /// Issue a timestamp strictly greater than the previous local one.
    pub fn tick(&mut self) -> Hlc {
        let now = self.source.now_ms();
        self.last = if now > self.last.physical_ms {
            Hlc::new(now, 0)
        } else {
            Hlc::new(self.last.physical_ms, self.last.logical.saturating_add(1))
        };
        self.last
    }

    /// Merge a remote timestamp into the local state.
    pub fn receive(&mut self, remote: Hlc) -> Hlc {
        let now = self.source.now_ms();
        let local = self.last;
        let max_physical = now.max(local.physical_ms).max(remote.physical_ms);

        let logical = if max_physical == local.physical_ms && max_physical == remote.physical_ms {
            local.logical.max(remote.logical).saturating_add(1)
        } else if max_physical == local.physical_ms {
            local.logical.saturating_add(1)
        } else if max_physical == remote.physical_ms {
            remote.logical.saturating_add(1)
        } else {
            0
        };

        self.last = Hlc::new(max_physical, logical);
        self.last
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock").field("last", &self.last).finish()
    }
}
