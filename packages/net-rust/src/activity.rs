//! Network activity tracking.
//!
//! [`NetworkActivity`] counts network operations currently executing. Each
//! operation gets its own [`ActivityObserver`], which increments the counter
//! when the operation starts and decrements it when that operation finishes.
//! Operations that never started never touch the counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use conductor_core::{Observer, Operation, OperationError};
use metrics::gauge;
use tokio::sync::watch;
use tracing::debug;

/// Gauge reporting the number of executing network operations.
pub const ACTIVE_GAUGE: &str = "conductor_network_active_operations";

/// Shared busy counter for network operations.
#[derive(Debug, Clone)]
pub struct NetworkActivity {
    active: Arc<AtomicU64>,
    busy: Arc<watch::Sender<bool>>,
}

impl NetworkActivity {
    #[must_use]
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            active: Arc::new(AtomicU64::new(0)),
            busy: Arc::new(busy),
        }
    }

    /// Number of network operations currently executing.
    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_count() > 0
    }

    /// Receiver flipping between idle (`false`) and busy (`true`).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    /// Fresh observer for one operation.
    #[must_use]
    pub fn observer(&self) -> ActivityObserver {
        ActivityObserver {
            activity: self.clone(),
            started: AtomicBool::new(false),
        }
    }

    fn increment(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish(now);
    }

    fn decrement(&self) {
        let now = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.publish(now);
    }

    fn publish(&self, now: u64) {
        #[allow(clippy::cast_precision_loss)]
        let value = now as f64;
        gauge!(ACTIVE_GAUGE).set(value);
        self.busy.send_if_modified(|busy| {
            let changed = *busy != (now > 0);
            *busy = now > 0;
            changed
        });
    }
}

impl Default for NetworkActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-operation observer feeding a [`NetworkActivity`] counter.
#[derive(Debug)]
pub struct ActivityObserver {
    activity: NetworkActivity,
    started: AtomicBool,
}

impl Observer for ActivityObserver {
    fn on_start(&self, operation: &Operation) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.activity.increment();
            debug!(operation = %operation.name(), active = self.activity.active_count(), "network activity started");
        }
    }

    fn on_finish(&self, operation: &Operation, _errors: &[OperationError]) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.activity.decrement();
            debug!(operation = %operation.name(), active = self.activity.active_count(), "network activity finished");
        }
    }
}
