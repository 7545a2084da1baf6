//! Mutual-exclusion slots shared by every queue of a process.
//!
//! Each exclusivity category owns a single FIFO slot. An operation declaring
//! a mutually exclusive condition acquires its category's slot once its
//! conditions are satisfied and holds it until it has finished, so at most
//! one operation per category is between `Ready` and `Finished` at a time.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::operation::OperationId;

/// Registry of exclusivity slots keyed by category name.
///
/// Passed explicitly to every [`OperationQueue`](crate::OperationQueue) that
/// must honor the same categories. Slots are created lazily on first use.
#[derive(Default)]
pub struct ExclusivityRegistry {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl ExclusivityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the category slot and returns a ticket holding it.
    ///
    /// Waiters are served in the order they started waiting.
    pub async fn acquire(&self, category: &str, holder: OperationId) -> Ticket {
        let slot = self.slot(category);
        let guard = slot.lock_owned().await;
        debug!(category, holder = %holder, "exclusivity acquired");
        Ticket {
            category: category.to_string(),
            holder,
            _guard: guard,
        }
    }

    /// Releases a ticket. Dropping the ticket has the same effect.
    pub fn release(&self, ticket: Ticket) {
        drop(ticket);
    }

    /// Returns `true` while some operation holds the category slot.
    #[must_use]
    pub fn is_occupied(&self, category: &str) -> bool {
        self.slots.get(category).is_some_and(|slot| {
            let busy = slot.try_lock().is_err();
            busy
        })
    }

    /// Number of categories seen so far.
    #[must_use]
    pub fn category_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, category: &str) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held across an await.
        Arc::clone(
            &self
                .slots
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

impl fmt::Debug for ExclusivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusivityRegistry")
            .field("categories", &self.slots.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// Proof of holding an exclusivity slot. The slot is released on drop.
pub struct Ticket {
    category: String,
    holder: OperationId,
    _guard: OwnedMutexGuard<()>,
}

impl Ticket {
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub fn holder(&self) -> OperationId {
        self.holder
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        debug!(category = %self.category, holder = %self.holder, "exclusivity released");
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("category", &self.category)
            .field("holder", &self.holder)
            .finish()
    }
}
