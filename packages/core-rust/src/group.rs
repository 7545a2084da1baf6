//! Composite operations.
//!
//! A [`GroupOperation`] runs a set of child operations on a private queue and
//! finishes once every child, including children added late and operations
//! the children produced, has finished. Child errors are aggregated in the
//! order the children finished.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{LifecycleError, OperationError};
use crate::observer::Observer;
use crate::operation::{ExecutionContext, Execute, Operation, OperationId};
use crate::queue::OperationQueue;
use crate::state::OperationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Children are collected but nothing runs yet.
    Collecting,
    /// Children run on the private queue.
    Running,
    /// Every child finished; late additions are rejected.
    Closed,
}

struct Tracking {
    phase: Phase,
    cancelled: bool,
    /// Children added before the group started executing.
    waiting: Vec<Operation>,
    /// Every child ever tracked, for cancellation.
    children: Vec<Operation>,
    /// Ids of `children`; an operation is counted once however often it is
    /// produced.
    tracked: HashSet<OperationId>,
    outstanding: usize,
    errors: Vec<OperationError>,
    queue: Option<OperationQueue>,
}

struct GroupState {
    tracking: Mutex<Tracking>,
    settled: watch::Sender<bool>,
}

impl GroupState {
    fn attach(self: &Arc<Self>, child: &Operation) -> Result<(), LifecycleError> {
        child.add_observer(ChildObserver {
            group: Arc::downgrade(self),
        })
    }

    /// Tracks an operation produced by a child. The producing child's queue
    /// observer enqueues it right after this returns.
    fn track_produced(self: &Arc<Self>, produced: &Operation) {
        if !self.tracking.lock().tracked.insert(produced.id()) {
            debug!(operation = %produced.name(), "produced operation already tracked");
            return;
        }
        if let Err(err) = self.attach(produced) {
            warn!(operation = %produced.name(), error = %err, "cannot track produced operation");
            self.tracking.lock().tracked.remove(&produced.id());
            return;
        }
        let mut tracking = self.tracking.lock();
        tracking.outstanding += 1;
        tracking.children.push(produced.clone());
    }

    fn child_finished(&self, errors: &[OperationError]) {
        let settled = {
            let mut tracking = self.tracking.lock();
            tracking.errors.extend(errors.iter().cloned());
            tracking.outstanding = tracking.outstanding.saturating_sub(1);
            self.close_if_settled(&mut tracking)
        };
        if settled {
            self.settled.send_modify(|s| *s = true);
        }
    }

    fn close_if_settled(&self, tracking: &mut Tracking) -> bool {
        if tracking.phase == Phase::Running && tracking.outstanding == 0 {
            tracking.phase = Phase::Closed;
            true
        } else {
            false
        }
    }

    /// Finishes children that never reached the private queue and closes
    /// the group.
    fn abandon_waiting(&self) {
        let waiting = {
            let mut tracking = self.tracking.lock();
            tracking.phase = Phase::Closed;
            mem::take(&mut tracking.waiting)
        };
        for child in waiting {
            debug!(child = %child.name(), "finishing child of a group that never ran");
            child.cancel();
            child.finish(vec![OperationError::Cancelled]);
        }
    }

    fn cancel_children(&self) {
        let children = {
            let mut tracking = self.tracking.lock();
            tracking.cancelled = true;
            tracking.children.clone()
        };
        for child in children {
            child.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Attached to every child: counts completions and tracks produced work.
struct ChildObserver {
    group: Weak<GroupState>,
}

impl Observer for ChildObserver {
    fn on_produce(&self, _operation: &Operation, produced: &Operation) {
        if let Some(group) = self.group.upgrade() {
            group.track_produced(produced);
        }
    }

    fn on_finish(&self, _operation: &Operation, errors: &[OperationError]) {
        if let Some(group) = self.group.upgrade() {
            group.child_finished(errors);
        }
    }
}

/// Attached to the group operation itself: forwards cancellation.
struct CancelChildren {
    group: Weak<GroupState>,
}

impl Observer for CancelChildren {
    fn on_cancel(&self, _operation: &Operation) {
        if let Some(group) = self.group.upgrade() {
            group.cancel_children();
        }
    }
}

// ---------------------------------------------------------------------------
// GroupWork
// ---------------------------------------------------------------------------

struct GroupWork {
    state: Arc<GroupState>,
}

#[async_trait]
impl Execute for GroupWork {
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), OperationError> {
        let queue = OperationQueue::new(
            QueueConfig::named(format!("{}.children", ctx.operation().name())),
            Arc::clone(ctx.exclusivity()),
        );

        let (initial, cancelled) = {
            let mut tracking = self.state.tracking.lock();
            tracking.phase = Phase::Running;
            tracking.queue = Some(queue.clone());
            (mem::take(&mut tracking.waiting), tracking.cancelled)
        };

        for child in initial {
            if cancelled {
                child.cancel();
            }
            if let Err(err) = queue.add(child.clone()) {
                warn!(group = %ctx.operation().name(), child = %child.name(), error = %err, "child could not be enqueued");
                self.state.child_finished(&[OperationError::execution(err)]);
            }
        }

        let settled = {
            let mut tracking = self.state.tracking.lock();
            self.state.close_if_settled(&mut tracking)
        };
        if settled {
            self.state.settled.send_modify(|s| *s = true);
        }

        let mut rx = self.state.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;

        let errors = {
            let mut tracking = self.state.tracking.lock();
            tracking.queue = None;
            mem::take(&mut tracking.errors)
        };
        debug!(group = %ctx.operation().name(), errors = errors.len(), "group settled");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OperationError::Group(errors))
        }
    }

    fn finished(&self, _operation: &Operation, _errors: &[OperationError]) {
        self.state.abandon_waiting();
    }
}

// ---------------------------------------------------------------------------
// GroupOperation
// ---------------------------------------------------------------------------

/// An operation that finishes when all of its children have finished.
///
/// The group's finish error sequence is the concatenation of the children's
/// error sequences in child-finish order. Cancelling the group cancels every
/// child.
pub struct GroupOperation {
    operation: Operation,
    state: Arc<GroupState>,
}

impl GroupOperation {
    /// Creates a group over `children`, none of which may have been enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyEnqueued`] if a child is already on
    /// a queue.
    pub fn new(
        name: impl Into<String>,
        children: impl IntoIterator<Item = Operation>,
    ) -> Result<Self, LifecycleError> {
        let (settled, _) = watch::channel(false);
        let state = Arc::new(GroupState {
            tracking: Mutex::new(Tracking {
                phase: Phase::Collecting,
                cancelled: false,
                waiting: Vec::new(),
                children: Vec::new(),
                tracked: HashSet::new(),
                outstanding: 0,
                errors: Vec::new(),
                queue: None,
            }),
            settled,
        });
        let operation = Operation::builder(
            name,
            GroupWork {
                state: Arc::clone(&state),
            },
        )
        .observer(CancelChildren {
            group: Arc::downgrade(&state),
        })
        .build();

        let group = Self { operation, state };
        for child in children {
            group.add_child(child)?;
        }
        Ok(group)
    }

    /// The group as a schedulable operation.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Adds a child. Legal until every child has finished; once the group is
    /// running the child is enqueued immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::GroupFinished`] once the group closed and
    /// [`LifecycleError::AlreadyEnqueued`] if the child is already on a queue.
    pub fn add_child(&self, child: Operation) -> Result<(), LifecycleError> {
        if child.state() != OperationState::Initialized {
            return Err(LifecycleError::AlreadyEnqueued);
        }
        {
            let mut tracking = self.state.tracking.lock();
            if tracking.phase == Phase::Closed {
                return Err(LifecycleError::GroupFinished);
            }
            if !tracking.tracked.insert(child.id()) {
                return Err(LifecycleError::AlreadyEnqueued);
            }
        }
        if let Err(err) = self.state.attach(&child) {
            self.state.tracking.lock().tracked.remove(&child.id());
            return Err(err);
        }

        let (queue, cancelled) = {
            let mut tracking = self.state.tracking.lock();
            match tracking.phase {
                Phase::Closed => {
                    tracking.tracked.remove(&child.id());
                    return Err(LifecycleError::GroupFinished);
                }
                Phase::Collecting => tracking.waiting.push(child.clone()),
                Phase::Running => {}
            }
            tracking.outstanding += 1;
            tracking.children.push(child.clone());
            (tracking.queue.clone(), tracking.cancelled)
        };

        if cancelled {
            child.cancel();
        }
        if let Some(queue) = queue {
            if let Err(err) = queue.add(child) {
                self.state.child_finished(&[OperationError::execution(err)]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Snapshot of every child tracked so far.
    #[must_use]
    pub fn children(&self) -> Vec<Operation> {
        self.state.tracking.lock().children.clone()
    }
}

impl From<GroupOperation> for Operation {
    fn from(group: GroupOperation) -> Self {
        group.operation
    }
}

impl std::fmt::Debug for GroupOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupOperation")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
