//! Operation lifecycle observers.
//!
//! Defines [`Observer`] for reacting to an operation's lifecycle,
//! [`ObserverSet`] which fans notifications out to several observers in
//! addition order, and [`BlockObserver`] for closure-based hooks.

use std::fmt;
use std::sync::Arc;

use crate::error::OperationError;
use crate::operation::Operation;

/// Passive listener attached to an operation.
///
/// Observers hold no operation state of their own; they may perform side
/// effects such as maintaining a busy counter or forwarding produced
/// operations into a queue. Hooks are invoked synchronously on whichever task
/// drives the transition, so they should not block.
///
/// Used as `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Called right before the operation's work body starts.
    fn on_start(&self, _operation: &Operation) {}

    /// Called once, on the first `cancel()` before the operation finished.
    fn on_cancel(&self, _operation: &Operation) {}

    /// Called when the operation produces a new operation, either a condition
    /// dependency or one handed over by its work body.
    fn on_produce(&self, _operation: &Operation, _produced: &Operation) {}

    /// Called exactly once when the operation finishes, with its full error
    /// sequence (possibly empty).
    fn on_finish(&self, _operation: &Operation, _errors: &[OperationError]) {}
}

// ---------------------------------------------------------------------------
// ObserverSet
// ---------------------------------------------------------------------------

/// Ordered collection of observers that fans out every notification.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observer. Notifications follow insertion order.
    pub fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.observers.len())
            .finish()
    }
}

impl Observer for ObserverSet {
    fn on_start(&self, operation: &Operation) {
        for observer in &self.observers {
            observer.on_start(operation);
        }
    }

    fn on_cancel(&self, operation: &Operation) {
        for observer in &self.observers {
            observer.on_cancel(operation);
        }
    }

    fn on_produce(&self, operation: &Operation, produced: &Operation) {
        for observer in &self.observers {
            observer.on_produce(operation, produced);
        }
    }

    fn on_finish(&self, operation: &Operation, errors: &[OperationError]) {
        for observer in &self.observers {
            observer.on_finish(operation, errors);
        }
    }
}

// ---------------------------------------------------------------------------
// BlockObserver
// ---------------------------------------------------------------------------

type StartHook = Box<dyn Fn(&Operation) + Send + Sync>;
type ProduceHook = Box<dyn Fn(&Operation, &Operation) + Send + Sync>;
type FinishHook = Box<dyn Fn(&Operation, &[OperationError]) + Send + Sync>;

/// Observer built from optional closures.
///
/// ```
/// use conductor_core::BlockObserver;
///
/// let observer = BlockObserver::new()
///     .with_start(|op| println!("{} started", op.name()))
///     .with_finish(|op, errors| println!("{} finished with {} errors", op.name(), errors.len()));
/// # let _ = observer;
/// ```
#[derive(Default)]
pub struct BlockObserver {
    start: Option<StartHook>,
    cancel: Option<StartHook>,
    produce: Option<ProduceHook>,
    finish: Option<FinishHook>,
}

impl BlockObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_start(mut self, hook: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.start = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, hook: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.cancel = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn with_produce(
        mut self,
        hook: impl Fn(&Operation, &Operation) + Send + Sync + 'static,
    ) -> Self {
        self.produce = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn with_finish(
        mut self,
        hook: impl Fn(&Operation, &[OperationError]) + Send + Sync + 'static,
    ) -> Self {
        self.finish = Some(Box::new(hook));
        self
    }
}

impl Observer for BlockObserver {
    fn on_start(&self, operation: &Operation) {
        if let Some(hook) = &self.start {
            hook(operation);
        }
    }

    fn on_cancel(&self, operation: &Operation) {
        if let Some(hook) = &self.cancel {
            hook(operation);
        }
    }

    fn on_produce(&self, operation: &Operation, produced: &Operation) {
        if let Some(hook) = &self.produce {
            hook(operation, produced);
        }
    }

    fn on_finish(&self, operation: &Operation, errors: &[OperationError]) {
        if let Some(hook) = &self.finish {
            hook(operation, errors);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Observer that records every notification into a shared log.
    struct LoggingObserver {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Observer for LoggingObserver {
        fn on_start(&self, operation: &Operation) {
            self.log
                .lock()
                .push(format!("{}:start:{}", self.tag, operation.name()));
        }

        fn on_produce(&self, _operation: &Operation, produced: &Operation) {
            self.log
                .lock()
                .push(format!("{}:produce:{}", self.tag, produced.name()));
        }

        fn on_finish(&self, _operation: &Operation, errors: &[OperationError]) {
            self.log
                .lock()
                .push(format!("{}:finish:{}", self.tag, errors.len()));
        }
    }

    fn noop(name: &str) -> Operation {
        Operation::from_fn(name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn set_fans_out_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ObserverSet::new();
        set.add(Arc::new(LoggingObserver { tag: "a", log: log.clone() }));
        set.add(Arc::new(LoggingObserver { tag: "b", log: log.clone() }));
        assert_eq!(set.len(), 2);

        let op = noop("op");
        set.on_start(&op);
        set.on_produce(&op, &noop("child"));
        set.on_finish(&op, &[OperationError::Cancelled]);

        assert_eq!(
            log.lock().clone(),
            vec![
                "a:start:op",
                "b:start:op",
                "a:produce:child",
                "b:produce:child",
                "a:finish:1",
                "b:finish:1",
            ]
        );
    }

    #[test]
    fn block_observer_ignores_missing_hooks() {
        let finished = Arc::new(Mutex::new(0usize));
        let counter = finished.clone();
        let observer = BlockObserver::new().with_finish(move |_, errors| {
            *counter.lock() += errors.len();
        });

        let op = noop("op");
        observer.on_start(&op);
        observer.on_cancel(&op);
        observer.on_finish(&op, &[OperationError::Cancelled, OperationError::Cancelled]);
        assert_eq!(*finished.lock(), 2);
    }

    #[test]
    fn block_observer_hooks_fire_through_trait() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (start, cancel, produce, finish) = (log.clone(), log.clone(), log.clone(), log.clone());
        let observer = BlockObserver::new()
            .with_start(move |_| start.lock().push("start"))
            .with_cancel(move |_| cancel.lock().push("cancel"))
            .with_produce(move |_, _| produce.lock().push("produce"))
            .with_finish(move |_, _| finish.lock().push("finish"));

        let op = noop("op");
        let as_observer: &dyn Observer = &observer;
        as_observer.on_start(&op);
        as_observer.on_cancel(&op);
        as_observer.on_produce(&op, &noop("child"));
        as_observer.on_finish(&op, &[]);
        assert_eq!(log.lock().clone(), vec!["start", "cancel", "produce", "finish"]);
    }
}
