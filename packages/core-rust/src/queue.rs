//! The operation queue and its per-operation driver.
//!
//! Adding an operation spawns a driver task that walks it through its
//! lifecycle: wait for dependencies, evaluate conditions, take exclusivity
//! slots and a concurrency permit, execute, finish. Operations whose work
//! bodies produce follow-up operations get those enqueued on the same queue.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::condition;
use crate::config::QueueConfig;
use crate::error::{LifecycleError, OperationError};
use crate::exclusivity::{ExclusivityRegistry, Ticket};
use crate::group::GroupOperation;
use crate::observer::Observer;
use crate::operation::{ExecutionContext, Operation, OperationId};
use crate::state::OperationState;

struct QueueInner {
    config: QueueConfig,
    exclusivity: Arc<ExclusivityRegistry>,
    permits: Option<Arc<Semaphore>>,
    tracked: DashMap<OperationId, Operation>,
    in_flight: watch::Sender<usize>,
}

/// Schedules operations once their dependencies finished and their
/// conditions hold.
///
/// Cloning yields another handle to the same queue.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::sync::Arc;
/// use conductor_core::{ExclusivityRegistry, Operation, OperationQueue, QueueConfig};
///
/// let queue = OperationQueue::new(QueueConfig::default(), Arc::new(ExclusivityRegistry::new()));
/// let op = Operation::from_fn("greet", |_ctx| async { Ok(()) });
/// queue.add(op.clone()).unwrap();
/// op.wait_until_finished().await;
/// assert!(op.errors().is_empty());
/// # }
/// ```
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    #[must_use]
    pub fn new(config: QueueConfig, exclusivity: Arc<ExclusivityRegistry>) -> Self {
        let permits = config
            .max_concurrent_operations
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                config,
                exclusivity,
                permits,
                tracked: DashMap::new(),
                in_flight,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn exclusivity(&self) -> &Arc<ExclusivityRegistry> {
        &self.inner.exclusivity
    }

    /// Enqueues an operation. Dependencies contributed by its conditions are
    /// enqueued alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyEnqueued`] if the operation was added
    /// to a queue before.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn add(&self, operation: Operation) -> Result<(), LifecycleError> {
        operation.will_enqueue()?;
        operation.add_observer(QueueObserver {
            queue: Arc::downgrade(&self.inner),
        })?;

        // Counted before its dependencies so the queue never looks idle in
        // between.
        self.inner
            .tracked
            .insert(operation.id(), operation.clone());
        self.inner.in_flight.send_modify(|n| *n += 1);
        debug!(queue = %self.inner.config.name, operation = %operation.name(), id = %operation.id(), "enqueued");

        for dependency in condition::resolve_dependencies(&operation, &operation.conditions()) {
            if let Err(err) = operation.add_dependency(dependency.clone()) {
                warn!(operation = %operation.name(), error = %err, "ignoring condition dependency");
                continue;
            }
            operation.produce(dependency);
        }

        tokio::spawn(drive(Arc::clone(&self.inner), operation));
        Ok(())
    }

    /// Enqueues several operations in order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first enqueue error.
    pub fn add_all(
        &self,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Result<(), LifecycleError> {
        for operation in operations {
            self.add(operation)?;
        }
        Ok(())
    }

    /// Enqueues a group operation.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn add_group(&self, group: &GroupOperation) -> Result<(), LifecycleError> {
        self.add(group.operation().clone())
    }

    /// Cancels every operation currently tracked by this queue.
    pub fn cancel_all(&self) {
        // Snapshot first: cancel hooks may enqueue into this same map.
        let operations: Vec<Operation> = self
            .inner
            .tracked
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for operation in operations {
            operation.cancel();
        }
    }

    /// Number of operations added and not yet finished.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Resolves once every operation added so far, and every operation they
    /// produced, has finished.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.config.name)
            .field("operations", &self.operation_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// QueueObserver
// ---------------------------------------------------------------------------

/// Enqueues whatever an operation produces onto the queue that runs it.
struct QueueObserver {
    queue: Weak<QueueInner>,
}

impl Observer for QueueObserver {
    fn on_produce(&self, _operation: &Operation, produced: &Operation) {
        let Some(inner) = self.queue.upgrade() else {
            return;
        };
        let queue = OperationQueue { inner };
        match queue.add(produced.clone()) {
            Ok(()) => {}
            // Shared dependencies are legitimately produced more than once.
            Err(LifecycleError::AlreadyEnqueued) => {
                debug!(operation = %produced.name(), "produced operation already enqueued");
            }
            Err(err) => {
                warn!(operation = %produced.name(), error = %err, "failed to enqueue produced operation");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Resources held from `Ready` until the operation has finished.
#[derive(Default)]
struct Held {
    tickets: Vec<Ticket>,
    permit: Option<OwnedSemaphorePermit>,
}

async fn drive(queue: Arc<QueueInner>, operation: Operation) {
    let held = run(&queue, &operation).await;
    operation.wait_until_finished().await;
    drop(held);

    queue.tracked.remove(&operation.id());
    queue.in_flight.send_modify(|n| *n = n.saturating_sub(1));
}

async fn run(queue: &QueueInner, operation: &Operation) -> Held {
    let mut held = Held::default();

    if !await_dependencies(operation).await || operation.is_cancelled() {
        operation.finish(vec![OperationError::Cancelled]);
        return held;
    }

    if !operation.advance(OperationState::EvaluatingConditions) {
        return held;
    }
    let conditions = operation.conditions();
    let failures = condition::evaluate_all(operation, &conditions).await;
    if !failures.is_empty() {
        for failure in &failures {
            warn!(queue = %queue.config.name, operation = %operation.name(), error = %failure, "condition failed");
        }
        operation.finish(failures);
        return held;
    }
    if !operation.advance(OperationState::Ready) {
        return held;
    }

    for category in condition::exclusive_categories(&conditions) {
        tokio::select! {
            ticket = queue.exclusivity.acquire(&category, operation.id()) => held.tickets.push(ticket),
            () = operation.cancellation().cancelled() => {
                operation.finish(vec![OperationError::Cancelled]);
                return held;
            }
        }
    }

    if let Some(permits) = &queue.permits {
        tokio::select! {
            permit = Arc::clone(permits).acquire_owned() => held.permit = permit.ok(),
            () = operation.cancellation().cancelled() => {
                operation.finish(vec![OperationError::Cancelled]);
                return held;
            }
        }
    }

    if operation.is_cancelled() {
        operation.finish(vec![OperationError::Cancelled]);
        return held;
    }
    if !operation.advance(OperationState::Executing) {
        return held;
    }

    operation.observers().on_start(operation);
    let result = execute(queue, operation).await;
    operation.finish(result.err().into_iter().collect());
    held
}

/// Waits for every dependency, re-checking for dependencies added while
/// waiting, then seals setup. Returns `false` if cancelled first.
async fn await_dependencies(operation: &Operation) -> bool {
    loop {
        let dependencies = operation.dependencies();
        let all_finished = join_all(dependencies.iter().map(Operation::wait_until_finished));
        tokio::select! {
            _ = all_finished => {}
            () = operation.cancellation().cancelled() => return false,
        }
        if operation.seal(dependencies.len()) {
            return true;
        }
    }
}

async fn execute(queue: &QueueInner, operation: &Operation) -> Result<(), OperationError> {
    let span = info_span!(
        "operation",
        queue = %queue.config.name,
        id = %operation.id(),
        operation = %operation.name(),
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let ctx = ExecutionContext::new(operation.clone(), Arc::clone(&queue.exclusivity));
    let work = operation.work();

    async move {
        let start = Instant::now();
        let result = match AssertUnwindSafe(work.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(OperationError::execution(anyhow::anyhow!(
                "work body panicked"
            ))),
        };

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(err) if err.is_cancelled() => "cancelled",
            Err(_) => "error",
        };
        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::Span::current().record("outcome", outcome);
        info!(duration_ms, outcome, "operation complete");

        result
    }
    .instrument(span)
    .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::condition::{Condition, ConditionResult, MutuallyExclusive};
    use crate::error::ConditionFailure;
    use crate::observer::BlockObserver;
    use crate::operation::Execute;

    /// Work body that only records that it ran.
    struct Flag(Arc<AtomicBool>);

    #[async_trait]
    impl Execute for Flag {
        async fn execute(&self, _ctx: ExecutionContext) -> Result<(), OperationError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Noop;

    #[async_trait]
    impl Execute for Noop {
        async fn execute(&self, _ctx: ExecutionContext) -> Result<(), OperationError> {
            Ok(())
        }
    }

    fn queue() -> OperationQueue {
        OperationQueue::new(QueueConfig::named("test"), Arc::new(ExclusivityRegistry::new()))
    }

    fn logging(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Operation {
        let log = log.clone();
        Operation::from_fn(name, move |_ctx| async move {
            log.lock().push(name.to_string());
            Ok(())
        })
    }

    struct Always {
        pass: bool,
    }

    #[async_trait]
    impl Condition for Always {
        fn name(&self) -> &str {
            "Always"
        }

        async fn evaluate(&self, _operation: &Operation) -> ConditionResult {
            if self.pass {
                Ok(())
            } else {
                Err(ConditionFailure::new("Always").with_detail("reason", "configured to fail"))
            }
        }
    }

    /// Condition contributing a dependency that records when it runs.
    struct Prepared {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Condition for Prepared {
        fn name(&self) -> &str {
            "Prepared"
        }

        fn dependency_for(&self, _operation: &Operation) -> Option<Operation> {
            Some(logging("prepare", &self.log))
        }

        async fn evaluate(&self, _operation: &Operation) -> ConditionResult {
            self.log.lock().push("evaluate".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn visits_every_state_in_order() {
        let op = Operation::from_fn("plain", |_ctx| async { Ok(()) });
        let mut states = op.state_receiver();
        let seen = Arc::new(Mutex::new(vec![*states.borrow()]));
        let recorder = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    seen.lock().push(state);
                    if state.is_terminal() {
                        break;
                    }
                }
            })
        };

        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;
        recorder.await.unwrap();

        assert!(op.errors().is_empty());
        let seen = seen.lock().clone();
        assert_eq!(seen.first(), Some(&OperationState::Initialized));
        assert_eq!(seen.last(), Some(&OperationState::Finished));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn dependency_finishes_before_dependent_starts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = logging("a", &log);
        let b = logging("b", &log);
        b.add_dependency(a.clone()).unwrap();

        let queue = queue();
        // Dependent enqueued first on purpose.
        queue.add(b.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(a.clone()).unwrap();
        queue.wait_until_idle().await;

        assert_eq!(log.lock().clone(), vec!["a", "b"]);
        assert!(b.errors().is_empty());
    }

    #[tokio::test]
    async fn failing_condition_skips_execution() {
        let executed = Arc::new(AtomicBool::new(false));
        let flag = executed.clone();
        let op = Operation::builder("guarded", Flag(flag))
            .condition(Always { pass: false })
            .build();

        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;

        assert!(!executed.load(Ordering::SeqCst));
        let errors = op.errors();
        assert_eq!(errors.len(), 1);
        let failure = errors[0].condition_failure().unwrap();
        assert_eq!(failure.condition, "Always");
        assert_eq!(
            failure.detail("reason"),
            Some(&serde_json::Value::from("configured to fail"))
        );
    }

    #[tokio::test]
    async fn condition_dependency_runs_before_evaluation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let op = Operation::builder("guarded", Noop)
            .condition(Prepared { log: log.clone() })
            .build();

        let queue = queue();
        queue.add(op.clone()).unwrap();
        queue.wait_until_idle().await;

        assert_eq!(log.lock().clone(), vec!["prepare", "evaluate"]);
        assert_eq!(op.dependencies().len(), 1);
        assert!(op.errors().is_empty());
    }

    #[tokio::test]
    async fn cancel_while_pending_never_executes() {
        let blocker = Operation::from_fn("blocker", |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        let executed = Arc::new(AtomicBool::new(false));
        let flag = executed.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let op = Operation::builder("dependent", Flag(flag))
            .dependency(blocker.clone())
            .observer(BlockObserver::new().with_finish(move |_, errors| {
                sink.lock().extend(errors.iter().map(ToString::to_string));
            }))
            .build();

        let queue = queue();
        queue.add_all([blocker.clone(), op.clone()]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(op.state(), OperationState::Pending);

        op.cancel();
        op.wait_until_finished().await;

        assert!(!executed.load(Ordering::SeqCst));
        assert_eq!(observed.lock().clone(), vec!["operation cancelled"]);

        blocker.cancel();
        queue.wait_until_idle().await;
        assert_eq!(queue.operation_count(), 0);
    }

    #[tokio::test]
    async fn exclusive_operations_never_overlap() {
        let registry = Arc::new(ExclusivityRegistry::new());
        // Two queues sharing one registry.
        let first = OperationQueue::new(QueueConfig::named("first"), registry.clone());
        let second = OperationQueue::new(QueueConfig::named("second"), registry);
        let active = Arc::new(AtomicU32::new(0));
        let overlaps = Arc::new(AtomicU32::new(0));

        let mut ops = Vec::new();
        for i in 0..6 {
            let active = active.clone();
            let overlaps = overlaps.clone();
            let op = Operation::from_fn(format!("exclusive-{i}"), move |_ctx| async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            op.add_condition(MutuallyExclusive::new("alert")).unwrap();
            if i % 2 == 0 {
                first.add(op.clone()).unwrap();
            } else {
                second.add(op.clone()).unwrap();
            }
            ops.push(op);
        }

        for op in &ops {
            op.wait_until_finished().await;
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(ops.iter().all(|op| op.errors().is_empty()));
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let queue = OperationQueue::new(
            QueueConfig::named("limited").with_max_concurrent_operations(2),
            Arc::new(ExclusivityRegistry::new()),
        );
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for i in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            queue
                .add(Operation::from_fn(format!("op-{i}"), move |_ctx| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        queue.wait_until_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn produced_operations_are_enqueued() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let child = logging("child", &log);
        let parent = {
            let child = child.clone();
            Operation::from_fn("parent", move |ctx| async move {
                ctx.produce(child);
                Ok(())
            })
        };

        let queue = queue();
        queue.add(parent).unwrap();
        queue.wait_until_idle().await;

        assert_eq!(log.lock().clone(), vec!["child"]);
        assert!(child.is_finished());
    }

    #[tokio::test]
    async fn execution_error_is_reported() {
        let op = Operation::from_fn("failing", |_ctx| async {
            Err(OperationError::execution(anyhow::anyhow!("boom")))
        });
        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;

        let errors = op.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "execution failed: boom");
    }

    fn op_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn panicking_work_finishes_with_error() {
        let op = Operation::from_fn("panics", |_ctx| async {
            if op_should_panic() {
                panic!("bad state");
            }
            Ok(())
        });
        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;
        assert_eq!(op.errors().len(), 1);
        queue.wait_until_idle().await;
    }

    #[tokio::test]
    async fn adding_twice_is_rejected() {
        let op = Operation::from_fn("once", |_ctx| async { Ok(()) });
        let queue = queue();
        queue.add(op.clone()).unwrap();
        assert_eq!(queue.add(op.clone()), Err(LifecycleError::AlreadyEnqueued));
        queue.wait_until_idle().await;
    }

    #[tokio::test]
    async fn cancel_all_cancels_running_work() {
        let op = Operation::from_fn("long", |ctx| async move {
            ctx.cancelled().await;
            Err(OperationError::Cancelled)
        });
        let queue = queue();
        queue.add(op.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(op.state(), OperationState::Executing);

        queue.cancel_all();
        queue.wait_until_idle().await;
        assert!(op.errors()[0].is_cancelled());
    }
}
