//! The operation state machine.
//!
//! An [`Operation`] is a cheap, cloneable handle to a schedulable unit of
//! asynchronous work. It owns its conditions, observers, dependencies and
//! cancellation flag, and moves strictly forward through
//! [`OperationState`]. The work body itself is any [`Execute`]
//! implementation; the state machine never calls it twice and never calls it
//! before every condition is satisfied.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::condition::Condition;
use crate::error::{LifecycleError, OperationError};
use crate::exclusivity::ExclusivityRegistry;
use crate::observer::{Observer, ObserverSet};
use crate::state::OperationState;

/// Process-wide operation id allocator. Ids start at 1.
static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an operation within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub u64);

impl OperationId {
    fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Execute trait
// ---------------------------------------------------------------------------

/// The work body of an operation.
///
/// Leaf work (a network fetch, a location lookup, a decode step) implements
/// this trait; the state machine holds it as `Arc<dyn Execute>`.
/// Long-running bodies should watch [`ExecutionContext::cancelled`] and
/// unwind promptly.
#[async_trait]
pub trait Execute: Send + Sync + 'static {
    /// Runs the work. Returning `Err(OperationError::Group(..))` reports
    /// several errors at once.
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), OperationError>;

    /// Cleanup hook, run once when the operation starts finishing and before
    /// any observer is notified.
    fn finished(&self, _operation: &Operation, _errors: &[OperationError]) {}
}

/// Work body backed by a one-shot closure.
struct FnWork<F> {
    body: Mutex<Option<F>>,
}

#[async_trait]
impl<F, Fut> Execute for FnWork<F>
where
    F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), OperationError> {
        let body = self.body.lock().take();
        match body {
            Some(body) => body(ctx).await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

type CompletionFn = Box<dyn FnOnce(&[OperationError]) + Send>;

/// Everything that may only change before condition evaluation starts.
#[derive(Default)]
struct Setup {
    sealed: bool,
    conditions: Vec<Arc<dyn Condition>>,
    observers: ObserverSet,
    dependencies: Vec<Operation>,
}

struct Inner {
    id: OperationId,
    name: String,
    work: Arc<dyn Execute>,
    state: watch::Sender<OperationState>,
    setup: Mutex<Setup>,
    cancelled: AtomicBool,
    cancellation: CancellationToken,
    finish_claimed: AtomicBool,
    errors: Mutex<Vec<OperationError>>,
    completion: Mutex<Option<CompletionFn>>,
}

/// Handle to a schedulable, cancellable unit of work.
///
/// Clones share the same underlying operation. Equality and hashing follow
/// [`OperationId`].
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

impl Operation {
    /// Creates an operation in the `Initialized` state.
    #[must_use]
    pub fn new(name: impl Into<String>, work: impl Execute) -> Self {
        Self::builder(name, work).build()
    }

    /// Starts building an operation with conditions, observers and
    /// dependencies attached up front.
    #[must_use]
    pub fn builder(name: impl Into<String>, work: impl Execute) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            work: Arc::new(work),
            setup: Setup::default(),
            completion: None,
        }
    }

    /// Creates an operation whose work body is an async closure.
    ///
    /// ```
    /// use conductor_core::Operation;
    ///
    /// let op = Operation::from_fn("hello", |_ctx| async {
    ///     println!("hello");
    ///     Ok(())
    /// });
    /// assert_eq!(op.name(), "hello");
    /// ```
    #[must_use]
    pub fn from_fn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        Self::new(
            name,
            FnWork {
                body: Mutex::new(Some(body)),
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver observing every state transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<OperationState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Accumulated errors. Complete once the operation has finished.
    #[must_use]
    pub fn errors(&self) -> Vec<OperationError> {
        self.inner.errors.lock().clone()
    }

    /// Snapshot of the declared dependencies, in insertion order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Operation> {
        self.inner.setup.lock().dependencies.clone()
    }

    // -- setup ---------------------------------------------------------------

    /// Declares a precondition.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Sealed`] once condition evaluation has started.
    pub fn add_condition(&self, condition: impl Condition) -> Result<(), LifecycleError> {
        let mut setup = self.inner.setup.lock();
        if setup.sealed {
            return Err(LifecycleError::Sealed {
                action: "add_condition",
            });
        }
        setup.conditions.push(Arc::new(condition));
        Ok(())
    }

    /// Attaches an observer. Observers are notified in the order added.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Sealed`] once condition evaluation has started.
    pub fn add_observer(&self, observer: impl Observer + 'static) -> Result<(), LifecycleError> {
        let mut setup = self.inner.setup.lock();
        if setup.sealed {
            return Err(LifecycleError::Sealed {
                action: "add_observer",
            });
        }
        setup.observers.add(Arc::new(observer));
        Ok(())
    }

    /// Makes this operation wait for `dependency` to finish before it
    /// evaluates its conditions.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Sealed`] once condition evaluation has started
    /// and [`LifecycleError::SelfDependency`] if `dependency` is this operation.
    pub fn add_dependency(&self, dependency: Operation) -> Result<(), LifecycleError> {
        if dependency == *self {
            return Err(LifecycleError::SelfDependency);
        }
        let mut setup = self.inner.setup.lock();
        if setup.sealed {
            return Err(LifecycleError::Sealed {
                action: "add_dependency",
            });
        }
        setup.dependencies.push(dependency);
        Ok(())
    }

    /// Registers a callback run once after the operation reached `Finished`.
    /// Replaces any previously registered callback.
    pub fn set_completion(&self, completion: impl FnOnce(&[OperationError]) + Send + 'static) {
        *self.inner.completion.lock() = Some(Box::new(completion));
    }

    // -- lifecycle -----------------------------------------------------------

    /// Requests cancellation. Idempotent and safe from any thread.
    ///
    /// Cancellation is cooperative: a pending operation finishes with
    /// [`OperationError::Cancelled`] without running its work; an executing
    /// one is signalled through its [`ExecutionContext`].
    pub fn cancel(&self) {
        if self.state() >= OperationState::Finishing {
            return;
        }
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancellation.cancel();
        debug!(operation = %self.name(), id = %self.id(), "cancelled");
        self.observers().on_cancel(self);
    }

    /// Cancels and records `error` in the finish error sequence. Returns
    /// `false`, dropping `error`, once finishing has started.
    pub fn cancel_with_error(&self, error: OperationError) -> bool {
        {
            // `finish` claims before it takes the errors under this lock.
            let mut errors = self.inner.errors.lock();
            if self.inner.finish_claimed.load(Ordering::Acquire) {
                return false;
            }
            errors.push(error);
        }
        self.cancel();
        true
    }

    /// Finishes the operation. Only the first caller wins; later calls are
    /// no-ops.
    ///
    /// Order of effects: the work's cleanup hook, every observer's finish
    /// hook in addition order, the transition to `Finished`, then the
    /// completion callback. All of them receive the accumulated error
    /// sequence: errors recorded earlier (condition failures, cancellation
    /// errors) followed by `errors`.
    pub fn finish(&self, errors: Vec<OperationError>) {
        if self
            .inner
            .finish_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.advance(OperationState::Finishing);

        let combined = {
            let mut accumulated = mem::take(&mut *self.inner.errors.lock());
            for error in errors {
                error.flatten_into(&mut accumulated);
            }
            accumulated
        };

        self.inner.work.finished(self, &combined);
        self.observers().on_finish(self, &combined);
        self.inner.errors.lock().clone_from(&combined);
        self.advance(OperationState::Finished);

        let completion = self.inner.completion.lock().take();
        if let Some(completion) = completion {
            completion(&combined);
        }
    }

    /// Hands a newly created operation to whoever observes this one. When
    /// this operation runs on a queue, the queue enqueues `operation`.
    pub fn produce(&self, operation: Operation) {
        debug!(
            operation = %self.name(),
            produced = %operation.name(),
            "produced operation"
        );
        self.observers().on_produce(self, &operation);
    }

    /// Resolves once the operation reached `Finished`.
    pub async fn wait_until_finished(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    // -- crate-internal ------------------------------------------------------

    /// `Initialized -> Pending`. Called once by the queue.
    pub(crate) fn will_enqueue(&self) -> Result<(), LifecycleError> {
        let enqueued = self.inner.state.send_if_modified(|state| {
            if *state == OperationState::Initialized {
                *state = OperationState::Pending;
                true
            } else {
                false
            }
        });
        if enqueued {
            debug!(operation = %self.name(), id = %self.id(), state = %OperationState::Pending, "state transition");
            Ok(())
        } else {
            Err(LifecycleError::AlreadyEnqueued)
        }
    }

    /// Moves forward to `next`. Returns `false` if the operation is already at
    /// or past `next`.
    pub(crate) fn advance(&self, next: OperationState) -> bool {
        let advanced = self.inner.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if advanced {
            debug!(operation = %self.name(), id = %self.id(), state = %next, "state transition");
        }
        advanced
    }

    /// Freezes setup if the dependency list still has `expected` entries.
    /// Returns `false` when dependencies were added concurrently.
    pub(crate) fn seal(&self, expected_dependencies: usize) -> bool {
        let mut setup = self.inner.setup.lock();
        if setup.dependencies.len() != expected_dependencies {
            return false;
        }
        setup.sealed = true;
        true
    }

    pub(crate) fn conditions(&self) -> Vec<Arc<dyn Condition>> {
        self.inner.setup.lock().conditions.clone()
    }

    pub(crate) fn observers(&self) -> ObserverSet {
        self.inner.setup.lock().observers.clone()
    }

    pub(crate) fn work(&self) -> Arc<dyn Execute> {
        Arc::clone(&self.inner.work)
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OperationBuilder
// ---------------------------------------------------------------------------

/// Builder for an [`Operation`] in the `Initialized` state. Attaching
/// conditions, observers and dependencies here cannot fail.
pub struct OperationBuilder {
    name: String,
    work: Arc<dyn Execute>,
    setup: Setup,
    completion: Option<CompletionFn>,
}

impl OperationBuilder {
    #[must_use]
    pub fn condition(mut self, condition: impl Condition) -> Self {
        self.setup.conditions.push(Arc::new(condition));
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl Observer + 'static) -> Self {
        self.setup.observers.add(Arc::new(observer));
        self
    }

    #[must_use]
    pub fn dependency(mut self, dependency: Operation) -> Self {
        self.setup.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn completion(mut self, completion: impl FnOnce(&[OperationError]) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    #[must_use]
    pub fn build(self) -> Operation {
        let (state, _) = watch::channel(OperationState::Initialized);
        Operation {
            inner: Arc::new(Inner {
                id: OperationId::next(),
                name: self.name,
                work: self.work,
                state,
                setup: Mutex::new(self.setup),
                cancelled: AtomicBool::new(false),
                cancellation: CancellationToken::new(),
                finish_claimed: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
                completion: Mutex::new(self.completion),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Context handed to a work body.
///
/// Carries the running operation (for cancellation and producing follow-up
/// operations) and the exclusivity registry of the queue running it, so
/// nested queues share the same mutual-exclusion slots.
#[derive(Clone)]
pub struct ExecutionContext {
    operation: Operation,
    exclusivity: Arc<ExclusivityRegistry>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(operation: Operation, exclusivity: Arc<ExclusivityRegistry>) -> Self {
        Self {
            operation,
            exclusivity,
        }
    }

    /// The operation being executed.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.operation.is_cancelled()
    }

    /// Resolves once the operation is cancelled.
    pub async fn cancelled(&self) {
        self.operation.cancellation().cancelled().await;
    }

    /// Child token cancelled together with the operation, for threading into
    /// leaf calls.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.operation.cancellation().child_token()
    }

    /// Hands a follow-up operation to the owning queue.
    pub fn produce(&self, operation: Operation) {
        self.operation.produce(operation);
    }

    #[must_use]
    pub fn exclusivity(&self) -> &Arc<ExclusivityRegistry> {
        &self.exclusivity
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
