//! Wrapping an externally created, not-yet-started future as an operation.
//!
//! A [`SuspendedTask`] holds a future that does not run until it is resumed.
//! [`TaskAdapter`] resumes it when the owning operation executes, finishes the
//! operation on the task's first terminal signal, and forwards cancellation of
//! the operation to the task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LifecycleError, OperationError};
use crate::observer::BlockObserver;
use crate::operation::{ExecutionContext, Execute, Operation, OperationBuilder};

/// Lifecycle of a [`SuspendedTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Created, not started.
    Suspended,
    /// Resumed and running.
    Running,
    /// Cancellation was requested.
    Canceling,
    /// Output (or a cancellation result) is available.
    Completed,
}

/// A future paired with an explicit start signal and phase reporting.
pub struct SuspendedTask<T> {
    phase: watch::Sender<TaskPhase>,
    body: Mutex<Option<BoxFuture<'static, anyhow::Result<T>>>>,
    output: Mutex<Option<Result<T, OperationError>>>,
    cancellation: CancellationToken,
}

impl<T: Send + 'static> SuspendedTask<T> {
    /// Wraps `future` without polling it.
    #[must_use]
    pub fn new<F>(future: F) -> Arc<Self>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (phase, _) = watch::channel(TaskPhase::Suspended);
        Arc::new(Self {
            phase,
            body: Mutex::new(Some(future.boxed())),
            output: Mutex::new(None),
            cancellation: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn phase(&self) -> TaskPhase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TaskPhase> {
        self.phase.subscribe()
    }

    /// Starts the task on the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TaskAlreadyStarted`] unless the task is
    /// still suspended.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn resume(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == TaskPhase::Suspended {
                *phase = TaskPhase::Running;
                true
            } else {
                false
            }
        });
        let body = if started { self.body.lock().take() } else { None };
        let Some(body) = body else {
            return Err(LifecycleError::TaskAlreadyStarted);
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = body => result.map_err(OperationError::from),
                () = this.cancellation.cancelled() => Err(OperationError::Cancelled),
            };
            this.complete(result);
        });
        Ok(())
    }

    /// Requests cancellation. A suspended task completes immediately with
    /// [`OperationError::Cancelled`] and its future is dropped unpolled.
    pub fn cancel(&self) {
        let mut previous = None;
        self.phase.send_if_modified(|phase| {
            previous = Some(*phase);
            match phase {
                TaskPhase::Suspended | TaskPhase::Running => {
                    *phase = TaskPhase::Canceling;
                    true
                }
                TaskPhase::Canceling | TaskPhase::Completed => false,
            }
        });
        match previous {
            Some(TaskPhase::Suspended) => {
                self.body.lock().take();
                self.complete(Err(OperationError::Cancelled));
            }
            Some(TaskPhase::Running) => self.cancellation.cancel(),
            _ => {}
        }
    }

    /// Takes the task output. `None` until the task completed, and after the
    /// output was taken.
    #[must_use]
    pub fn take_output(&self) -> Option<Result<T, OperationError>> {
        self.output.lock().take()
    }

    /// The task's error, if it completed with one.
    fn failure(&self) -> Option<OperationError> {
        self.output
            .lock()
            .as_ref()
            .and_then(|output| output.as_ref().err().cloned())
    }

    fn complete(&self, result: Result<T, OperationError>) {
        *self.output.lock() = Some(result);
        self.phase.send_modify(|phase| *phase = TaskPhase::Completed);
    }
}

impl<T> std::fmt::Debug for SuspendedTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendedTask")
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TaskAdapter
// ---------------------------------------------------------------------------

/// Work body that runs a [`SuspendedTask`].
///
/// The task's output stays in the task for its owner to
/// [`take`](SuspendedTask::take_output); a failed task also reports its error
/// through the operation's finish error sequence.
pub struct TaskAdapter<T> {
    task: Arc<SuspendedTask<T>>,
    settled: AtomicBool,
}

impl<T: Send + 'static> TaskAdapter<T> {
    /// Builder for an operation that runs `task`. Cancelling the operation
    /// cancels the task.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TaskAlreadyStarted`] unless `task` is still
    /// suspended.
    pub fn builder(
        name: impl Into<String>,
        task: Arc<SuspendedTask<T>>,
    ) -> Result<OperationBuilder, LifecycleError> {
        if task.phase() != TaskPhase::Suspended {
            return Err(LifecycleError::TaskAlreadyStarted);
        }
        let forward = Arc::clone(&task);
        Ok(Operation::builder(
            name,
            Self {
                task,
                settled: AtomicBool::new(false),
            },
        )
        .observer(BlockObserver::new().with_cancel(move |_| forward.cancel())))
    }

    /// Operation that runs `task`.
    ///
    /// # Errors
    ///
    /// See [`builder`](Self::builder).
    pub fn operation(
        name: impl Into<String>,
        task: Arc<SuspendedTask<T>>,
    ) -> Result<Operation, LifecycleError> {
        Ok(Self::builder(name, task)?.build())
    }

    /// Claims the right to report the outcome. Only the first terminal
    /// signal wins.
    fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[async_trait]
impl<T: Send + 'static> Execute for TaskAdapter<T> {
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), OperationError> {
        let mut phases = self.task.subscribe();
        self.task.resume().map_err(OperationError::execution)?;
        debug!(operation = %ctx.operation().name(), "task resumed");

        loop {
            let phase = *phases.borrow_and_update();
            match phase {
                TaskPhase::Canceling if self.settle() => return Err(OperationError::Cancelled),
                TaskPhase::Completed if self.settle() => {
                    return self.task.failure().map_or(Ok(()), Err);
                }
                TaskPhase::Canceling | TaskPhase::Completed => return Ok(()),
                TaskPhase::Suspended | TaskPhase::Running => {}
            }
            if phases.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::QueueConfig;
    use crate::exclusivity::ExclusivityRegistry;
    use crate::queue::OperationQueue;

    fn queue() -> OperationQueue {
        OperationQueue::new(QueueConfig::named("test"), Arc::new(ExclusivityRegistry::new()))
    }

    #[tokio::test]
    async fn task_output_is_available_after_finish() {
        let task = SuspendedTask::new(async { Ok::<_, anyhow::Error>(42) });
        let op = TaskAdapter::operation("answer", task.clone()).unwrap();
        assert_eq!(task.phase(), TaskPhase::Suspended);

        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;

        assert!(op.errors().is_empty());
        assert_eq!(task.phase(), TaskPhase::Completed);
        assert_eq!(task.take_output().unwrap().unwrap(), 42);
        assert!(task.take_output().is_none());
    }

    #[tokio::test]
    async fn task_error_is_reported() {
        let task = SuspendedTask::new(async { Err::<(), _>(anyhow::anyhow!("lookup failed")) });
        let op = TaskAdapter::operation("lookup", task).unwrap();
        let queue = queue();
        queue.add(op.clone()).unwrap();
        op.wait_until_finished().await;

        let errors = op.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "execution failed: lookup failed");
    }

    #[tokio::test]
    async fn cancelling_operation_cancels_task() {
        let task = SuspendedTask::new(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, anyhow::Error>(())
        });
        let op = TaskAdapter::operation("slow", task.clone()).unwrap();
        let queue = queue();
        queue.add(op.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.phase(), TaskPhase::Running);

        op.cancel();
        op.wait_until_finished().await;

        let errors = op.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_cancelled());
    }

    #[tokio::test]
    async fn started_task_is_rejected() {
        let task = SuspendedTask::new(async { Ok::<_, anyhow::Error>(()) });
        task.resume().unwrap();
        assert!(matches!(
            TaskAdapter::operation("late", task.clone()),
            Err(LifecycleError::TaskAlreadyStarted)
        ));
        assert_eq!(task.resume(), Err(LifecycleError::TaskAlreadyStarted));
    }

    #[test]
    fn cancelling_suspended_task_completes_it() {
        let task = SuspendedTask::new(async { Ok::<_, anyhow::Error>(1) });
        task.cancel();
        assert_eq!(task.phase(), TaskPhase::Completed);
        assert!(task.take_output().unwrap().unwrap_err().is_cancelled());
    }
}
