//! Error types reported through an operation's finish error sequence.
//!
//! Operations never "throw" across the scheduler. Every failure, whether a
//! precondition that did not hold, leaf work that failed, or a cancellation,
//! ends up as an [`OperationError`] in the sequence handed to observers and
//! completion callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

// ---------------------------------------------------------------------------
// ConditionFailure
// ---------------------------------------------------------------------------

/// Payload of a failed condition: the condition kind plus diagnostic details.
///
/// `condition` is the machine-readable failure kind (the condition's name);
/// `details` carries free-form key/value pairs such as the host that could not
/// be reached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionFailure {
    pub condition: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ConditionFailure {
    /// Creates a failure for the named condition with no details.
    #[must_use]
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attaches a diagnostic key/value pair.
    #[must_use]
    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Looks up a diagnostic value by key.
    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.get(key)
    }
}

impl fmt::Display for ConditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition `{}` failed", self.condition)?;
        if !self.details.is_empty() {
            let details = serde_json::to_string(&self.details).map_err(|_| fmt::Error)?;
            write!(f, " {details}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// A single entry of an operation's finish error sequence.
///
/// Cloneable so the same sequence can be fanned out to every observer, the
/// completion callback and any aggregating group.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    /// A declared precondition did not hold. `execute()` never ran.
    #[error("{0}")]
    ConditionFailed(ConditionFailure),
    /// The leaf work itself failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(Arc<anyhow::Error>),
    /// Finished through cancellation before or during execution.
    #[error("operation cancelled")]
    Cancelled,
    /// Errors gathered from several child operations. Flattened into the
    /// owning operation's sequence when it finishes.
    #[error("{} child operation(s) failed", .0.len())]
    Group(Vec<OperationError>),
}

impl OperationError {
    /// Wraps an arbitrary error as an execution failure.
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        Self::ExecutionFailed(Arc::new(err.into()))
    }

    /// Returns `true` for [`OperationError::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the condition payload if this is a condition failure.
    #[must_use]
    pub fn condition_failure(&self) -> Option<&ConditionFailure> {
        match self {
            Self::ConditionFailed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Appends this error to `out`, expanding `Group` into its members.
    pub(crate) fn flatten_into(self, out: &mut Vec<OperationError>) {
        match self {
            Self::Group(errors) => {
                for err in errors {
                    err.flatten_into(out);
                }
            }
            other => out.push(other),
        }
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::ExecutionFailed(Arc::new(err))
    }
}

impl From<ConditionFailure> for OperationError {
    fn from(failure: ConditionFailure) -> Self {
        Self::ConditionFailed(failure)
    }
}

// ---------------------------------------------------------------------------
// LifecycleError
// ---------------------------------------------------------------------------

/// Misuse of the operation lifecycle. These are programmer errors and are
/// returned eagerly rather than silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("operation `{action}` is only legal before condition evaluation starts")]
    Sealed { action: &'static str },
    #[error("operation has already been added to a queue")]
    AlreadyEnqueued,
    #[error("operation cannot depend on itself")]
    SelfDependency,
    #[error("group operation has already finished")]
    GroupFinished,
    #[error("task was resumed by something other than its adapter")]
    TaskAlreadyStarted,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
