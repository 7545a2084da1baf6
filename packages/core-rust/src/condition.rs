//! Declarative preconditions and the condition evaluator.
//!
//! A [`Condition`] gates an operation's execution. It may contribute one
//! dependency operation that must finish before the condition is evaluated,
//! and it may be mutually exclusive, in which case the queue serializes every
//! operation declaring the same exclusivity category.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::error::{ConditionFailure, OperationError};
use crate::operation::Operation;

/// Outcome of evaluating a single condition.
pub type ConditionResult = Result<(), ConditionFailure>;

/// A precondition attached to an operation.
#[async_trait]
pub trait Condition: Send + Sync + 'static {
    /// Machine-readable name; also the failure kind reported on failure.
    fn name(&self) -> &str;

    /// Whether operations declaring this condition must not execute
    /// concurrently with each other.
    fn is_mutually_exclusive(&self) -> bool {
        false
    }

    /// Exclusivity category. Only consulted when
    /// [`is_mutually_exclusive`](Self::is_mutually_exclusive) is `true`.
    fn category(&self) -> &str {
        self.name()
    }

    /// Operation that must finish before this condition is evaluated, if any.
    ///
    /// Called once, when the owning operation is added to a queue. The
    /// returned operation is enqueued alongside its owner.
    fn dependency_for(&self, _operation: &Operation) -> Option<Operation> {
        None
    }

    /// Decides whether the condition holds for `operation`.
    async fn evaluate(&self, operation: &Operation) -> ConditionResult;
}

// ---------------------------------------------------------------------------
// MutuallyExclusive
// ---------------------------------------------------------------------------

/// Always-satisfied condition whose only effect is exclusivity.
///
/// Two operations carrying `MutuallyExclusive::new("location")` never execute
/// at the same time, regardless of which queue they were added to, as long as
/// the queues share an [`ExclusivityRegistry`](crate::ExclusivityRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutuallyExclusive {
    category: String,
}

impl MutuallyExclusive {
    #[must_use]
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }

    /// Category named after a Rust type, for exclusivity over a resource
    /// represented by that type.
    #[must_use]
    pub fn of<T: ?Sized>() -> Self {
        Self::new(format!("MutuallyExclusive<{}>", std::any::type_name::<T>()))
    }
}

#[async_trait]
impl Condition for MutuallyExclusive {
    fn name(&self) -> &str {
        &self.category
    }

    fn is_mutually_exclusive(&self) -> bool {
        true
    }

    async fn evaluate(&self, _operation: &Operation) -> ConditionResult {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Collects the dependency operation of every condition, in declaration order.
pub(crate) fn resolve_dependencies(
    operation: &Operation,
    conditions: &[Arc<dyn Condition>],
) -> Vec<Operation> {
    conditions
        .iter()
        .filter_map(|condition| condition.dependency_for(operation))
        .collect()
}

/// Evaluates every condition concurrently and returns one
/// [`OperationError::ConditionFailed`] per failing condition, in declaration
/// order.
pub(crate) async fn evaluate_all(
    operation: &Operation,
    conditions: &[Arc<dyn Condition>],
) -> Vec<OperationError> {
    let results = join_all(conditions.iter().map(|c| c.evaluate(operation))).await;
    results
        .into_iter()
        .filter_map(Result::err)
        .map(OperationError::ConditionFailed)
        .collect()
}

/// Sorted, de-duplicated exclusivity categories declared by `conditions`.
///
/// Sorting gives every operation the same acquisition order, so two
/// operations sharing several categories cannot deadlock each other.
pub(crate) fn exclusive_categories(conditions: &[Arc<dyn Condition>]) -> Vec<String> {
    let mut categories: Vec<String> = conditions
        .iter()
        .filter(|c| c.is_mutually_exclusive())
        .map(|c| c.category().to_string())
        .collect();
    categories.sort();
    categories.dedup();
    categories
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
