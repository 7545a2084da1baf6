//! Conductor Core: cooperative operation orchestration.
//!
//! Operations are schedulable, cancellable units of asynchronous work with
//! declarative preconditions, inter-operation dependencies, lifecycle
//! observers and category-based mutual exclusion.

pub mod adapter;
pub mod condition;
pub mod config;
pub mod error;
pub mod exclusivity;
pub mod group;
pub mod observer;
pub mod operation;
pub mod queue;
pub mod state;
pub mod worker;

pub use adapter::{SuspendedTask, TaskAdapter, TaskPhase};
pub use condition::{Condition, ConditionResult, MutuallyExclusive};
pub use config::QueueConfig;
pub use error::{ConditionFailure, LifecycleError, OperationError};
pub use exclusivity::{ExclusivityRegistry, Ticket};
pub use group::GroupOperation;
pub use observer::{BlockObserver, Observer, ObserverSet};
pub use operation::{ExecutionContext, Execute, Operation, OperationBuilder, OperationId};
pub use queue::OperationQueue;
pub use state::OperationState;
pub use worker::{SerialRunnable, SerialWorker};
