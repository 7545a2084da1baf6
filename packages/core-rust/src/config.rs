//! Queue configuration.

/// Configuration for an [`OperationQueue`](crate::OperationQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name used in tracing spans and logs.
    pub name: String,
    /// Maximum number of operations executing at once. `None` means
    /// unbounded.
    pub max_concurrent_operations: Option<usize>,
}

impl QueueConfig {
    /// Unbounded queue with the given name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrent_operations(mut self, limit: usize) -> Self {
        self.max_concurrent_operations = Some(limit);
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "conductor.queue".to_string(),
            max_concurrent_operations: None,
        }
    }
}
