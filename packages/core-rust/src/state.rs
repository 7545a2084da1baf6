//! Operation lifecycle states.

use std::fmt;

/// Lifecycle state of an operation.
///
/// State machine, strictly forward:
/// `Initialized -> Pending -> EvaluatingConditions -> Ready -> Executing -> Finishing -> Finished`
///
/// States may be skipped (a cancelled `Pending` operation goes straight to
/// `Finishing`) but never revisited. The derived ordering follows declaration
/// order, so "has reached X" is `state >= X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationState {
    /// Constructed by its owner, not yet handed to a queue.
    Initialized,
    /// Added to a queue; waiting for dependencies.
    Pending,
    /// Dependencies finished; conditions are being evaluated.
    EvaluatingConditions,
    /// All conditions satisfied; waiting for exclusivity and a worker slot.
    Ready,
    /// The work body is running.
    Executing,
    /// `finish()` has been claimed; cleanup and observers are running.
    Finishing,
    /// Terminal.
    Finished,
}

impl OperationState {
    /// Whether a transition from `self` to `next` moves strictly forward.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }

    /// Returns `true` once the operation can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Finished
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::EvaluatingConditions => "evaluating_conditions",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL: [OperationState; 7] = [
        OperationState::Initialized,
        OperationState::Pending,
        OperationState::EvaluatingConditions,
        OperationState::Ready,
        OperationState::Executing,
        OperationState::Finishing,
        OperationState::Finished,
    ];

    #[test]
    fn only_finished_is_terminal() {
        assert!(OperationState::Finished.is_terminal());
        assert!(!OperationState::Finishing.is_terminal());
        assert!(!OperationState::Initialized.is_terminal());
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(
            OperationState::EvaluatingConditions.to_string(),
            "evaluating_conditions"
        );
        assert_eq!(OperationState::Finished.to_string(), "finished");
    }

    proptest! {
        /// Applying any sequence of attempted transitions, keeping only the
        /// legal ones, never revisits a state.
        #[test]
        fn legal_transitions_never_revisit(attempts in proptest::collection::vec(0usize..7, 0..32)) {
            let mut current = OperationState::Initialized;
            let mut visited = vec![current];
            for idx in attempts {
                let next = ALL[idx];
                if current.can_advance_to(next) {
                    prop_assert!(!visited.contains(&next));
                    visited.push(next);
                    current = next;
                }
            }
            prop_assert!(visited.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
