//! Trigger rule evaluation.
//!
//! A task whose dependencies are all terminal either becomes eligible or is
//! skipped, depending on its rule evaluated over those terminal states.

use cascade_types::workflow::{TaskStatus, TriggerRule};

/// Evaluate `rule` over the terminal statuses of a task's dependencies.
///
/// Callers only evaluate once every dependency is terminal. Tasks without
/// dependencies are eligible unconditionally and never reach this function.
pub fn evaluate<I>(rule: TriggerRule, dependency_statuses: I) -> bool
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut total = 0usize;
    for status in dependency_statuses {
        total += 1;
        match status {
            TaskStatus::Succeeded => succeeded += 1,
            TaskStatus::Failed => failed += 1,
            _ => {}
        }
    }

    match rule {
        TriggerRule::AllSuccess => succeeded == total,
        TriggerRule::AllFailed => failed == total,
        TriggerRule::OneSuccess => succeeded > 0,
        TriggerRule::OneFailed => failed > 0,
        TriggerRule::NoneFailed => failed == 0,
    }
}
