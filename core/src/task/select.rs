use std::sync::Arc;

use crate::error::SelectionError;

use super::model::{Task, TaskSet};

/// Swaps dependency direction: each task now "depends on" the tasks that depended on it.
///
/// The pre-reversal set is kept in `original_deps` so outputs can still be fetched
/// in the original order.
pub fn reverse_dependencies(tasks: &TaskSet) -> TaskSet {
    tasks
        .iter()
        .map(|task| {
            let dependents: Vec<String> = tasks
                .iter()
                .filter(|other| other.all_discovered_deps.iter().any(|d| d == &task.id))
                .map(|other| other.id.clone())
                .collect();
            Arc::new(Task {
                original_deps: Some(task.all_discovered_deps.clone()),
                all_discovered_deps: dependents,
                ..Task::clone(task)
            })
        })
        .collect()
}

/// The single task selected verbatim, for isolated execution.
pub fn find_only_task(tasks: &TaskSet) -> Result<&Arc<Task>, SelectionError> {
    let mut matches = tasks.iter().filter(|t| t.exact_ref_match);
    match (matches.next(), matches.count()) {
        (None, _) => Err(SelectionError::NoExactMatch),
        (Some(task), 0) => Ok(task),
        (Some(_), rest) => Err(SelectionError::AmbiguousExactMatch(rest + 1)),
    }
}

pub fn filter_by_tags(tasks: &TaskSet, tags: &[String]) -> TaskSet {
    tasks.iter().filter(|t| t.has_any_tag(tags)).cloned().collect()
}

/// Parses a comma-separated tag list, ignoring blanks.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
