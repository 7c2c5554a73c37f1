//! Task records as consumed by the scheduler and executor.
//!
//! Tasks are built once per run from the evaluator's raw records
//! ([`collect_tasks`]) and are immutable afterwards. Reverse mode
//! ([`reverse_dependencies`]) produces new values rather than mutating.

mod collect;
mod model;
mod select;

pub use collect::{collect_tasks, pretty_attribute_path, RawTask};
pub use model::{
    discover_dependencies, Dependency, NestedDeps, Script, ScriptSelection, Task, TaskSet,
    LAZY_SENTINEL,
};
pub use select::{filter_by_tags, find_only_task, parse_tags, reverse_dependencies};

#[cfg(test)]
pub(crate) use model::fixtures;
