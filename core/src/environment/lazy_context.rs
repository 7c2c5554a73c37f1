use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::task::{Dependency, Task, TaskSet};

/// `{ "deps": … }` mirroring `task.deps`, with each task reference replaced by its persisted output.
///
/// A dependency that has never produced output (or whose output file is unreadable) becomes `null`.
pub async fn build_lazy_context(
    task: &Task,
    universe: &TaskSet,
    output_file: impl Fn(&Task) -> PathBuf,
) -> Value {
    let mut ids = Vec::new();
    referenced_tasks(&task.deps, &mut ids);

    let mut outputs = HashMap::new();
    for id in ids {
        if outputs.contains_key(&id) {
            continue;
        }
        let value = match universe.get(&id) {
            Some(dep) => read_output(&output_file(dep)).await,
            None => Value::Null,
        };
        outputs.insert(id, value);
    }

    serde_json::json!({ "deps": map_deps(&task.deps, &outputs) })
}

fn referenced_tasks(deps: &BTreeMap<String, Dependency>, out: &mut Vec<String>) {
    for dep in deps.values() {
        match dep {
            Dependency::Task(id) => out.push(id.clone()),
            Dependency::Nested(nested) => referenced_tasks(&nested.deps, out),
            Dependency::Value(_) => {}
        }
    }
}

fn map_deps(deps: &BTreeMap<String, Dependency>, outputs: &HashMap<String, Value>) -> Value {
    let mut out = Map::new();
    for (role, dep) in deps {
        let value = match dep {
            Dependency::Task(id) => outputs.get(id).cloned().unwrap_or(Value::Null),
            Dependency::Nested(nested) => map_deps(&nested.deps, outputs),
            Dependency::Value(v) => v.clone(),
        };
        out.insert(role.clone(), value);
    }
    Value::Object(out)
}

async fn read_output(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable task output");
            Value::Null
        }),
        Err(_) => Value::Null,
    }
}
