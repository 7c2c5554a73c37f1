use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Script body marker meaning "ask the evaluator for the real body at run time".
pub const LAZY_SENTINEL: &str = "# __TO_BE_LAZY_EVALUATED__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Body(String),
    Lazy,
}

impl Script {
    pub fn from_raw(raw: Option<String>) -> Option<Self> {
        raw.map(|body| {
            if body == LAZY_SENTINEL {
                Script::Lazy
            } else {
                Script::Body(body)
            }
        })
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Script::Lazy)
    }
}

/// Which script body a given execution runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSelection {
    FetchOutput,
    Custom(String),
    Run,
}

impl ScriptSelection {
    /// `fetchOutput` wins over a custom function, which wins over `run`.
    pub fn new(output_only: bool, custom_function: Option<&str>) -> Self {
        match (output_only, custom_function) {
            (true, _) => Self::FetchOutput,
            (false, Some(name)) => Self::Custom(name.to_string()),
            (false, None) => Self::Run,
        }
    }

    /// Output is computed and persisted for plain runs and output fetches, never for custom functions.
    pub fn produces_output(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dependency {
    /// Reference to another task by id.
    Task(String),
    /// Sub-record that is not a task itself but carries its own `deps`.
    Nested(NestedDeps),
    /// Anything else, passed through untouched.
    Value(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedDeps {
    pub flake_attribute_path: Option<String>,
    pub reference: Option<String>,
    pub deps: BTreeMap<String, Dependency>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub flake_attribute_path: String,
    pub flake_pretty_attribute_path: String,
    pub reference: String,
    pub pretty_ref: String,
    pub original_flake_url: String,
    pub resolved_original_flake_url: String,

    pub deps: BTreeMap<String, Dependency>,
    /// Flattened task references reachable through `deps`, in discovery order.
    pub all_discovered_deps: Vec<String>,
    /// Set only on reverse-mode tasks: the dependency set before reversal.
    pub original_deps: Option<Vec<String>>,

    pub run: Option<Script>,
    pub fetch_output: Option<Script>,
    pub custom_functions: BTreeMap<String, Script>,
    pub has_get_output: bool,

    pub artifacts: Vec<String>,
    pub dir: Option<String>,
    pub path: Vec<String>,
    pub tags: Vec<String>,
    pub impure_env_passthrough: Vec<String>,
    pub store_dependencies: Vec<String>,

    pub exact_ref_match: bool,
}

impl Task {
    pub fn script(&self, selection: &ScriptSelection) -> Option<&Script> {
        match selection {
            ScriptSelection::FetchOutput => self.fetch_output.as_ref(),
            ScriptSelection::Custom(name) => self.custom_functions.get(name),
            ScriptSelection::Run => self.run.as_ref(),
        }
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }

    /// Directory key used for per-task state: name first so truncated listings stay readable.
    pub fn dir_key(&self) -> String {
        let short: String = self.id.chars().take(12).collect();
        format!("{}-{}", self.name, short)
    }
}

/// Walks `deps` depth-first and returns every task reference once, in discovery order.
pub fn discover_dependencies(deps: &BTreeMap<String, Dependency>) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen_tasks = HashSet::new();
    let mut seen_nested = HashSet::new();
    walk(deps, &mut found, &mut seen_tasks, &mut seen_nested);
    found
}

fn walk(
    deps: &BTreeMap<String, Dependency>,
    found: &mut Vec<String>,
    seen_tasks: &mut HashSet<String>,
    seen_nested: &mut HashSet<String>,
) {
    for dep in deps.values() {
        match dep {
            Dependency::Task(id) => {
                if seen_tasks.insert(id.clone()) {
                    found.push(id.clone());
                }
            }
            Dependency::Nested(nested) => {
                // The same sub-record reached twice is walked once.
                if let Some(path) = &nested.flake_attribute_path {
                    if !seen_nested.insert(path.clone()) {
                        continue;
                    }
                }
                walk(&nested.deps, found, seen_tasks, seen_nested);
            }
            Dependency::Value(_) => {}
        }
    }
}

/// Task universe with id lookup, preserving load order.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Arc<Task>>,
    index: HashMap<String, usize>,
}

impl TaskSet {
    pub fn new(tasks: Vec<Arc<Task>>) -> Self {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            index.entry(task.id.clone()).or_insert(i);
        }
        Self { tasks, index }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Task>> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Arc<Task>> {
        self.tasks.clone()
    }
}

impl FromIterator<Arc<Task>> for TaskSet {
    fn from_iter<I: IntoIterator<Item = Arc<Task>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
