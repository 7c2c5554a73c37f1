use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use super::model::{discover_dependencies, Dependency, NestedDeps, Script, Task};

/// A task record as emitted by the evaluator's task formatter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    pub id: String,
    pub flake_attribute_path: String,
    #[serde(default)]
    pub deps: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub fetch_output: Option<String>,
    #[serde(default)]
    pub custom_functions: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub has_get_output: bool,
    #[serde(default)]
    pub artifacts: Option<Vec<String>>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub impure_env_passthrough: Option<Vec<String>>,
    #[serde(default)]
    pub store_dependencies: Option<Vec<String>>,
}

/// Turns raw records from one flake into tasks, linking dependencies between them.
///
/// `passed_paths` are the attribute paths the user asked for; a task whose
/// attribute matches one verbatim is marked as an exact match.
pub fn collect_tasks(
    raw: Vec<RawTask>,
    flake_url: &str,
    resolved_flake_url: &str,
    passed_paths: &[String],
) -> Vec<Task> {
    let ids: HashSet<String> = raw.iter().map(|t| t.id.clone()).collect();

    raw.into_iter()
        .map(|r| {
            let deps = convert_deps(r.deps, &ids, flake_url);
            let all_discovered_deps = discover_dependencies(&deps);
            let flake_pretty_attribute_path = pretty_attribute_path(&r.flake_attribute_path);
            let name = r
                .flake_attribute_path
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string();

            Task {
                id: r.id,
                name,
                reference: format!("{flake_url}#{}", r.flake_attribute_path),
                pretty_ref: format!("{flake_url}#{flake_pretty_attribute_path}"),
                exact_ref_match: passed_paths.contains(&r.flake_attribute_path),
                flake_attribute_path: r.flake_attribute_path,
                flake_pretty_attribute_path,
                original_flake_url: flake_url.to_string(),
                resolved_original_flake_url: resolved_flake_url.to_string(),
                deps,
                all_discovered_deps,
                original_deps: None,
                run: Script::from_raw(r.run),
                fetch_output: Script::from_raw(r.fetch_output),
                custom_functions: r
                    .custom_functions
                    .into_iter()
                    .filter_map(|(k, v)| Script::from_raw(v).map(|s| (k, s)))
                    .collect(),
                has_get_output: r.has_get_output,
                artifacts: r.artifacts.unwrap_or_default(),
                dir: r.dir,
                path: r.path.unwrap_or_default(),
                tags: r.tags.unwrap_or_default(),
                impure_env_passthrough: r.impure_env_passthrough.unwrap_or_default(),
                store_dependencies: r.store_dependencies.unwrap_or_default(),
            }
        })
        .collect()
}

fn convert_deps(
    raw: BTreeMap<String, serde_json::Value>,
    ids: &HashSet<String>,
    flake_url: &str,
) -> BTreeMap<String, Dependency> {
    raw.into_iter()
        .map(|(role, value)| (role, convert_dep(value, ids, flake_url)))
        .collect()
}

fn convert_dep(value: serde_json::Value, ids: &HashSet<String>, flake_url: &str) -> Dependency {
    match value {
        serde_json::Value::String(s) if ids.contains(&s) => Dependency::Task(s),
        serde_json::Value::Object(mut obj)
            if obj.get("__type").and_then(|t| t.as_str()) == Some("taskOutput")
                && obj.get("deps").is_some_and(|d| d.is_object()) =>
        {
            let flake_attribute_path = obj
                .get("flakeAttributePath")
                .and_then(|p| p.as_str())
                .map(str::to_string);
            let deps = match obj.remove("deps") {
                Some(serde_json::Value::Object(d)) => d.into_iter().collect(),
                _ => BTreeMap::new(),
            };
            Dependency::Nested(NestedDeps {
                reference: flake_attribute_path
                    .as_ref()
                    .map(|p| format!("{flake_url}#{p}")),
                flake_attribute_path,
                deps: convert_deps(deps, ids, flake_url),
            })
        }
        other => Dependency::Value(other),
    }
}

/// Strips the leading `tasks.<system>.` segment (display only).
pub fn pretty_attribute_path(path: &str) -> String {
    let Some(rest) = path.strip_prefix("tasks.") else {
        return path.to_string();
    };
    match rest.split_once('.') {
        Some((system, tail))
            if !system.is_empty()
                && system
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            tail.to_string()
        }
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(json: serde_json::Value) -> Vec<RawTask> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn links_dependencies_and_derives_names() {
        let tasks = collect_tasks(
            raw(serde_json::json!([
                {
                    "id": "aaa",
                    "flakeAttributePath": "tasks.x86_64-linux.build",
                    "deps": {},
                    "run": "make",
                    "tags": ["ci"]
                },
                {
                    "id": "bbb",
                    "flakeAttributePath": "tasks.x86_64-linux.deploy.prod",
                    "deps": {
                        "build": "aaa",
                        "unknown": "zzz",
                        "sub": {
                            "__type": "taskOutput",
                            "flakeAttributePath": "tasks.x86_64-linux.deploy.prod.sub",
                            "deps": { "inner": "aaa" }
                        }
                    },
                    "run": "# __TO_BE_LAZY_EVALUATED__",
                    "hasGetOutput": true,
                    "customFunctions": { "plan": "terraform plan", "none": null }
                }
            ])),
            ".",
            "git+file:///repo",
            &["tasks.x86_64-linux.deploy.prod".to_string()],
        );

        let build = &tasks[0];
        assert_eq!(build.name, "build");
        assert_eq!(build.pretty_ref, ".#build");
        assert_eq!(build.reference, ".#tasks.x86_64-linux.build");
        assert!(!build.exact_ref_match);
        assert_eq!(build.tags, vec!["ci".to_string()]);

        let deploy = &tasks[1];
        assert_eq!(deploy.name, "prod");
        assert_eq!(deploy.flake_pretty_attribute_path, "deploy.prod");
        assert!(deploy.exact_ref_match);
        assert_eq!(deploy.all_discovered_deps, vec!["aaa".to_string()]);
        assert_eq!(deploy.run, Some(Script::Lazy));
        assert!(deploy.has_get_output);
        assert_eq!(deploy.custom_functions.len(), 1);
        assert_eq!(
            deploy.deps.get("unknown"),
            Some(&Dependency::Value(serde_json::json!("zzz")))
        );
        match deploy.deps.get("sub") {
            Some(Dependency::Nested(n)) => {
                assert_eq!(
                    n.reference.as_deref(),
                    Some(".#tasks.x86_64-linux.deploy.prod.sub")
                );
                assert_eq!(n.deps.get("inner"), Some(&Dependency::Task("aaa".into())));
            }
            other => panic!("expected nested deps, got {other:?}"),
        }
    }

    #[test]
    fn pretty_path_only_strips_system_segment() {
        assert_eq!(pretty_attribute_path("tasks.aarch64-darwin.a.b"), "a.b");
        assert_eq!(pretty_attribute_path("tasks.x86_64-linux"), "tasks.x86_64-linux");
        assert_eq!(pretty_attribute_path("packages.x.y"), "packages.x.y");
    }
}
