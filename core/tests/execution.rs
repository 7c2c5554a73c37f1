mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{exists, start_recording_evaluator, task, Captured, FakeDefinitions, Workspace};
use nixtask_core::error::{DependencyGraphError, ExecutorError, RunnerError, SelectionError};
use nixtask_core::executor::{RunOptions, RunOutcome};
use nixtask_core::runner::Console;
use nixtask_core::task::Script;

fn concurrent(n: usize) -> RunOptions {
    RunOptions {
        concurrency: Some(n),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn dependent_waits_for_dependency_under_concurrency() {
    let ws = Workspace::new();
    let a_done = ws.mark("a-done");
    let b_saw = ws.mark("b-saw-a");
    let tasks = vec![
        task("a", &[], &format!("sleep 0.3\necho done > {a_done}")),
        task("b", &["a"], &format!("test -f {a_done}\necho yes > {b_saw}")),
    ];

    let report = ws
        .engine(Arc::default())
        .run(tasks, &concurrent(2))
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { nodes: 2, .. }));
    assert!(exists(&b_saw));
}

#[tokio::test]
async fn independent_tasks_overlap_with_two_workers() {
    let ws = Workspace::new();
    let script = |me: &str, other: &str| {
        format!(
            "touch {mine}\nfor i in $(seq 1 50); do [ -f {theirs} ] && exit 0; sleep 0.1; done\nexit 1",
            mine = ws.mark(&format!("{me}-started")),
            theirs = ws.mark(&format!("{other}-started")),
        )
    };
    let tasks = vec![task("a", &[], &script("a", "b")), task("b", &[], &script("b", "a"))];

    let report = ws
        .engine(Arc::default())
        .run(tasks, &concurrent(2))
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn only_runs_the_exact_match_and_skips_dependencies() {
    let ws = Workspace::new();
    let mut b = task("b", &["a"], &format!("touch {}", ws.mark("b")));
    b.exact_ref_match = true;
    let tasks = vec![task("a", &[], &format!("touch {}", ws.mark("a"))), b];

    let opts = RunOptions {
        only: true,
        ..RunOptions::default()
    };
    ws.engine(Arc::default()).run(tasks, &opts).await.unwrap();

    assert!(exists(ws.mark("b")));
    assert!(!exists(ws.mark("a")));
}

#[tokio::test]
async fn only_without_a_single_exact_match_is_rejected() {
    let ws = Workspace::new();
    let opts = RunOptions {
        only: true,
        ..RunOptions::default()
    };
    let err = ws
        .engine(Arc::default())
        .run(vec![task("a", &[], "true")], &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Selection(SelectionError::NoExactMatch)));

    let mut a = task("a", &[], "true");
    let mut b = task("b", &[], "true");
    a.exact_ref_match = true;
    b.exact_ref_match = true;
    let err = ws
        .engine(Arc::default())
        .run(vec![a, b], &opts)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Selection(SelectionError::AmbiguousExactMatch(2))
    ));
}

#[tokio::test]
async fn interactive_with_concurrency_is_rejected() {
    let ws = Workspace::new();
    let opts = RunOptions {
        interactive: true,
        concurrency: Some(3),
        ..RunOptions::default()
    };
    let err = ws
        .engine(Arc::default())
        .run(vec![task("a", &[], "true")], &opts)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Selection(SelectionError::IncompatibleFlags(_))
    ));
}

#[tokio::test]
async fn reverse_chain_graph_fetches_outputs_then_runs_backwards() {
    let ws = Workspace::new();
    let tasks = vec![
        task("a", &[], "true"),
        task("b", &["a"], "true"),
        task("c", &["b"], "true"),
    ];
    let opts = RunOptions {
        reverse: true,
        graph: true,
        ..RunOptions::default()
    };

    let report = ws.engine(Arc::default()).run(tasks, &opts).await.unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Graph(json!([
            ["(Output Only) .#a"],
            ["(Output Only) .#b"],
            [".#c"],
            [".#b"],
            [".#a"]
        ]))
    );
}

#[tokio::test]
async fn reverse_run_executes_dependents_first() {
    let ws = Workspace::new();
    let log = ws.mark("log");
    let step = |id: &str| format!("echo {id} >> {log}");
    let tasks = vec![
        task("a", &[], &step("a")),
        task("b", &["a"], &step("b")),
        task("c", &["b"], &step("c")),
    ];
    let opts = RunOptions {
        reverse: true,
        ..RunOptions::default()
    };

    ws.engine(Arc::default()).run(tasks, &opts).await.unwrap();

    assert_eq!(std::fs::read_to_string(&log).unwrap(), "c\nb\na\n");
}

#[tokio::test]
async fn cycles_are_rejected_before_anything_runs() {
    let ws = Workspace::new();
    let defs = Arc::new(FakeDefinitions::default());
    let tasks = vec![
        task("a", &["b"], &format!("touch {}", ws.mark("a"))),
        task("b", &["a"], "true"),
    ];

    let err = ws.engine(defs.clone()).run(tasks, &RunOptions::default()).await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::DependencyGraph(DependencyGraphError::CircularDependency(_))
    ));
    assert!(!exists(ws.mark("a")));
    assert!(defs.realised.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failure_aborts_the_run() {
    let ws = Workspace::new();
    let tasks = vec![
        task("a", &[], "exit 3"),
        task("b", &["a"], &format!("touch {}", ws.mark("b"))),
    ];

    let (out, errors) = (Captured::default(), Captured::default());
    let err = ws
        .engine(Arc::default())
        .with_console(Console::with_writers(out.clone(), errors.clone()))
        .run(tasks, &RunOptions::default())
        .await
        .unwrap_err();

    assert!(errors.text().contains("Task '.#a' failed"));
    assert!(out.text().contains("Failed"));
    match err {
        ExecutorError::TaskFailed { task, source } => {
            assert_eq!(task, ".#a");
            assert!(matches!(
                *source,
                ExecutorError::Runner(RunnerError::ExitStatus { code: Some(3) })
            ));
        }
        other => panic!("expected task failure, got {other:?}"),
    }
    assert!(!exists(ws.mark("b")));
}

#[tokio::test]
async fn empty_selection_reports_no_tasks() {
    let ws = Workspace::new();
    let opts = RunOptions {
        only_tags: vec!["nothing-has-this".into()],
        ..RunOptions::default()
    };
    let report = ws
        .engine(Arc::default())
        .run(vec![task("a", &[], "true")], &opts)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::NoTasks);
    assert_eq!(report.exit_code(), 127);
}

#[tokio::test]
async fn last_set_output_is_persisted() {
    let ws = Workspace::new();
    let t = task(
        "a",
        &[],
        r#"echo '{"cmd":"setOutput","output":{"v":1}}' >&4
echo '{"cmd":"setOutput","output":{"v":2}}' >&4"#,
    );

    ws.engine(Arc::default())
        .run(vec![t.clone()], &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ws.output_of(&t), Some(json!({ "v": 2 })));
}

#[tokio::test]
async fn null_output_is_not_persisted() {
    let ws = Workspace::new();
    let cleared = task(
        "cleared",
        &[],
        r#"taskSetOutput '{"v":1}'
taskSetOutput null"#,
    );
    let bare = task("bare", &[], r#"echo '{"cmd":"setOutput"}' >&4"#);
    let explicit = task(
        "explicit",
        &[],
        r#"echo '{"cmd":"setOutput","output":null}' >&4"#,
    );

    ws.engine(Arc::default())
        .run(
            vec![cleared.clone(), bare.clone(), explicit.clone()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    for t in [&cleared, &bare, &explicit] {
        assert!(!exists(ws.environment().output_file(t)), "{}", t.id);
    }
}

#[tokio::test]
async fn malformed_control_line_is_dropped() {
    let ws = Workspace::new();
    let t = task(
        "a",
        &[],
        r#"echo 'this is not json' >&4
echo '{"cmd":"launchMissiles"}' >&4
echo '{"cmd":"setOutput","output":"kept"}' >&4"#,
    );

    let report = ws
        .engine(Arc::default())
        .run(vec![t.clone()], &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(ws.output_of(&t), Some(json!("kept")));
}

#[tokio::test]
async fn computed_output_supersedes_captured() {
    let ws = Workspace::new();
    let mut t = task(
        "a",
        &[],
        r#"echo '{"cmd":"setOutput","output":"raw"}' >&4"#,
    );
    t.has_get_output = true;
    let defs = FakeDefinitions {
        computed_outputs: [("a".to_string(), json!({ "computed": true }))].into(),
        ..FakeDefinitions::default()
    };

    ws.engine(Arc::new(defs))
        .run(vec![t.clone()], &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ws.output_of(&t), Some(json!({ "computed": true })));
}

#[tokio::test]
async fn custom_function_output_is_not_persisted() {
    let ws = Workspace::new();
    let mut t = task("a", &[], "exit 9");
    t.custom_functions.insert(
        "plan".into(),
        Script::Body(r#"echo '{"cmd":"setOutput","output":1}' >&4"#.into()),
    );
    let opts = RunOptions {
        custom_function: Some("plan".into()),
        ..RunOptions::default()
    };

    ws.engine(Arc::default()).run(vec![t.clone()], &opts).await.unwrap();

    assert_eq!(ws.output_of(&t), None);
}

#[tokio::test]
async fn missing_script_is_a_no_op() {
    let ws = Workspace::new();
    let mut t = task("a", &[], "");
    t.run = None;
    let report = ws
        .engine(Arc::default())
        .run(vec![t], &RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(report.outcome, RunOutcome::Completed { nodes: 1, .. }));
}

#[tokio::test]
async fn finally_commands_run_in_order_after_exit() {
    let ws = Workspace::new();
    let log = ws.mark("finally");
    let t = task(
        "a",
        &[],
        &format!(
            r#"echo '{{"cmd":"runFinally","command":"echo one >> {log}"}}' >&4
echo '{{"cmd":"runFinally","command":"echo two >> {log}"}}' >&4
echo main >> {log}
exit 1"#
        ),
    );

    let err = ws
        .engine(Arc::default())
        .run(vec![t], &RunOptions::default())
        .await;

    assert!(err.is_err());
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "main\none\ntwo\n");
}

#[tokio::test]
async fn background_command_is_terminated_after_task_exits() {
    let ws = Workspace::new();
    let pid_file = ws.mark("bg.pid");
    let t = task(
        "a",
        &[],
        &format!(
            r#"echo '{{"cmd":"runInBackground","command":"echo $$ > {pid_file}; exec sleep 30"}}' >&4
for i in $(seq 1 50); do [ -s {pid_file} ] && break; sleep 0.1; done"#
        ),
    );

    let started = std::time::Instant::now();
    ws.engine(Arc::default())
        .run(vec![t], &RunOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let proc_dir = format!("/proc/{}", pid.trim());
    for _ in 0..20 {
        if !exists(&proc_dir) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("background process {} still alive", pid.trim());
}

#[tokio::test]
async fn lazy_task_is_resolved_with_its_context() {
    let ws = Workspace::new();
    let mut t = task("lazy", &[], "");
    t.run = Some(Script::Lazy);
    let defs = Arc::new(FakeDefinitions {
        lazy_bodies: [("lazy".to_string(), format!("touch {}", ws.mark("lazy")))].into(),
        ..FakeDefinitions::default()
    });

    ws.engine(defs.clone())
        .run(vec![t], &RunOptions::default())
        .await
        .unwrap();

    assert!(exists(ws.mark("lazy")));
    let contexts = defs.lazy_contexts.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].1, json!({ "deps": {} }));
    // realised once up front and once for the resolved record
    assert_eq!(*defs.realised.lock().unwrap(), vec!["lazy", "lazy"]);
}

#[tokio::test]
async fn tag_filtered_dependency_output_is_fetched_not_run() {
    let ws = Workspace::new();
    let mut a = task("a", &[], &format!("touch {}", ws.mark("a-ran")));
    a.fetch_output = Some(Script::Body(format!(
        r#"touch {}
echo '{{"cmd":"setOutput","output":"fetched"}}' >&4"#,
        ws.mark("a-fetched")
    )));
    let mut b = task("b", &["a"], &format!("touch {}", ws.mark("b-ran")));
    b.tags = vec!["deploy".into()];

    let opts = RunOptions {
        only_tags: vec!["deploy".into()],
        ..RunOptions::default()
    };
    ws.engine(Arc::default())
        .run(vec![a.clone(), b], &opts)
        .await
        .unwrap();

    assert!(exists(ws.mark("a-fetched")));
    assert!(!exists(ws.mark("a-ran")));
    assert!(exists(ws.mark("b-ran")));
    assert_eq!(ws.output_of(&a), Some(json!("fetched")));
}

#[tokio::test]
async fn task_evaluates_through_its_control_socket() {
    if !exists("/usr/bin/curl") && !exists("/bin/curl") {
        return;
    }
    let ws = Workspace::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let evaluator = start_recording_evaluator(received.clone()).await;

    let t = task(
        "a",
        &[],
        r#"export STAGE=dev
evaluated="$(taskEval 'x: x.name')"
raw="$(nixReplEval '1 + 1')"
taskReloadFlake
taskSetOutput "$(jq -n --arg e "$evaluated" --arg r "$raw" '{evaluated: $e, raw: $r}')""#,
    );

    ws.engine(Arc::default())
        .with_evaluator(evaluator.handle())
        .run(vec![t.clone()], &RunOptions::default())
        .await
        .unwrap();

    let output = ws.output_of(&t).unwrap();
    assert_eq!(output["raw"], json!("reply:1 + 1"));
    let evaluated = output["evaluated"].as_str().unwrap();
    assert!(evaluated.starts_with("reply:let __environment = builtins.fromJSON"));
    assert!(evaluated.contains(r#"\"STAGE\":\"dev\""#));
    assert!(evaluated.ends_with("in ((x: x.name) tasks.x86_64-linux.a)"));

    let received = received.lock().unwrap();
    assert!(received.iter().any(|c| c == ":lf .#"));
    assert!(received.iter().any(|c| c == "1 + 1"));

    drop(received);
    evaluator.shutdown().await;
}
