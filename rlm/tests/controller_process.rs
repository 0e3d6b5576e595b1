//! Host controller tests against a real `rlm-worker` child process.

use std::sync::Arc;
use std::time::Duration;

use rlm::host::{
    ControllerError, ControllerSettings, ExecuteOptions, ExecutionOutput, HostController, Variables,
};
use rlm::io::process::ProcessLauncher;
use rlm::test_support::FnBackend;
use serde_json::{Value, json};

fn controller_with(settings: ControllerSettings) -> HostController {
    let backend = Arc::new(FnBackend::new(|prompt| {
        if prompt.contains("boom") {
            anyhow::bail!("backend refused {prompt}");
        }
        Ok(format!("answer to {prompt}"))
    }));
    HostController::new(
        ProcessLauncher::new(env!("CARGO_BIN_EXE_rlm-worker")),
        backend,
        settings,
    )
}

fn controller() -> HostController {
    controller_with(ControllerSettings::default())
}

fn text(output: ExecutionOutput) -> String {
    match output {
        ExecutionOutput::Text(text) => text,
        other => panic!("expected text, got {other:?}"),
    }
}

#[test]
fn timeout_kills_worker_and_next_execute_starts_fresh() {
    let mut controller = controller_with(ControllerSettings {
        max_llm_calls: 3,
        ..ControllerSettings::default()
    });
    controller
        .execute(r#"let kept = 1; llm_query("warm up");"#, Variables::new())
        .expect("first");
    assert_eq!(controller.calls_used(), 1);

    let options = ExecuteOptions {
        timeout: Some(Duration::from_millis(500)),
        ..ExecuteOptions::default()
    };
    let err = controller
        .execute_with("loop {}", Variables::new(), &options)
        .expect_err("timeout");
    assert!(matches!(
        err.downcast_ref::<ControllerError>(),
        Some(ControllerError::Timeout { .. })
    ));
    assert!(!controller.is_running());

    let output = controller
        .execute("print(kept);", Variables::new())
        .expect("fresh worker");
    assert!(text(output).contains("kept"), "state should be gone");
    assert_eq!(controller.calls_used(), 0);
}

#[test]
fn submit_with_named_outputs() {
    let mut controller = controller();
    let options = ExecuteOptions {
        output_names: vec!["count".into(), "label".into()],
        ..ExecuteOptions::default()
    };
    let output = controller
        .execute_with(
            "SUBMIT(items.len(), title);",
            Variables::new()
                .with("items", &vec!["a", "b", "c"])
                .with("title", &"letters"),
            &options,
        )
        .expect("execute");
    assert_eq!(
        output,
        ExecutionOutput::Final(json!({"count": 3, "label": "letters"}))
    );
}

#[test]
fn registered_tool_is_callable_by_name_and_through_call_tool() {
    let mut controller = controller();
    controller.register_tool_fn("greet", |args, kwargs| {
        let who = args.first().and_then(Value::as_str).unwrap_or("nobody");
        let punct = kwargs.get("punct").and_then(Value::as_str).unwrap_or(".");
        Ok(json!(format!("hello {who}{punct}")))
    });
    let output = controller
        .execute(
            r#"let a = greet("ann"); let b = call_tool("greet", ["bob"], #{punct: "!"}); SUBMIT(a, b);"#,
            Variables::new(),
        )
        .expect("execute");
    assert_eq!(
        output,
        ExecutionOutput::Final(json!({"output": ["hello ann.", "hello bob!"]}))
    );
}

#[test]
fn sub_queries_count_against_the_budget() {
    let mut controller = controller_with(ControllerSettings {
        max_llm_calls: 2,
        ..ControllerSettings::default()
    });
    let output = controller
        .execute(r#"SUBMIT(llm_query("one"));"#, Variables::new())
        .expect("execute");
    assert_eq!(output, ExecutionOutput::Final(json!({"output": "answer to one"})));

    let output = controller
        .execute(r#"llm_query_batched(["a", "b"]);"#, Variables::new())
        .expect("execute");
    assert!(text(output).contains("budget exceeded"));
    assert_eq!(controller.calls_used(), 1);
}

#[test]
fn batched_failure_names_the_failing_index() {
    let mut controller = controller();
    let output = controller
        .execute(
            r#"llm_query_batched(["fine", "boom", "also fine"]);"#,
            Variables::new(),
        )
        .expect("execute");
    let text = text(output);
    assert!(text.contains("1 of 3 sub-queries failed"), "{text}");
    assert!(text.contains("[1]"), "{text}");
    assert!(controller.is_running());
}
