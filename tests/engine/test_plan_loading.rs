use conveyor::core::engine::plan::{
    BackoffKind, Condition, ContainerMode, ExecutorSpec,
};
use conveyor::core::engine::{load_plan, load_plan_str};
use conveyor::core::types::ErrorCategory;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_PLAN: &str = r#"
name: release
env:
  CHANNEL: stable
providers:
  - scripts/versions.sh
levels:
  - jobs:
      - name: build
        executor:
          container:
            image: "rust:1.80"
            mode: build
        env: { PROFILE: release }
        outputs:
          - { name: binaries, path: "target/release/" }
        actions:
          - name: compile
            executable: compile.sh
            timeout: 10m
            retry:
              max_attempts: 3
              backoff: exponential
              min_delay: 1s
              max_delay: 30s
          - name: on-cancel
            executable: cleanup.sh
            condition: cancelled()
  - jobs:
      - name: publish
        condition: { shell: '[ "$CHANNEL" = stable ]' }
        continue_on_error: true
        inputs:
          - { name: binaries, path: bin }
        actions:
          - { name: upload, executable: /usr/local/bin/upload }
"#;

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn error_code(yaml: &str) -> String {
    load_plan_str(yaml).expect_err("plan should be rejected").code
}

#[test]
fn loads_a_complete_yaml_plan() {
    let dir = TempDir::new().unwrap();
    let plan = load_plan(&write(&dir, "plan.yaml", FULL_PLAN)).unwrap();

    assert_eq!(plan.name, "release");
    assert_eq!(plan.env.get("CHANNEL").map(String::as_str), Some("stable"));
    assert_eq!(plan.providers.len(), 1);
    assert_eq!(plan.levels.len(), 2);

    let build = &plan.levels[0].jobs[0];
    assert_eq!(
        build.executor,
        ExecutorSpec::Container {
            image: "rust:1.80".into(),
            mode: ContainerMode::Build
        }
    );
    assert_eq!(build.condition, Condition::Success);
    assert!(!build.continue_on_error);
    assert_eq!(build.outputs[0].path, "target/release/");
    let compile = &build.actions[0];
    assert_eq!(compile.timeout, Some(Duration::from_secs(600)));
    let retry = compile.retry.as_ref().unwrap();
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.backoff, BackoffKind::Exponential);
    assert_eq!(retry.max_delay, Duration::from_secs(30));
    assert_eq!(build.actions[1].condition, Condition::Cancelled);

    let publish = &plan.levels[1].jobs[0];
    assert_eq!(publish.executor, ExecutorSpec::Local);
    assert!(publish.continue_on_error);
    assert_eq!(
        publish.condition,
        Condition::ShellExpr("[ \"$CHANNEL\" = stable ]".into())
    );
    assert_eq!(plan.jobs().count(), 2);
}

#[test]
fn json_plans_are_selected_by_extension() {
    let dir = TempDir::new().unwrap();
    let json = r#"{
      "name": "ci",
      "levels": [
        { "jobs": [
          { "name": "test",
            "executor": { "container": { "image": "alpine" } },
            "actions": [ { "name": "run", "executable": "test.sh", "condition": "always" } ] }
        ] }
      ]
    }"#;
    let plan = load_plan(&write(&dir, "plan.JSON", json)).unwrap();
    let job = &plan.levels[0].jobs[0];
    assert_eq!(
        job.executor,
        ExecutorSpec::Container {
            image: "alpine".into(),
            mode: ContainerMode::Mount
        }
    );
    assert_eq!(job.actions[0].condition, Condition::Always);
    assert!(job.actions[0].retry.is_none());
    assert!(job.actions[0].timeout.is_none());
}

#[test]
fn missing_plan_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let err = load_plan(&dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.category, ErrorCategory::IoError);
    assert_eq!(err.code, "CFG-PLAN-001");
}

#[test]
fn malformed_yaml_is_a_configuration_error() {
    let err = load_plan_str("levels: [ { jobs: ").unwrap_err();
    assert_eq!(err.category, ErrorCategory::ConfigurationError);
    assert_eq!(err.code, "CFG-PLAN-001");
}

#[test]
fn duplicate_job_names_are_rejected_across_levels() {
    let code = error_code(
        r#"
levels:
  - jobs: [ { name: build, actions: [ { name: a, executable: a.sh } ] } ]
  - jobs: [ { name: build, actions: [ { name: a, executable: a.sh } ] } ]
"#,
    );
    assert_eq!(code, "CFG-PLAN-002");
}

#[test]
fn jobs_need_at_least_one_action() {
    let code = error_code("levels:\n  - jobs: [ { name: empty, actions: [] } ]\n");
    assert_eq!(code, "CFG-PLAN-003");
}

#[test]
fn retry_policies_are_bounded() {
    let zero = error_code(
        r#"
levels:
  - jobs:
      - name: build
        actions:
          - name: a
            executable: a.sh
            retry: { max_attempts: 0, min_delay: 1s, max_delay: 1s }
"#,
    );
    assert_eq!(zero, "CFG-PLAN-004");

    let inverted = error_code(
        r#"
levels:
  - jobs:
      - name: build
        actions:
          - name: a
            executable: a.sh
            retry: { max_attempts: 2, min_delay: 5s, max_delay: 1s }
"#,
    );
    assert_eq!(inverted, "CFG-PLAN-004");
}

#[test]
fn inputs_must_come_from_an_earlier_level() {
    let same_level = error_code(
        r#"
levels:
  - jobs:
      - name: build
        outputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
      - name: test
        inputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
"#,
    );
    assert_eq!(same_level, "CFG-PLAN-005");
}

#[test]
fn one_artifact_name_per_level() {
    let code = error_code(
        r#"
levels:
  - jobs:
      - name: linux
        outputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
      - name: macos
        outputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
"#,
    );
    assert_eq!(code, "CFG-PLAN-006");
}

#[test]
fn later_levels_may_overwrite_an_artifact() {
    load_plan_str(
        r#"
levels:
  - jobs:
      - name: build
        outputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
  - jobs:
      - name: strip
        inputs: [ { name: dist, path: dist } ]
        outputs: [ { name: dist, path: dist } ]
        actions: [ { name: a, executable: a.sh } ]
"#,
    )
    .unwrap();
}

#[test]
fn unknown_condition_literal_is_a_condition_error() {
    let err = load_plan_str(
        r#"
levels:
  - jobs:
      - name: build
        actions: [ { name: a, executable: a.sh, condition: "sometimes()" } ]
"#,
    )
    .unwrap_err();
    assert_eq!(err.code, "CFG-COND-001");
    assert!(err.message.contains("sometimes()"));
}

#[test]
fn empty_shell_condition_is_rejected() {
    let code = error_code(
        r#"
levels:
  - jobs:
      - name: build
        condition: { shell: "  " }
        actions: [ { name: a, executable: a.sh } ]
"#,
    );
    assert_eq!(code, "CFG-COND-001");
}

#[test]
fn unknown_executor_is_rejected() {
    let err = load_plan_str(
        r#"
levels:
  - jobs:
      - name: build
        executor: remote
        actions: [ { name: a, executable: a.sh } ]
"#,
    )
    .unwrap_err();
    assert_eq!(err.category, ErrorCategory::ConfigurationError);
    assert!(err.message.contains("unknown executor 'remote'"));
}
