mod common;

use common::Fixture;
use conveyor::core::engine::state::ActionStatus;
use conveyor::core::engine::JobStatus;

fn statuses(summary: &conveyor::core::engine::RunSummary, job: &str) -> Vec<ActionStatus> {
    summary
        .job(job)
        .expect("job recorded")
        .actions
        .iter()
        .map(|action| action.status)
        .collect()
}

#[tokio::test]
async fn failure_accumulates_and_gates_later_actions() {
    let fixture = Fixture::new();
    fixture.action("fail.sh", "echo 1 >> \"$SHARED/log\"\nexit 1");
    fixture.action("second.sh", "echo 2 >> \"$SHARED/log\"");
    fixture.action("third.sh", "echo 3 >> \"$SHARED/log\"");
    fixture.action("fourth.sh", "echo 4 >> \"$SHARED/log\"");
    let summary = fixture
        .run(
            r#"
env: { SHARED: "{shared}" }
levels:
  - jobs:
      - name: build
        actions:
          - { name: compile, executable: fail.sh }
          - { name: package, executable: second.sh, condition: "success()" }
          - { name: report, executable: third.sh, condition: "failure()" }
          - { name: cleanup, executable: fourth.sh, condition: "always()" }
"#,
        )
        .await;

    assert_eq!(summary.job("build").unwrap().status, JobStatus::Failure);
    assert_eq!(
        statuses(&summary, "build"),
        vec![
            ActionStatus::Failure,
            ActionStatus::Skipped,
            ActionStatus::Success,
            ActionStatus::Success
        ]
    );
    assert_eq!(fixture.evidence("log").as_deref(), Some("1\n3\n4\n"));
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn failure_branch_is_skipped_when_everything_passes() {
    let fixture = Fixture::new();
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        actions:
          - { name: compile, executable: ok.sh }
          - { name: on-failure, executable: ok.sh, condition: failure }
          - { name: on-cancel, executable: ok.sh, condition: cancelled }
          - { name: finally, executable: ok.sh, condition: always }
"#,
        )
        .await;
    assert_eq!(summary.job("build").unwrap().status, JobStatus::Success);
    assert_eq!(
        statuses(&summary, "build"),
        vec![
            ActionStatus::Success,
            ActionStatus::Skipped,
            ActionStatus::Skipped,
            ActionStatus::Success
        ]
    );
}

#[tokio::test]
async fn shell_conditions_see_the_resolved_environment() {
    let fixture = Fixture::new();
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        env: { FLAG: "on" }
        actions:
          - name: when-on
            executable: ok.sh
            condition: { shell: '[ "$FLAG" = on ]' }
          - name: when-off
            executable: ok.sh
            condition: { shell: '[ "$FLAG" = off ]' }
          - name: action-override
            executable: ok.sh
            env: { FLAG: "off" }
            condition: { shell: '[ "$FLAG" = off ]' }
"#,
        )
        .await;
    assert_eq!(
        statuses(&summary, "build"),
        vec![
            ActionStatus::Success,
            ActionStatus::Skipped,
            ActionStatus::Success
        ]
    );
    assert_eq!(summary.job("build").unwrap().status, JobStatus::Success);
}

#[tokio::test]
async fn flaky_action_succeeds_within_its_retry_budget() {
    let fixture = Fixture::new();
    fixture.action(
        "flaky.sh",
        "n=$(cat count 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > count\n[ \"$n\" -ge 3 ]",
    );
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        actions:
          - name: flaky
            executable: flaky.sh
            retry: { max_attempts: 3, backoff: exponential, min_delay: 10ms, max_delay: 40ms }
"#,
        )
        .await;
    let job = summary.job("build").unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.actions[0].attempts, 3);
    assert_eq!(job.actions[0].result.as_ref().unwrap().exit_code, Some(0));
}

#[tokio::test]
async fn exhausted_retries_report_only_the_final_attempt() {
    let fixture = Fixture::new();
    fixture.action(
        "always-fails.sh",
        "n=$(cat count 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > count\nexit $((40 + n))",
    );
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        actions:
          - name: broken
            executable: always-fails.sh
            retry: { max_attempts: 2, backoff: constant, min_delay: 5ms, max_delay: 5ms }
          - { name: next, executable: always-fails.sh, condition: success }
"#,
        )
        .await;
    let job = summary.job("build").unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.actions[0].attempts, 2);
    assert_eq!(job.actions[0].result.as_ref().unwrap().exit_code, Some(42));
    assert_eq!(job.actions[1].status, ActionStatus::Skipped);
}

#[tokio::test]
async fn timed_out_attempt_is_killed_and_counted_as_failure() {
    let fixture = Fixture::new();
    fixture.action("slow.sh", "sleep 30");
    fixture.action("after.sh", "true");
    let started = std::time::Instant::now();
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        actions:
          - { name: slow, executable: slow.sh, timeout: 200ms }
          - { name: after, executable: after.sh, condition: always }
"#,
        )
        .await;
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    let job = summary.job("build").unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    let result = job.actions[0].result.as_ref().unwrap();
    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert_eq!(job.actions[1].status, ActionStatus::Success);
}

#[tokio::test]
async fn missing_executable_is_a_failed_action_not_a_crash() {
    let fixture = Fixture::new();
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: build
        actions:
          - { name: ghost, executable: does-not-exist.sh }
          - { name: report, executable: ok.sh, condition: failure }
"#,
        )
        .await;
    let job = summary.job("build").unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    let ghost = job.actions[0].result.as_ref().unwrap();
    assert!(ghost.error.as_deref().unwrap_or("").contains("ACT-SPAWN-001"));
    assert_eq!(job.actions[1].status, ActionStatus::Success);
}

#[tokio::test]
async fn skipped_job_condition_never_touches_the_sandbox() {
    let fixture = Fixture::new();
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: only-on-failure
        condition: failure
        actions: [ { name: ok, executable: ok.sh } ]
"#,
        )
        .await;
    assert_eq!(summary.job("only-on-failure").unwrap().status, JobStatus::Skipped);
    assert_eq!(summary.exit_code, 0);
    assert!(!summary.run_dir.join("sandboxes").exists());
}
