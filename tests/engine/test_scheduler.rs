mod common;

use common::Fixture;
use conveyor::core::engine::state::ActionStatus;
use conveyor::core::engine::{JobStatus, RunStatus};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// Poll for `path` so a test can act once a script reached a known point.
async fn wait_for(path: &Path) {
    for _ in 0..500 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn jobs_in_a_level_run_together_and_levels_run_in_order() {
    let fixture = Fixture::new();
    fixture.action(
        "rendezvous.sh",
        r#"touch "$SHARED/$ME.started"
i=0
while [ ! -f "$SHARED/$PEER.started" ]; do
  i=$((i + 1))
  [ "$i" -gt 200 ] && exit 1
  sleep 0.05
done
touch "$SHARED/$ME.done""#,
    );
    fixture.action(
        "verify.sh",
        r#"[ -f "$SHARED/a.done" ] && [ -f "$SHARED/b.done" ] && touch "$SHARED/verified""#,
    );
    let summary = fixture
        .run(
            r#"
env: { SHARED: "{shared}" }
levels:
  - jobs:
      - name: a
        env: { ME: a, PEER: b }
        actions: [ { name: meet, executable: rendezvous.sh } ]
      - name: b
        env: { ME: b, PEER: a }
        actions: [ { name: meet, executable: rendezvous.sh } ]
  - jobs:
      - name: c
        actions: [ { name: verify, executable: verify.sh } ]
"#,
        )
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.exit_code, 0);
    for job in ["a", "b", "c"] {
        assert_eq!(summary.job(job).unwrap().status, JobStatus::Success, "{}", job);
    }
    assert!(fixture.shared().join("verified").exists());
    assert_eq!(summary.job("c").unwrap().level, 1);
}

#[tokio::test]
async fn failing_job_halts_after_its_level_finishes() {
    let fixture = Fixture::new();
    fixture.action("fail.sh", "exit 1");
    fixture.action("slow-ok.sh", "sleep 0.3\ntouch \"$SHARED/sibling\"");
    fixture.action("never.sh", "touch \"$SHARED/never\"");
    let summary = fixture
        .run(
            r#"
env: { SHARED: "{shared}" }
levels:
  - jobs:
      - name: broken
        actions: [ { name: fail, executable: fail.sh } ]
      - name: sibling
        actions: [ { name: work, executable: slow-ok.sh } ]
  - jobs:
      - name: deploy
        condition: always
        actions: [ { name: never, executable: never.sh } ]
"#,
        )
        .await;

    assert_eq!(summary.status, RunStatus::Failure);
    assert_eq!(summary.exit_code, 1);
    assert_eq!(summary.job("broken").unwrap().status, JobStatus::Failure);
    assert_eq!(summary.job("sibling").unwrap().status, JobStatus::Success);
    assert!(fixture.shared().join("sibling").exists());
    assert_eq!(summary.job("deploy").unwrap().status, JobStatus::Skipped);
    assert!(fixture.evidence("never").is_none());
    assert!(summary.halted.is_some());
    assert_eq!(summary.failed_jobs.iter().collect::<Vec<_>>(), vec!["broken"]);
}

#[tokio::test]
async fn tolerated_failure_lets_default_jobs_in_later_levels_run() {
    let fixture = Fixture::new();
    fixture.action("fail.sh", "exit 1");
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: lint
        continue_on_error: true
        actions: [ { name: fail, executable: fail.sh } ]
      - name: unit
        actions: [ { name: ok, executable: ok.sh } ]
  - jobs:
      - name: package
        actions: [ { name: ok, executable: ok.sh } ]
"#,
        )
        .await;

    assert!(summary.halted.is_none());
    assert_eq!(summary.job("lint").unwrap().status, JobStatus::Failure);
    assert_eq!(summary.job("unit").unwrap().status, JobStatus::Success);
    assert_eq!(summary.job("package").unwrap().status, JobStatus::Success);
    assert_eq!(summary.status, RunStatus::Failure);
    assert_eq!(summary.exit_code, 1);
    assert_eq!(summary.failed_jobs, vec!["lint".to_string()]);
}

#[tokio::test]
async fn tolerated_failures_are_invisible_to_later_job_conditions() {
    let fixture = Fixture::new();
    fixture.action("fail.sh", "exit 1");
    fixture.action("ok.sh", "true");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: lint
        continue_on_error: true
        actions: [ { name: fail, executable: fail.sh } ]
  - jobs:
      - name: test
        condition: always
        actions: [ { name: ok, executable: ok.sh } ]
      - name: notify
        condition: failure
        actions: [ { name: ok, executable: ok.sh } ]
      - name: publish
        actions: [ { name: ok, executable: ok.sh } ]
"#,
        )
        .await;

    assert!(summary.halted.is_none());
    assert_eq!(summary.job("test").unwrap().status, JobStatus::Success);
    assert_eq!(summary.job("notify").unwrap().status, JobStatus::Skipped);
    assert_eq!(summary.job("publish").unwrap().status, JobStatus::Success);
    assert_eq!(summary.status, RunStatus::Failure);
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn cancellation_runs_only_cleanup_jobs_in_later_levels() {
    let fixture = Fixture::new();
    fixture.action("work.sh", "touch \"$SHARED/started\"\nsleep 1");
    fixture.action("cleanup.sh", "touch \"$SHARED/cleanup\"");
    fixture.action("after.sh", "touch \"$SHARED/after\"");
    fixture.action("teardown.sh", "touch \"$SHARED/teardown-$CONVEYOR_JOB\"");
    let plan = fixture.plan(
        r#"
env: { SHARED: "{shared}" }
levels:
  - jobs:
      - name: build
        actions:
          - { name: work, executable: work.sh }
          - { name: cleanup, executable: cleanup.sh, condition: cancelled }
          - { name: after, executable: after.sh }
  - jobs:
      - name: deploy
        condition: always
        actions: [ { name: after, executable: after.sh } ]
      - name: release-lock
        condition: cancelled
        actions: [ { name: teardown, executable: teardown.sh } ]
  - jobs:
      - name: publish
        actions: [ { name: after, executable: after.sh } ]
      - name: report
        condition: cancelled
        actions: [ { name: teardown, executable: teardown.sh } ]
"#,
    );
    let run = fixture.workflow(plan);
    let control = run.control();
    let marker = fixture.shared().join("started");
    let watcher = tokio::spawn(async move {
        wait_for(&marker).await;
        control.cancel();
    });
    let summary = run.execute().await.expect("run executes");
    watcher.await.unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.exit_code, 130);
    let build = summary.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Success);
    assert_eq!(
        build.actions.iter().map(|a| a.status).collect::<Vec<_>>(),
        vec![
            ActionStatus::Success,
            ActionStatus::Success,
            ActionStatus::Success
        ]
    );
    assert!(fixture.shared().join("cleanup").exists());
    assert_eq!(summary.job("deploy").unwrap().status, JobStatus::Skipped);
    assert_eq!(summary.job("publish").unwrap().status, JobStatus::Skipped);
    assert_eq!(summary.job("release-lock").unwrap().status, JobStatus::Success);
    assert_eq!(summary.job("report").unwrap().status, JobStatus::Success);
    assert!(fixture.shared().join("teardown-release-lock").exists());
    assert!(fixture.shared().join("teardown-report").exists());
    assert_eq!(
        summary.halted.as_deref(),
        Some("run cancelled before level 1")
    );
    assert!(summary.failed_jobs.is_empty());
}

#[tokio::test]
async fn interrupt_kills_in_flight_actions_promptly() {
    let fixture = Fixture::new();
    fixture.action("hang.sh", "touch \"$SHARED/started\"\nexec sleep 30");
    fixture.action("cleanup.sh", "touch \"$SHARED/cleanup\"");
    let plan = fixture.plan(
        r#"
env: { SHARED: "{shared}" }
levels:
  - jobs:
      - name: build
        actions:
          - { name: hang, executable: hang.sh }
          - { name: cleanup, executable: cleanup.sh, condition: always }
"#,
    );
    let run = fixture.workflow(plan);
    let control = run.control();
    let marker = fixture.shared().join("started");
    let watcher = tokio::spawn(async move {
        wait_for(&marker).await;
        control.interrupt();
    });
    let started = Instant::now();
    let summary = run.execute().await.expect("run executes");
    watcher.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.status, RunStatus::Cancelled);
    let build = summary.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failure);
    assert!(build.actions[0].result.as_ref().unwrap().interrupted);
    assert_eq!(build.actions[1].status, ActionStatus::Skipped);
    assert!(fixture.evidence("cleanup").is_none());
}

#[tokio::test]
async fn run_report_is_written_next_to_the_artifacts() {
    let fixture = Fixture::new();
    fixture.action("fail.sh", "exit 7");
    let summary = fixture
        .run(
            r#"
name: nightly
levels:
  - jobs:
      - name: build
        actions: [ { name: fail, executable: fail.sh } ]
"#,
        )
        .await;

    let report = summary.report_path();
    assert_eq!(report, summary.run_dir.join("run.json"));
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(value["workflow"], "nightly");
    assert_eq!(value["status"], "failure");
    assert_eq!(value["exit_code"], 1);
    assert_eq!(value["failed_jobs"][0], "build");
    assert_eq!(value["jobs"][0]["status"], "failure");
    assert_eq!(value["jobs"][0]["actions"][0]["result"]["exit_code"], 7);
    assert!(!summary.run_dir.join("run.tmp").exists());

    let table = summary.render_table();
    assert!(table.contains("build"));
    assert!(table.contains("failure"));
}

#[tokio::test]
async fn sandboxes_are_shared_per_spec_and_torn_down() {
    let fixture = Fixture::new();
    fixture.action("mark.sh", "touch \"$CONVEYOR_JOB.mark\"");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: one
        actions: [ { name: mark, executable: mark.sh } ]
      - name: two
        actions: [ { name: mark, executable: mark.sh } ]
"#,
        )
        .await;
    assert_eq!(summary.status, RunStatus::Success);
    let sandboxes = summary.run_dir.join("sandboxes");
    assert_eq!(fs::read_dir(&sandboxes).unwrap().count(), 0);
}

#[tokio::test]
async fn keep_sandboxes_leaves_job_workspaces_for_inspection() {
    let mut fixture = Fixture::new();
    fixture.config.keep_sandboxes = true;
    fixture.action("mark.sh", "touch \"$CONVEYOR_JOB.mark\"");
    let summary = fixture
        .run(
            r#"
levels:
  - jobs:
      - name: one
        actions: [ { name: mark, executable: mark.sh } ]
      - name: two
        actions: [ { name: mark, executable: mark.sh } ]
"#,
        )
        .await;
    let sandboxes: Vec<_> = fs::read_dir(summary.run_dir.join("sandboxes"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(sandboxes.len(), 1);
    let jobs = sandboxes[0].join("jobs");
    assert!(jobs.join("one").join("one.mark").exists());
    assert!(jobs.join("two").join("two.mark").exists());
}
