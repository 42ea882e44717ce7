//! Loop-level lifecycle tests.
//!
//! These drive `run_loop` with a scripted agent against a temporary project
//! and registry, then inspect the registry record, the backlog, and the
//! product logs under `.ralph/`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ralph::core::session::{LifecycleStatus, SessionRecord, now};
use ralph::core::types::LoopStop;
use ralph::errors::SetupError;
use ralph::io::config::RunSettings;
use ralph::io::supervisor::{StopOutcome, stop};
use ralph::looping::{LoopDeps, LoopOutcome, preview, run_loop};
use ralph::test_support::{RecordingPublisher, ScriptedAgent, ScriptedStep, TestProject};

fn settings(max_iterations: u32) -> RunSettings {
    RunSettings {
        max_iterations,
        pause: Duration::ZERO,
        echo: false,
        ..RunSettings::default()
    }
}

async fn drive(
    project: &TestProject,
    agent: &ScriptedAgent,
    publisher: &RecordingPublisher,
    settings: &RunSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<LoopOutcome> {
    run_loop(
        project.root(),
        LoopDeps {
            registry: project.registry(),
            agent,
            publisher,
        },
        settings,
        cancel,
        |_| {},
    )
    .await
}

/// One incomplete item, cap 1, agent makes no progress.
#[tokio::test]
async fn single_iteration_without_progress_hits_the_cap() {
    let project = TestProject::with_items(&[("Login", false)]);
    let agent = ScriptedAgent::new(vec![ScriptedStep::noop()]);
    let publisher = RecordingPublisher::default();

    let outcome = drive(
        &project,
        &agent,
        &publisher,
        &settings(1),
        &CancellationToken::new(),
    )
    .await
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::IterationLimitReached);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.progress, "0/1");
    assert_eq!(agent.calls(), 1);
    assert_eq!(publisher.calls(), 0);

    let record = project.record().expect("record");
    assert_eq!(record.status, LifecycleStatus::Stopped);
    assert_eq!(record.pid, 0);
    assert!(record.started.is_some());
    assert!(record.stopped.is_some());

    let session_log = project.read(".ralph/session.log");
    assert!(session_log.contains("=== Session started"));
    assert!(session_log.contains("Iteration 1 started"));
    assert!(session_log.contains("Iteration 1 completed, progress: 0/1"));
    assert!(session_log.contains("=== Session ended"));

    let transcript = project.read(".ralph/conversations/iteration-1.md");
    assert!(transcript.contains("# Iteration 1"));
    assert!(transcript.contains("**Progress before:** 0/1"));
    assert!(transcript.contains("nothing to do"));
    assert!(transcript.contains("**Progress after:** 0/1"));
}

/// Every item already passes: no agent calls, publish once.
#[tokio::test]
async fn already_complete_backlog_publishes_without_invoking() {
    let project = TestProject::with_items(&[("Login", true)]);
    let agent = ScriptedAgent::new(Vec::new());
    let publisher = RecordingPublisher::default();

    let outcome = drive(
        &project,
        &agent,
        &publisher,
        &settings(5),
        &CancellationToken::new(),
    )
    .await
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(agent.calls(), 0);
    assert_eq!(publisher.calls(), 1);
    assert_eq!(publisher.published()[0].progress_label(), "1/1");
    assert!(outcome.publish.is_some());
    assert_eq!(
        project.record().expect("record").status,
        LifecycleStatus::Stopped
    );
}

/// Preview applies the entry guards but never touches the registry.
#[tokio::test]
async fn preview_reports_target_and_leaves_registry_alone() {
    let project = TestProject::with_items(&[("Schema", true), ("Login", false)]);
    let agent = ScriptedAgent::new(Vec::new());

    let preview = preview(project.root(), project.registry(), &agent, &settings(3))
        .await
        .expect("preview");

    assert_eq!(preview.name, project.name());
    assert_eq!(preview.progress, "1/2");
    assert!(!preview.complete);
    assert_eq!(preview.target.expect("target").id, "2");
    assert_eq!(agent.calls(), 0);
    assert!(project.record().is_none());
    assert!(!project.registry().path().exists());
}

/// Cancelling while the agent runs lets the call drain, then stops.
#[tokio::test]
async fn cancellation_mid_iteration_stops_after_the_call_drains() {
    let project = TestProject::with_items(&[("Login", false), ("Logout", false)]);
    let agent = ScriptedAgent::new(vec![ScriptedStep::WaitForCancel]);
    let publisher = RecordingPublisher::default();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let loop_settings = settings(5);

    let (outcome, ()) = tokio::join!(
        drive(&project, &agent, &publisher, &loop_settings, &cancel),
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        }
    );
    let outcome = outcome.expect("loop");

    assert_eq!(outcome.stop, LoopStop::Interrupted);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.failures, 0);
    assert_eq!(agent.calls(), 1);
    assert_eq!(publisher.calls(), 0);

    let transcript = project.read(".ralph/conversations/iteration-1.md");
    assert!(transcript.contains("working"));
    assert!(transcript.contains("stopping"));
    assert!(transcript.contains("**Ended:**"));
    assert!(project.read(".ralph/session.log").contains("Interrupted"));

    let record = project.record().expect("record");
    assert_eq!(record.status, LifecycleStatus::Stopped);
    assert_eq!(record.pid, 0);
}

#[tokio::test]
async fn starting_while_marked_running_fails_and_keeps_the_record() {
    let project = TestProject::with_items(&[("Login", false)]);
    let mut running = SessionRecord::for_root(project.root());
    assert!(running.mark_running(std::process::id(), now()));
    project.set_record(&running);
    let agent = ScriptedAgent::new(vec![ScriptedStep::noop()]);
    let publisher = RecordingPublisher::default();

    let err = drive(
        &project,
        &agent,
        &publisher,
        &settings(1),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SetupError>(),
        Some(SetupError::AlreadyRunning { .. })
    ));
    assert_eq!(project.record().expect("record"), running);
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn missing_backlog_is_a_setup_error() {
    let project = TestProject::empty();
    let agent = ScriptedAgent::new(Vec::new());
    let publisher = RecordingPublisher::default();

    let err = drive(
        &project,
        &agent,
        &publisher,
        &settings(1),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SetupError>(),
        Some(SetupError::NoBacklog { .. })
    ));
    assert!(project.record().is_none());
}

#[tokio::test]
async fn a_second_run_after_stopping_is_allowed() {
    let project = TestProject::with_items(&[("Login", false), ("Logout", false)]);
    let publisher = RecordingPublisher::default();

    let first = ScriptedAgent::new(vec![ScriptedStep::pass("1")]);
    let outcome = drive(
        &project,
        &first,
        &publisher,
        &settings(1),
        &CancellationToken::new(),
    )
    .await
    .expect("first run");
    assert_eq!(outcome.stop, LoopStop::IterationLimitReached);
    assert_eq!(outcome.progress, "1/2");

    let second = ScriptedAgent::new(vec![ScriptedStep::pass("2")]);
    let outcome = drive(
        &project,
        &second,
        &publisher,
        &settings(3),
        &CancellationToken::new(),
    )
    .await
    .expect("second run");
    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(second.calls(), 1);
    assert_eq!(publisher.calls(), 1);

    let session_log = project.read(".ralph/session.log");
    assert_eq!(session_log.matches("=== Session started").count(), 2);
}

#[test]
fn stopping_an_idle_session_is_a_no_op() {
    let project = TestProject::with_items(&[("Login", false)]);
    let idle = SessionRecord::for_root(project.root());
    project.set_record(&idle);

    let mut record = project.record().expect("record");
    let outcome = stop(project.registry(), &mut record).expect("stop");

    assert_eq!(outcome, StopOutcome::NotRunning);
    assert_eq!(project.record().expect("record"), idle);
    assert_eq!(idle.status, LifecycleStatus::Created);
}
