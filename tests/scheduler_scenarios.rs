//! Scheduler scenarios: bounded parallelism, failure thresholds, and
//! unresponsive sandboxes, driven through scripted sandbox agents.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;

use armada::{
    ExecutionSpec, FailureAction, FailurePolicy, Group, GroupStatus, InProcessSubstrate,
    PauseDecision, RepoSpec, Task, TaskController, TaskMode, TaskResult, TaskStatus,
};

use common::{fast_config, AgentScript, ScriptedProvider};

fn task_with_groups(n: usize) -> Task {
    let mut task = Task::new(
        TaskMode::Transform,
        ExecutionSpec::Deterministic {
            command: "true".to_string(),
        },
    );
    for i in 1..=n {
        task = task.with_group(
            Group::new(format!("g{}", i)).with_repo(RepoSpec::new("svc", "file:///unused")),
        );
    }
    task
}

fn status_of<'a>(result: &'a TaskResult, group: &str) -> GroupStatus {
    result
        .outcomes
        .iter()
        .find(|o| o.group == group)
        .unwrap_or_else(|| panic!("no outcome for {}", group))
        .status
}

async fn wait_until<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        if check().await {
            return;
        }
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn scenario_a_ten_groups_bounded_by_three() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(30),
        },
    );
    let max_running = provider.max_running.clone();
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(10).with_max_parallel(3);
    let task_id = task.id.clone();

    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let result = controller.run(task).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.counts(), (10, 0, 0));

    // Never more than max_parallel groups in flight.
    let peak = max_running.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded max_parallel", peak);
    assert!(peak >= 1);

    let progress = substrate.progress(&task_id).await.unwrap();
    assert_eq!(progress.completed, 10);
    assert_eq!(progress.failed, 0);
    assert!(!progress.paused);

    // Every poll reported liveness to the substrate.
    assert!(substrate.heartbeat_count("g1").await > 0);
}

#[tokio::test]
async fn scenario_b_pause_then_continue() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(20),
        },
    )
    .with_script("g1", AgentScript::Fail { delay: Duration::from_millis(10) })
    .with_script("g2", AgentScript::Succeed { delay: Duration::from_millis(150) })
    .with_script("g3", AgentScript::Succeed { delay: Duration::from_millis(150) });
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(10)
        .with_max_parallel(3)
        .with_failure_policy(FailurePolicy {
            threshold_percent: 20,
            action: FailureAction::Pause,
        });
    let task_id = task.id.clone();

    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let handle = tokio::spawn(async move { controller.run(task).await });

    // g1 fails first: 1/1 = 100% > 20%, so launching pauses while the
    // in-flight g2 and g3 run to completion.
    let query = substrate.clone();
    let id = task_id.clone();
    wait_until(
        move || {
            let query = query.clone();
            let id = id.clone();
            async move {
                match query.progress(&id).await {
                    Some(p) => p.paused && p.completed == 3,
                    None => false,
                }
            }
        },
        "pause with in-flight groups drained",
    )
    .await;

    let progress = substrate.progress(&task_id).await.unwrap();
    assert_eq!(progress.failed_groups, vec!["g1".to_string()]);
    assert_eq!(progress.skipped, 0);
    // The remaining seven groups never started.
    assert_eq!(progress.total_groups, 10);
    assert_eq!(progress.completed, 3);
    assert!(progress.pause_reason.as_deref().unwrap().contains("g1"));

    substrate.signal_pause_decision(PauseDecision::Continue);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.counts(), (9, 1, 0));
}

#[tokio::test]
async fn pause_then_skip_remaining() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(20),
        },
    )
    .with_script("g1", AgentScript::Fail { delay: Duration::from_millis(10) })
    .with_script("g2", AgentScript::Succeed { delay: Duration::from_millis(100) })
    .with_script("g3", AgentScript::Succeed { delay: Duration::from_millis(100) });
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(10)
        .with_max_parallel(3)
        .with_failure_policy(FailurePolicy {
            threshold_percent: 20,
            action: FailureAction::Pause,
        });
    let task_id = task.id.clone();

    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let handle = tokio::spawn(async move { controller.run(task).await });

    let query = substrate.clone();
    let id = task_id.clone();
    wait_until(
        move || {
            let query = query.clone();
            let id = id.clone();
            async move { matches!(query.progress(&id).await, Some(p) if p.paused) }
        },
        "pause",
    )
    .await;

    substrate.signal_pause_decision(PauseDecision::SkipRemaining);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    let (succeeded, failed, skipped) = result.counts();
    assert_eq!(failed, 1);
    assert_eq!(succeeded + skipped, 9);
    assert!(skipped >= 7, "not-yet-started groups were launched anyway");
}

#[tokio::test]
async fn pause_then_cancel_marks_the_task_cancelled() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(20),
        },
    )
    .with_script("g1", AgentScript::Fail { delay: Duration::from_millis(10) });
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(5)
        .with_max_parallel(2)
        .with_failure_policy(FailurePolicy {
            threshold_percent: 0,
            action: FailureAction::Pause,
        });
    let task_id = task.id.clone();

    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let handle = tokio::spawn(async move { controller.run(task).await });

    let query = substrate.clone();
    wait_until(
        move || {
            let query = query.clone();
            let id = task_id.clone();
            async move { matches!(query.progress(&id).await, Some(p) if p.paused) }
        },
        "pause",
    )
    .await;

    substrate.signal_pause_decision(PauseDecision::Cancel);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(result.outcomes.iter().any(|o| o.status == GroupStatus::Skipped));
}

#[tokio::test]
async fn scenario_e_abort_skips_remaining_but_drains_in_flight() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(10),
        },
    )
    .with_script("g1", AgentScript::Fail { delay: Duration::from_millis(10) })
    .with_script("g2", AgentScript::Succeed { delay: Duration::from_millis(600) })
    .with_script("g3", AgentScript::Succeed { delay: Duration::from_millis(600) });
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(10)
        .with_max_parallel(3)
        .with_failure_policy(FailurePolicy {
            threshold_percent: 20,
            action: FailureAction::Abort,
        });
    let task_id = task.id.clone();

    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let handle = tokio::spawn(async move { controller.run(task).await });

    // The skip happens immediately on the threshold crossing, while g2
    // and g3 are still running.
    let query = substrate.clone();
    let id = task_id.clone();
    wait_until(
        move || {
            let query = query.clone();
            let id = id.clone();
            async move { matches!(query.progress(&id).await, Some(p) if p.skipped == 7) }
        },
        "immediate skip of not-yet-started groups",
    )
    .await;
    let progress = substrate.progress(&task_id).await.unwrap();
    assert!(progress.completed < 3, "skip was not immediate");

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.counts(), (2, 1, 7));
    // In-flight groups still reached their own terminal state.
    assert_eq!(status_of(&result, "g2"), GroupStatus::Succeeded);
    assert_eq!(status_of(&result, "g3"), GroupStatus::Succeeded);
    assert_eq!(status_of(&result, "g1"), GroupStatus::Failed);
    for i in 4..=10 {
        assert_eq!(status_of(&result, &format!("g{}", i)), GroupStatus::Skipped);
    }
}

#[tokio::test]
async fn scenario_d_silent_sandbox_is_a_provisioning_failure() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(base.path(), AgentScript::Silent);
    let substrate = InProcessSubstrate::new();

    let mut config = fast_config();
    config.resources = config
        .resources
        .with_provisioning_window(Duration::from_millis(250));

    let task = task_with_groups(1);
    let controller = TaskController::new(provider, substrate).with_config(config);

    let started = std::time::Instant::now();
    let result = controller.run(task).await.unwrap();

    assert_eq!(result.counts(), (0, 1, 0));
    let outcome = &result.outcomes[0];
    assert!(outcome
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("provisioning failed"));
    // Bounded wait, not an indefinite poll.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stalled_sandbox_fails_on_the_staleness_window() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(base.path(), AgentScript::StallAfterStart);
    let substrate = InProcessSubstrate::new();

    let mut config = fast_config();
    config.staleness_window = Duration::from_millis(300);

    let task = task_with_groups(1);
    let controller = TaskController::new(provider, substrate).with_config(config);
    let result = controller.run(task).await.unwrap();

    assert_eq!(result.counts(), (0, 1, 0));
    assert!(result.outcomes[0]
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("stale"));
}

#[tokio::test]
async fn retry_task_covers_exactly_the_failed_groups() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(10),
        },
    )
    .with_script("g2", AgentScript::Fail { delay: Duration::from_millis(10) })
    .with_script("g4", AgentScript::Fail { delay: Duration::from_millis(10) });
    let substrate = InProcessSubstrate::new();

    let task = task_with_groups(5).with_max_parallel(2);
    let controller =
        TaskController::new(provider, substrate.clone()).with_config(fast_config());
    let result = controller.run(task.clone()).await.unwrap();
    assert_eq!(result.counts(), (3, 2, 0));

    let retry = task.retry_failed(&result).unwrap();
    let mut names: Vec<&str> = retry.groups.iter().map(|g| g.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["g2", "g4"]);
    assert_eq!(retry.retry_of.as_deref(), Some(task.id.as_str()));

    // Running the retry produces a result carrying the lineage.
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(10),
        },
    );
    let controller = TaskController::new(provider, substrate).with_config(fast_config());
    let retry_result = controller.run(retry).await.unwrap();
    assert_eq!(retry_result.retry_of.as_deref(), Some(task.id.as_str()));
    assert_eq!(retry_result.counts(), (2, 0, 0));
}

#[tokio::test]
async fn empty_task_is_a_configuration_error() {
    let base = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(
        base.path(),
        AgentScript::Succeed {
            delay: Duration::from_millis(10),
        },
    );
    let controller =
        TaskController::new(provider, InProcessSubstrate::new()).with_config(fast_config());

    let task = Task::new(
        TaskMode::Transform,
        ExecutionSpec::Deterministic {
            command: "true".to_string(),
        },
    );
    assert!(controller.run(task).await.is_err());
}
