//! End-to-end runs through the orchestrator.
//!
//! Each test builds a throwaway origin repository with the `git` binary and
//! uses the `command` adapter with `sh` scripts as the agent under test, so
//! no real coding agent is needed.
//!
//! Requirements:
//! - Git available on PATH
//! - `/bin/sh`

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use yardstick_core::agent::{AdapterRegistry, AgentStatus};
use yardstick_core::config::{
    AgentSpec, CleanupPolicy, EvaluatorSpec, RepositorySpec, RunConfiguration,
};
use yardstick_core::evaluator::{
    EvaluationContext, EvaluationResult, EvaluationStatus, Evaluator, EvaluatorRegistry,
};
use yardstick_core::orchestrator::{AbortReason, Orchestrator, RunError, RunState};
use yardstick_core::results::{OverallStatus, ResultsBundle};
use yardstick_core::workspace::{LOCK_FILE, WorkspaceManager};

// ===========================================================================
// Test harness
// ===========================================================================

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Origin with `main` (README.md, a.txt) and a `solution` branch that
/// rewrites a.txt and adds b.txt.
fn create_origin() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path();
    git(path, &["init", "--quiet", "--initial-branch=main"]);
    git(path, &["config", "user.email", "test@yardstick.dev"]);
    git(path, &["config", "user.name", "Yardstick Test"]);
    std::fs::write(path.join("README.md"), "# Test repo\n").unwrap();
    std::fs::write(path.join("a.txt"), "hello\n").unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "initial"]);

    git(path, &["checkout", "--quiet", "-b", "solution"]);
    std::fs::write(path.join("a.txt"), "hello world\n").unwrap();
    std::fs::write(path.join("b.txt"), "extra\n").unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "solve"]);
    git(path, &["checkout", "--quiet", "main"]);
    dir
}

/// Agent that ignores its prompt and runs `script` in the repository.
fn sh_agent(script: &str) -> AgentSpec {
    AgentSpec {
        adapter: "command".to_string(),
        config: json!({
            "program": "sh",
            "args": ["-c", format!("cat > /dev/null; {script}")],
        }),
    }
}

fn evaluator(name: &str, config: Value) -> EvaluatorSpec {
    EvaluatorSpec {
        name: name.to_string(),
        config,
    }
}

fn run_config(origin: &Path, agent: AgentSpec, evaluators: Vec<EvaluatorSpec>) -> RunConfiguration {
    RunConfiguration {
        name: Some("greeting".to_string()),
        task: "Change the greeting in a.txt to 'hello world'.".to_string(),
        repository: RepositorySpec {
            url: origin.to_string_lossy().into_owned(),
            reference: "main".to_string(),
            expected_ref: None,
            expected_url: None,
        },
        agent,
        evaluators,
        timeout_secs: 60,
        run_timeout_secs: None,
        cleanup: CleanupPolicy::Retain,
    }
}

fn judge_says(verdict: &str) -> Value {
    json!({
        "adapter": "command",
        "criteria": ["The greeting was updated", "Nothing else changed"],
        "agent_config": {
            "program": "sh",
            "args": ["-c", format!("cat > /dev/null; echo 'Looking around.'; echo '{verdict}'")],
        },
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn full_run_writes_results_bundle() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));

    let mut config = run_config(
        origin.path(),
        sh_agent("echo 'hello world' > a.txt; echo edited a.txt"),
        vec![
            evaluator("diff-summary", json!({ "max_files_changed": 3, "save_diff": true })),
            evaluator("expected-diff", json!({ "threshold": 0.5 })),
            evaluator(
                "agentic-judge:quality",
                judge_says(r#"{"status":"passed","metrics":{"score":9},"message":"looks right"}"#),
            ),
        ],
    );
    config.repository.expected_ref = Some("solution".to_string());

    let outcome = orchestrator
        .run(&config, &CancellationToken::new())
        .await
        .expect("run should complete");
    let bundle = &outcome.bundle;

    assert_eq!(bundle.agent.status, AgentStatus::Success);
    assert_eq!(bundle.run.base_commit.len(), 40);
    let expected_commit = bundle.run.expected_commit.as_deref().unwrap();
    assert_ne!(expected_commit, bundle.run.base_commit);

    let states: Vec<RunState> = bundle.run.states.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            RunState::Idle,
            RunState::WorkspaceSetup,
            RunState::AgentExecution,
            RunState::EvaluatorExecution,
            RunState::ResultAggregation,
            RunState::Complete,
        ]
    );

    let names: Vec<&str> = bundle.evaluators.iter().map(|e| e.evaluator.as_str()).collect();
    assert_eq!(names, ["diff-summary", "expected-diff", "agentic-judge:quality"]);
    for result in &bundle.evaluators {
        assert_eq!(result.status, EvaluationStatus::Passed, "{result:?}");
    }
    assert_eq!(bundle.summary.total, 3);
    assert_eq!(bundle.summary.overall_status, OverallStatus::Passed);

    let diff = &bundle.evaluators[0];
    assert_eq!(diff.metrics["files_changed"], 1);
    assert_eq!(diff.metrics["lines_added"], 1);
    assert_eq!(diff.metrics["lines_removed"], 1);
    assert_eq!(diff.artifacts.len(), 1);

    let expected = &bundle.evaluators[1];
    assert_eq!(expected.metrics["matched"], 2);
    assert_eq!(expected.metrics["removed"], 1);
    let aggregate = expected.metrics["aggregate_similarity"].as_f64().unwrap();
    assert!((aggregate - 2.0 / 3.0).abs() < 1e-9, "aggregate = {aggregate}");

    let judge = &bundle.evaluators[2];
    assert_eq!(judge.metrics["score"], 9);
    assert!(judge.message.starts_with("looks right"));

    // Persisted layout.
    assert!(outcome.retained);
    let artifacts = outcome.workspace.join("artifacts");
    assert!(artifacts.join("log.json").is_file());
    assert!(artifacts.join(&diff.artifacts[0]).is_file());
    assert!(!outcome.workspace.join(LOCK_FILE).exists(), "lock must be released");
    let loaded = ResultsBundle::load(&outcome.results_path).unwrap();
    assert_eq!(&loaded, bundle);
    assert_eq!(
        std::fs::read_to_string(outcome.workspace.join("modified/a.txt")).unwrap(),
        "hello world\n"
    );
}

#[tokio::test]
async fn identical_runs_are_comparable() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let config = run_config(
        origin.path(),
        sh_agent("echo 'hello world' > a.txt"),
        vec![
            evaluator("diff-summary", json!({})),
            evaluator(
                "agentic-judge",
                judge_says(r#"{"status":"failed","metrics":{},"message":"no tests"}"#),
            ),
        ],
    );

    let first = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    let second = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();

    assert_ne!(first.bundle.run.run_id, second.bundle.run.run_id);
    assert_ne!(first.workspace, second.workspace);
    assert_eq!(
        first.bundle.comparable().unwrap(),
        second.bundle.comparable().unwrap()
    );
    assert_eq!(first.bundle.summary.overall_status, OverallStatus::Failed);
    assert_eq!(
        orchestrator.workspaces().list_workspaces().unwrap().len(),
        2
    );
}

#[tokio::test]
async fn failing_agent_is_still_evaluated() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let config = run_config(
        origin.path(),
        sh_agent("echo partial > a.txt; echo 'gave up' >&2; exit 3"),
        vec![evaluator("diff-summary", json!({}))],
    );

    let outcome = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.bundle.agent.status, AgentStatus::Failed);
    assert_eq!(outcome.bundle.agent.exit_code, Some(3));
    assert_eq!(outcome.bundle.evaluators[0].status, EvaluationStatus::Passed);
    assert_eq!(outcome.bundle.evaluators[0].metrics["files_changed"], 1);

    let log = std::fs::read_to_string(outcome.workspace.join("artifacts/log.json")).unwrap();
    assert!(log.contains("gave up"));
}

#[tokio::test]
async fn agent_timeout_still_produces_bundle() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let mut config = run_config(
        origin.path(),
        sh_agent("echo started; sleep 30"),
        vec![
            evaluator("diff-summary", json!({})),
            evaluator("expected-diff", json!({})),
        ],
    );
    config.timeout_secs = 1;

    let started = std::time::Instant::now();
    let outcome = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    let bundle = &outcome.bundle;
    assert_eq!(bundle.agent.status, AgentStatus::Timeout);
    assert_eq!(bundle.evaluators.len(), 2);
    assert_eq!(bundle.evaluators[0].status, EvaluationStatus::Passed);
    // No expected reference configured.
    assert_eq!(bundle.evaluators[1].status, EvaluationStatus::Skipped);
    assert_eq!(bundle.summary.overall_status, OverallStatus::Partial);
}

#[tokio::test]
async fn unavailable_agent_is_recorded_not_fatal() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let config = run_config(
        origin.path(),
        AgentSpec {
            adapter: "command".to_string(),
            config: json!({ "program": "definitely-not-an-agent-binary" }),
        },
        vec![evaluator("diff-summary", json!({}))],
    );

    let outcome = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.bundle.agent.status, AgentStatus::Failed);
    assert_eq!(outcome.bundle.agent.errors[0].kind, "unavailable");
    assert_eq!(outcome.bundle.evaluators[0].metrics["files_changed"], 0);
}

struct Exploding;

#[async_trait]
impl Evaluator for Exploding {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "panics during evaluation"
    }

    async fn evaluate(&self, _ctx: &EvaluationContext) -> Result<EvaluationResult> {
        panic!("boom");
    }
}

#[tokio::test]
async fn panicking_evaluator_does_not_sink_the_run() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let agents = AdapterRegistry::with_builtins();
    let mut evaluators = EvaluatorRegistry::with_builtins(agents.clone());
    evaluators.register("explode", |_| Ok(Box::new(Exploding)));
    let orchestrator =
        Orchestrator::with_registries(WorkspaceManager::new(root.path()), agents, evaluators);

    let config = run_config(
        origin.path(),
        sh_agent("echo 'hello world' > a.txt"),
        vec![
            evaluator("explode", json!({})),
            evaluator("diff-summary", json!({})),
        ],
    );

    let outcome = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    let bundle = &outcome.bundle;
    assert_eq!(bundle.evaluators.len(), 2);
    assert_eq!(bundle.evaluators[0].evaluator, "explode");
    assert_eq!(bundle.evaluators[0].status, EvaluationStatus::Skipped);
    assert!(bundle.evaluators[0].error.as_deref().unwrap().contains("boom"));
    assert_eq!(bundle.evaluators[1].status, EvaluationStatus::Passed);
    assert_eq!(bundle.summary.overall_status, OverallStatus::Partial);
}

#[tokio::test]
async fn missing_expected_ref_fails_before_agent_runs() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let marker_dir = TempDir::new().unwrap();
    let marker = marker_dir.path().join("agent-ran");
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));

    let mut config = run_config(
        origin.path(),
        sh_agent(&format!("touch '{}'", marker.display())),
        vec![evaluator("diff-summary", json!({}))],
    );
    config.repository.expected_ref = Some("no-such-branch".to_string());
    config.cleanup = CleanupPolicy::Never;

    let err = orchestrator
        .run(&config, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Workspace(_)), "unexpected error: {err}");
    assert!(err.to_string().contains("expected"), "{err}");
    assert!(!marker.exists(), "agent must not run");
    assert!(orchestrator.workspaces().list_workspaces().unwrap().is_empty());
}

#[tokio::test]
async fn run_deadline_aborts_and_removes_workspace() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let mut config = run_config(
        origin.path(),
        sh_agent("sleep 30"),
        vec![evaluator("diff-summary", json!({}))],
    );
    config.run_timeout_secs = Some(1);

    let err = orchestrator
        .run(&config, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Aborted {
            reason: AbortReason::RunTimeout
        }
    ));
    assert!(orchestrator.workspaces().list_workspaces().unwrap().is_empty());
}

#[tokio::test]
async fn interrupt_aborts_run() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let config = run_config(
        origin.path(),
        sh_agent("sleep 30"),
        vec![evaluator("diff-summary", json!({}))],
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = orchestrator.run(&config, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Aborted {
            reason: AbortReason::Interrupted
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(orchestrator.workspaces().list_workspaces().unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_always_removes_workspace_after_success() {
    let origin = create_origin();
    let root = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(WorkspaceManager::new(root.path()));
    let mut config = run_config(
        origin.path(),
        sh_agent("true"),
        vec![evaluator("diff-summary", json!({}))],
    );
    config.cleanup = CleanupPolicy::Always;

    let outcome = orchestrator.run(&config, &CancellationToken::new()).await.unwrap();
    assert!(!outcome.retained);
    assert!(!outcome.workspace.exists());
    assert_eq!(outcome.bundle.summary.total, 1);
}
