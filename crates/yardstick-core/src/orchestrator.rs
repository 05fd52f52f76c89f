//! Run orchestrator: takes one [`RunConfiguration`] from validation to a
//! written `results.json`.
//!
//! ```text
//! idle -> workspace_setup -> agent_execution -> evaluator_execution
//!      -> result_aggregation -> complete
//!
//! any non-terminal state -> failed
//! ```
//!
//! An agent that fails or times out does not fail the run: its partial
//! output still flows into the evaluators. `failed` is reserved for setup
//! errors, fatal I/O errors, and aborts (interrupt or run deadline). An
//! aborted run discards whatever evaluator results were already collected.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{
    AdapterRegistry, AgentAdapter, AgentExecutionResult, AgentStatus, ExecutionContext,
};
use crate::config::{CleanupPolicy, ConfigError, RunConfiguration};
use crate::evaluator::{EvaluatorPipeline, EvaluatorRegistry, RunSnapshot};
use crate::process::DEFAULT_KILL_GRACE;
use crate::results::{
    AgentLogFile, AgentSummary, LOG_FILE, RESULTS_FILE, ResultsBundle, RunMetadata,
};
use crate::workspace::{CloneTarget, RunId, WorkspaceError, WorkspaceGuard, WorkspaceManager};

/// Environment variable carrying the run id into agent processes.
pub const RUN_ID_ENV_VAR: &str = "YARDSTICK_RUN_ID";
/// Environment variable carrying the workspace root into agent processes.
pub const WORKSPACE_ENV_VAR: &str = "YARDSTICK_WORKSPACE";

/// States of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    WorkspaceSetup,
    AgentExecution,
    EvaluatorExecution,
    ResultAggregation,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the run state graph.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, WorkspaceSetup)
            | (WorkspaceSetup, AgentExecution)
            | (AgentExecution, EvaluatorExecution)
            | (EvaluatorExecution, ResultAggregation)
            | (ResultAggregation, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One entry of a run's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller's cancellation token fired (e.g. Ctrl-C).
    Interrupted,
    /// `run_timeout_secs` elapsed.
    RunTimeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupted => "interrupted",
            Self::RunTimeout => "run-timeout",
        })
    }
}

/// Ways a run can end without a results bundle.
#[derive(Debug, Error)]
pub enum RunError {
    /// The configuration was rejected before any resource was acquired.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Workspace setup failed; the agent never ran.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The run was interrupted or hit its deadline.
    #[error("run aborted: {reason}")]
    Aborted { reason: AbortReason },

    /// Unexpected failure mid-run (e.g. artifacts could not be written).
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub bundle: ResultsBundle,
    /// Workspace root; removed already when `retained` is false.
    pub workspace: PathBuf,
    pub results_path: PathBuf,
    pub retained: bool,
}

/// Current state plus history for one run.
#[derive(Debug)]
struct RunTracker {
    run_id: String,
    current: RunState,
    history: Vec<StateTransition>,
}

impl RunTracker {
    fn new(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.to_string(),
            current: RunState::Idle,
            history: vec![StateTransition {
                state: RunState::Idle,
                at: Utc::now(),
            }],
        }
    }

    fn advance(&mut self, next: RunState) -> anyhow::Result<()> {
        let transition = self.pending(next)?;
        self.commit(transition);
        Ok(())
    }

    /// Check the edge to `next` and stamp it without entering it yet.
    fn pending(&self, next: RunState) -> anyhow::Result<StateTransition> {
        if !self.current.can_transition_to(next) {
            bail!(
                "invalid run state transition: {:?} -> {:?} for run {}",
                self.current,
                next,
                self.run_id
            );
        }
        Ok(StateTransition {
            state: next,
            at: Utc::now(),
        })
    }

    fn commit(&mut self, transition: StateTransition) {
        info!(
            run_id = %self.run_id,
            from = ?self.current,
            to = ?transition.state,
            "run state changed"
        );
        self.current = transition.state;
        self.history.push(transition);
    }

    fn fail(&mut self) {
        if !self.current.is_terminal() {
            let _ = self.advance(RunState::Failed);
        }
    }
}

/// Output of the workspace setup stage.
struct Setup {
    guard: WorkspaceGuard,
    base_commit: String,
    expected_commit: Option<String>,
}

/// Runs configurations against the registered agents and evaluators.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    workspaces: WorkspaceManager,
    agents: AdapterRegistry,
    pipeline: EvaluatorPipeline,
    abort_grace: Duration,
}

impl Orchestrator {
    /// Orchestrator with the built-in agent adapters and evaluators.
    pub fn new(workspaces: WorkspaceManager) -> Self {
        let agents = AdapterRegistry::with_builtins();
        let evaluators = EvaluatorRegistry::with_builtins(agents.clone());
        Self::with_registries(workspaces, agents, evaluators)
    }

    pub fn with_registries(
        workspaces: WorkspaceManager,
        agents: AdapterRegistry,
        evaluators: EvaluatorRegistry,
    ) -> Self {
        Self {
            workspaces,
            agents,
            pipeline: EvaluatorPipeline::new(evaluators),
            abort_grace: DEFAULT_KILL_GRACE + Duration::from_secs(1),
        }
    }

    /// How long an aborted stage gets to stop its processes.
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn agents(&self) -> &AdapterRegistry {
        &self.agents
    }

    /// Validate `config` against its own rules and the registries.
    pub fn validate(&self, config: &RunConfiguration) -> Result<(), ConfigError> {
        self.resolve_adapter(config).map(|_| ())
    }

    fn resolve_adapter(
        &self,
        config: &RunConfiguration,
    ) -> Result<Arc<dyn AgentAdapter>, ConfigError> {
        config.validate()?;

        let adapter = self.agents.get(&config.agent.adapter).ok_or_else(|| {
            ConfigError::new(
                "agent.adapter",
                format!(
                    "unknown adapter {:?} (available: {})",
                    config.agent.adapter,
                    self.agents.list().join(", ")
                ),
            )
        })?;
        adapter
            .validate_config(&config.agent.config)
            .map_err(|reason| ConfigError::new("agent.config", reason))?;

        let evaluators = self.pipeline.registry();
        for (i, spec) in config.evaluators.iter().enumerate() {
            if evaluators.resolve(&spec.name).is_none() {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].name"),
                    format!(
                        "unknown evaluator {:?} (available: {})",
                        spec.name,
                        evaluators.list().join(", ")
                    ),
                ));
            }
        }
        Ok(adapter)
    }

    /// Execute one run end to end.
    ///
    /// Returns a bundle whenever the run reaches evaluation, whatever the
    /// agent did. Configuration and workspace errors return before the
    /// agent runs and leave no workspace behind. Cancelling `cancel` or
    /// passing `run_timeout_secs` stops in-flight processes (SIGTERM, then
    /// SIGKILL after the grace window) and returns [`RunError::Aborted`].
    pub async fn run(
        &self,
        config: &RunConfiguration,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let adapter = self.resolve_adapter(config)?;

        let run_id = RunId::generate();
        let started_at = Utc::now();
        let deadline = config
            .run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let run_cancel = cancel.child_token();
        let mut tracker = RunTracker::new(&run_id);
        info!(
            run_id = %run_id,
            adapter = %config.agent.adapter,
            evaluators = config.evaluators.len(),
            "starting run"
        );

        // -- workspace setup --
        tracker.advance(RunState::WorkspaceSetup)?;
        let setup = self.setup_workspace(&run_id, config);
        let Setup {
            mut guard,
            base_commit,
            expected_commit,
        } = match self.guarded(setup, &run_cancel, cancel, deadline).await {
            Ok(Ok(setup)) => setup,
            Ok(Err(e)) => {
                tracker.fail();
                warn!(run_id = %run_id, error = %e, "workspace setup failed");
                return Err(e);
            }
            Err(reason) => return Err(abort(&mut tracker, reason)),
        };
        guard.keep(config.cleanup == CleanupPolicy::Never);

        let workspace = guard.workspace();
        let workspace_path = workspace.root().to_path_buf();
        let artifacts_dir = workspace.artifacts_dir().to_path_buf();

        // -- agent --
        tracker.advance(RunState::AgentExecution)?;
        let ctx = ExecutionContext {
            workspace_dir: workspace_path.clone(),
            repo_dir: workspace.modified_dir().to_path_buf(),
            prompt: config.task.clone(),
            config: config.agent.config.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            env: BTreeMap::from([
                (RUN_ID_ENV_VAR.to_string(), run_id.to_string()),
                (
                    WORKSPACE_ENV_VAR.to_string(),
                    workspace_path.display().to_string(),
                ),
            ]),
            cancel: run_cancel.clone(),
        };
        let agent_stage = execute_agent(adapter.as_ref(), &ctx);
        let agent_result = match self.guarded(agent_stage, &run_cancel, cancel, deadline).await {
            Ok(result) => result,
            Err(reason) => return Err(abort(&mut tracker, reason)),
        };
        if agent_result.status == AgentStatus::Success {
            info!(run_id = %run_id, duration_ms = agent_result.duration_ms, "agent finished");
        } else {
            warn!(
                run_id = %run_id,
                status = ?agent_result.status,
                exit_code = ?agent_result.exit_code,
                "agent did not succeed, evaluating partial output"
            );
        }

        let log = adapter.normalize_log(&agent_result.output, &agent_result);
        let log_file = AgentLogFile {
            log,
            raw_output: agent_result.output.clone(),
        };
        if let Err(e) = log_file.write_to(&artifacts_dir.join(LOG_FILE)) {
            return Err(fatal(&mut tracker, e));
        }
        let log = log_file.log;

        // -- evaluators --
        tracker.advance(RunState::EvaluatorExecution)?;
        let snapshot = Arc::new(RunSnapshot {
            run_id: run_id.to_string(),
            task: config.task.clone(),
            agent_adapter: config.agent.adapter.clone(),
            agent_config: config.agent.config.clone(),
            modified_dir: workspace.modified_dir().to_path_buf(),
            expected_dir: workspace.expected_dir().map(Path::to_path_buf),
            base_commit: base_commit.clone(),
            agent_result: agent_result.clone(),
            log: log.clone(),
        });
        let evaluation = self
            .pipeline
            .run(&config.evaluators, snapshot, workspace, &run_cancel);
        let evaluations = match self.guarded(evaluation, &run_cancel, cancel, deadline).await {
            Ok(results) => results,
            Err(reason) => return Err(abort(&mut tracker, reason)),
        };

        // -- aggregation --
        tracker.advance(RunState::ResultAggregation)?;
        // The bundle records `complete`, but the run only enters it once
        // the bundle is on disk.
        let completion = tracker.pending(RunState::Complete)?;
        let finished_at = completion.at;
        let mut states = tracker.history.clone();
        states.push(completion.clone());
        let bundle = ResultsBundle::new(
            RunMetadata {
                run_id: run_id.to_string(),
                name: config.name.clone(),
                task: config.task.clone(),
                repository_url: config.repository.url.clone(),
                reference: config.repository.reference.clone(),
                base_commit,
                expected_ref: config.repository.expected_ref.clone(),
                expected_commit,
                adapter: config.agent.adapter.clone(),
                started_at,
                finished_at,
                duration_ms: u64::try_from((finished_at - started_at).num_milliseconds())
                    .unwrap_or(0),
                workspace: workspace_path.clone(),
                states,
            },
            AgentSummary::new(&config.agent.adapter, &agent_result, &log),
            evaluations,
        );
        let results_path = artifacts_dir.join(RESULTS_FILE);
        persist_bundle(&mut tracker, &bundle, completion, &results_path)?;

        let retained = config.cleanup != CleanupPolicy::Always;
        guard.keep(retained);
        info!(
            run_id = %run_id,
            overall = ?bundle.summary.overall_status,
            passed = bundle.summary.passed,
            failed = bundle.summary.failed,
            skipped = bundle.summary.skipped,
            "run complete"
        );
        drop(guard);

        Ok(RunOutcome {
            bundle,
            workspace: workspace_path,
            results_path,
            retained,
        })
    }

    /// Create, lock, and populate the workspace. Any failure removes the
    /// tree again.
    async fn setup_workspace(
        &self,
        run_id: &RunId,
        config: &RunConfiguration,
    ) -> Result<Setup, RunError> {
        let mut guard = WorkspaceGuard::new(self.workspaces.create_workspace(run_id)?);
        guard.workspace_mut().acquire_lock()?;

        let repo = config.repository.clone();
        let populated = tokio::task::spawn_blocking(move || -> Result<Setup, WorkspaceError> {
            let workspace = guard.workspace_mut();
            let base_commit =
                workspace.clone_repository(&repo.url, &repo.reference, CloneTarget::Modified)?;
            let expected_commit = match &repo.expected_ref {
                Some(reference) => Some(workspace.clone_repository(
                    repo.expected_source(),
                    reference,
                    CloneTarget::Expected,
                )?),
                None => None,
            };
            Ok(Setup {
                guard,
                base_commit,
                expected_commit,
            })
        })
        .await
        .context("workspace setup task failed")?;
        Ok(populated?)
    }

    /// Drive `stage` until it finishes, the caller cancels, or the run
    /// deadline passes. On abort, `stage_cancel` is cancelled and the stage
    /// gets `abort_grace` to stop its processes before it is dropped.
    async fn guarded<F: Future>(
        &self,
        stage: F,
        stage_cancel: &CancellationToken,
        interrupt: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<F::Output, AbortReason> {
        tokio::pin!(stage);
        let reason = tokio::select! {
            output = &mut stage => return Ok(output),
            _ = interrupt.cancelled() => AbortReason::Interrupted,
            _ = deadline_elapsed(deadline) => AbortReason::RunTimeout,
        };

        stage_cancel.cancel();
        if tokio::time::timeout(self.abort_grace, &mut stage).await.is_err() {
            warn!(
                reason = %reason,
                grace_ms = u64::try_from(self.abort_grace.as_millis()).unwrap_or(u64::MAX),
                "stage did not stop within the abort grace window"
            );
        }
        Err(reason)
    }
}

async fn execute_agent(adapter: &dyn AgentAdapter, ctx: &ExecutionContext) -> AgentExecutionResult {
    if !adapter.check_availability(&ctx.config).await {
        warn!(adapter = adapter.name(), "agent is not available");
        return AgentExecutionResult::not_started(
            "unavailable",
            format!("agent adapter {:?} is not available", adapter.name()),
        );
    }
    adapter.execute(ctx).await
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Write `results.json`, then enter `complete`. A failed write fails the run.
fn persist_bundle(
    tracker: &mut RunTracker,
    bundle: &ResultsBundle,
    completion: StateTransition,
    path: &Path,
) -> Result<(), RunError> {
    if let Err(e) = bundle.write_to(path) {
        return Err(fatal(tracker, e));
    }
    tracker.commit(completion);
    Ok(())
}

fn abort(tracker: &mut RunTracker, reason: AbortReason) -> RunError {
    tracker.fail();
    warn!(run_id = %tracker.run_id, reason = %reason, "run aborted");
    RunError::Aborted { reason }
}

fn fatal(tracker: &mut RunTracker, error: anyhow::Error) -> RunError {
    tracker.fail();
    warn!(run_id = %tracker.run_id, error = %error, "run failed");
    RunError::Fatal(error)
}
