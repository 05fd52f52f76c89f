//! `yardstick run` command: execute one run configuration end to end.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use yardstick_core::config::RunConfiguration;
use yardstick_core::evaluator::EvaluationStatus;
use yardstick_core::orchestrator::{AbortReason, Orchestrator, RunError, RunOutcome};
use yardstick_core::results::OverallStatus;
use yardstick_core::workspace::WorkspaceManager;

use crate::config::YardstickConfig;

/// Exit code for an interrupted run.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run the configuration at `config_path`. Returns the process exit code:
/// 0 passed, 1 failed, 2 partial, 130 interrupted.
pub async fn run_command(
    config_path: &Path,
    output: Option<&Path>,
    resolved: &YardstickConfig,
) -> Result<i32> {
    let config = RunConfiguration::load(config_path)?;
    let orchestrator = Orchestrator::new(WorkspaceManager::new(&resolved.workspace_root));

    println!(
        "Running {} with adapter {} ({} evaluator(s))",
        config.name.as_deref().unwrap_or("task"),
        config.agent.adapter,
        config.evaluators.len()
    );
    println!("  Repository: {} @ {}", config.repository.url, config.repository.reference);
    println!("  Agent timeout: {}s", config.timeout_secs);

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    let mut signals = ShutdownSignals::new().context("failed to install signal handlers")?;

    tokio::spawn(async move {
        loop {
            signals.recv().await;
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(EXIT_INTERRUPTED);
            }
            eprintln!("\nStopping the run and cleaning up (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let outcome = match orchestrator.run(&config, &cancel).await {
        Ok(outcome) => outcome,
        Err(RunError::Aborted { reason }) => {
            println!("\nRun aborted: {reason}. No results were written.");
            return Ok(match reason {
                AbortReason::Interrupted => EXIT_INTERRUPTED,
                AbortReason::RunTimeout => 1,
            });
        }
        Err(e) => return Err(e).context("run failed"),
    };

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&outcome.bundle)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
    }

    print_outcome(&outcome, output);

    Ok(match outcome.bundle.summary.overall_status {
        OverallStatus::Passed => 0,
        OverallStatus::Failed => 1,
        OverallStatus::Partial => 2,
    })
}

/// Ctrl-C and, on Unix, SIGTERM.
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown request.
    async fn recv(&mut self) {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.terminate.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_outcome(outcome: &RunOutcome, output: Option<&Path>) {
    let bundle = &outcome.bundle;
    println!();
    println!("Run {}", bundle.run.run_id);
    println!(
        "  Agent: {:?} in {}ms",
        bundle.agent.status, bundle.agent.duration_ms
    );
    for error in &bundle.agent.errors {
        println!("    {}: {}", error.kind, error.message);
    }

    println!();
    let width = bundle
        .evaluators
        .iter()
        .map(|e| e.evaluator.len())
        .max()
        .unwrap_or(0);
    for result in &bundle.evaluators {
        let status = match result.status {
            EvaluationStatus::Passed => "PASS",
            EvaluationStatus::Failed => "FAIL",
            EvaluationStatus::Skipped => "SKIP",
        };
        let message = result.message.lines().next().unwrap_or_default();
        println!("  {status}  {:<width$}  {message}", result.evaluator);
    }

    let summary = &bundle.summary;
    println!();
    println!(
        "{:?}: {} passed, {} failed, {} skipped of {}",
        summary.overall_status, summary.passed, summary.failed, summary.skipped, summary.total
    );
    if outcome.retained {
        println!("Results: {}", outcome.results_path.display());
    } else {
        println!("Workspace removed (cleanup = always).");
    }
    if let Some(path) = output {
        println!("Results copied to {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_requests_shutdown() {
        let mut signals = ShutdownSignals::new().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("SIGTERM was not observed");
    }
}
