//! Structural diff metrics: how much the agent changed, and how spread out
//! the change is.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::trait_def::Evaluator;
use super::types::{EvaluationContext, EvaluationResult};
use crate::diff;
use crate::vcs::{self, FileChange};

/// Optional limits; any violated limit fails the evaluation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DiffSummaryConfig {
    max_files_changed: Option<u64>,
    max_lines_added: Option<u64>,
    max_lines_removed: Option<u64>,
    max_total_lines: Option<u64>,
    min_entropy: Option<f64>,
    max_entropy: Option<f64>,
    /// Write the unified diff to `changes.diff`.
    save_diff: bool,
}

/// Files changed, lines added/removed, and change entropy of the agent's
/// work relative to the commit it started from.
#[derive(Debug, Clone)]
pub struct DiffSummaryEvaluator {
    name: String,
    config: DiffSummaryConfig,
}

impl DiffSummaryEvaluator {
    pub const NAME: &'static str = "diff-summary";

    pub fn from_config(name: &str, config: &Value) -> Result<Self, String> {
        let config: DiffSummaryConfig =
            serde_json::from_value(config.clone()).map_err(|e| format!("invalid config: {e}"))?;
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }

    fn violations(&self, summary: &Summary) -> Vec<String> {
        let c = &self.config;
        let mut out = Vec::new();
        let mut check_max = |label: &str, value: u64, limit: Option<u64>| {
            if let Some(limit) = limit.filter(|limit| value > *limit) {
                out.push(format!("{label} {value} exceeds maximum {limit}"));
            }
        };
        check_max("files changed", summary.files_changed, c.max_files_changed);
        check_max("lines added", summary.lines_added, c.max_lines_added);
        check_max("lines removed", summary.lines_removed, c.max_lines_removed);
        check_max("total lines", summary.total_lines(), c.max_total_lines);

        if let Some(min) = c.min_entropy.filter(|min| summary.entropy < *min) {
            out.push(format!("change entropy {:.3} below minimum {min}", summary.entropy));
        }
        if let Some(max) = c.max_entropy.filter(|max| summary.entropy > *max) {
            out.push(format!("change entropy {:.3} exceeds maximum {max}", summary.entropy));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Summary {
    files_changed: u64,
    lines_added: u64,
    lines_removed: u64,
    entropy: f64,
}

impl Summary {
    fn from_changes(changes: &[FileChange]) -> Self {
        let totals: Vec<u64> = changes.iter().map(FileChange::total).collect();
        Self {
            files_changed: changes.len() as u64,
            lines_added: changes.iter().filter_map(|c| c.added).sum(),
            lines_removed: changes.iter().filter_map(|c| c.removed).sum(),
            entropy: change_entropy(&totals),
        }
    }

    fn total_lines(&self) -> u64 {
        self.lines_added + self.lines_removed
    }
}

/// Shannon entropy (bits) of the per-file share of changed lines.
///
/// Zero when nothing changed or everything changed in one file; `log2(n)`
/// when `n` files changed equally.
pub fn change_entropy(lines_per_file: &[u64]) -> f64 {
    let total: u64 = lines_per_file.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let entropy: f64 = lines_per_file
        .iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum();
    // -0.0 for a single file
    entropy.max(0.0)
}

/// Tracked changes from git plus untracked files rendered as additions.
fn full_patch(dir: &std::path::Path, base: Option<&str>, changes: &[FileChange]) -> Result<String> {
    let mut patch = vcs::diff_patch(dir, base)?;
    for change in changes.iter().filter(|c| c.untracked && c.added.is_some()) {
        let path = dir.join(&change.path);
        let content = if path.is_symlink() {
            let target = std::fs::read_link(&path)
                .with_context(|| format!("failed to read link {}", path.display()))?;
            format!("{}\n", target.display())
        } else {
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
        };
        patch.push_str(&format!("diff --git a/{0} b/{0}\nnew file\n", change.path));
        patch.push_str(
            &diff::diff_lines("", &content).unified("/dev/null", &format!("b/{}", change.path), 3),
        );
    }
    Ok(patch)
}

#[async_trait]
impl Evaluator for DiffSummaryEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Files changed, lines added/removed, and change entropy against the base commit"
    }

    async fn check_preconditions(&self, ctx: &EvaluationContext) -> Result<(), String> {
        if !ctx.modified_dir().join(".git").exists() {
            return Err(format!(
                "{} is not a git checkout",
                ctx.modified_dir().display()
            ));
        }
        Ok(())
    }

    async fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult> {
        let dir = ctx.modified_dir().to_path_buf();
        let base = Some(ctx.run.base_commit.clone()).filter(|b| !b.is_empty());
        let save_diff = self.config.save_diff;

        let (changes, patch) = tokio::task::spawn_blocking(move || -> Result<_> {
            let changes = vcs::diff_numstat(&dir, base.as_deref())?;
            let patch = if save_diff {
                Some(full_patch(&dir, base.as_deref(), &changes)?)
            } else {
                None
            };
            Ok((changes, patch))
        })
        .await
        .context("diff task panicked")??;

        let summary = Summary::from_changes(&changes);
        let violations = self.violations(&summary);

        let files: Vec<Value> = changes
            .iter()
            .map(|c| {
                json!({
                    "path": c.path,
                    "lines_added": c.added,
                    "lines_removed": c.removed,
                    "binary": c.added.is_none(),
                    "untracked": c.untracked,
                })
            })
            .collect();

        let message = if violations.is_empty() {
            format!(
                "{} files changed (+{} -{}), change entropy {:.3}",
                summary.files_changed, summary.lines_added, summary.lines_removed, summary.entropy
            )
        } else {
            format!("assertions violated: {}", violations.join("; "))
        };

        let mut result = EvaluationResult::verdict(&self.name, violations.is_empty(), message)
            .with_metric("files_changed", summary.files_changed)
            .with_metric("lines_added", summary.lines_added)
            .with_metric("lines_removed", summary.lines_removed)
            .with_metric("total_lines", summary.total_lines())
            .with_metric("change_entropy", summary.entropy)
            .with_metric("files", files);
        if !violations.is_empty() {
            result = result.with_metric("violations", violations);
        }

        if let Some(patch) = patch {
            let artifact = ctx
                .write_artifact("changes.diff", &patch)
                .context("failed to write changes.diff")?;
            result.artifacts.push(artifact);
        }

        Ok(result)
    }
}
