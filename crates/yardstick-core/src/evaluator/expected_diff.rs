//! Similarity of the agent's tree to a known-good reference tree.
//!
//! Every path present in either tree is classified:
//!
//! | status           | meaning                          | score        |
//! |------------------|----------------------------------|--------------|
//! | `matched`        | identical content                | 1.0          |
//! | `changed`        | text differs                     | (0.0, 1.0)   |
//! | `added`          | only in the agent's tree         | 0.0          |
//! | `removed`        | only in the reference tree       | 0.0          |
//! | `binary_changed` | binary content differs           | not scored   |
//!
//! The aggregate is the mean score over every scored path, so files on only
//! one side drag it down.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use walkdir::WalkDir;

use super::trait_def::Evaluator;
use super::types::{EvaluationContext, EvaluationResult};
use crate::diff;

pub const DEFAULT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ExpectedDiffConfig {
    threshold: f64,
    /// Write a unified diff from reference to agent tree as `expected.diff`.
    save_diff: bool,
}

impl Default for ExpectedDiffConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            save_diff: false,
        }
    }
}

/// Per-path classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Matched,
    Changed,
    Added,
    Removed,
    BinaryChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileComparison {
    pub path: String,
    pub status: FileStatus,
    /// `None` for binary changes.
    pub similarity: Option<f64>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Result of comparing two trees.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeComparison {
    pub files: Vec<FileComparison>,
}

impl TreeComparison {
    /// Mean similarity over scored files; 1.0 when there is nothing to
    /// compare.
    pub fn aggregate(&self) -> f64 {
        let scores: Vec<f64> = self.files.iter().filter_map(|f| f.similarity).collect();
        if scores.is_empty() {
            return 1.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    fn scored(&self) -> usize {
        self.files.iter().filter(|f| f.similarity.is_some()).count()
    }
}

/// Relative paths of every regular file under `root`, skipping `.git`.
fn list_files(root: &Path) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", entry.path().display(), root.display()))?;
        files.insert(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(files)
}

fn read(root: &Path, rel: &str) -> Result<Vec<u8>> {
    let path: PathBuf = root.join(rel);
    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
}

/// Compare the agent's tree against the reference tree.
pub fn compare_trees(modified: &Path, expected: &Path) -> Result<TreeComparison> {
    let modified_files = list_files(modified)?;
    let expected_files = list_files(expected)?;

    let mut files = Vec::new();
    for path in modified_files.union(&expected_files) {
        let comparison = match (modified_files.contains(path), expected_files.contains(path)) {
            (true, true) => compare_file(path, &read(expected, path)?, &read(modified, path)?),
            (true, false) => one_sided(path, FileStatus::Added, &read(modified, path)?),
            (false, true) => one_sided(path, FileStatus::Removed, &read(expected, path)?),
            (false, false) => continue,
        };
        files.push(comparison);
    }
    Ok(TreeComparison { files })
}

fn one_sided(path: &str, status: FileStatus, bytes: &[u8]) -> FileComparison {
    let lines = if diff::is_binary(bytes) {
        0
    } else {
        String::from_utf8_lossy(bytes).lines().count()
    };
    let (lines_added, lines_removed) = match status {
        FileStatus::Added => (lines, 0),
        _ => (0, lines),
    };
    FileComparison {
        path: path.to_string(),
        status,
        similarity: Some(0.0),
        lines_added,
        lines_removed,
    }
}

fn compare_file(path: &str, expected: &[u8], modified: &[u8]) -> FileComparison {
    let mut comparison = FileComparison {
        path: path.to_string(),
        status: FileStatus::Matched,
        similarity: Some(1.0),
        lines_added: 0,
        lines_removed: 0,
    };
    if expected == modified {
        return comparison;
    }
    if diff::is_binary(expected) || diff::is_binary(modified) {
        comparison.status = FileStatus::BinaryChanged;
        comparison.similarity = None;
        return comparison;
    }

    // is_binary rejects invalid UTF-8, so these are lossless.
    let expected = String::from_utf8_lossy(expected);
    let modified = String::from_utf8_lossy(modified);
    let score = diff::similarity(&expected, &modified);
    let lines = diff::diff_lines(&expected, &modified);
    comparison.lines_added = lines.added();
    comparison.lines_removed = lines.removed();
    comparison.similarity = Some(score);
    if score < 1.0 {
        comparison.status = FileStatus::Changed;
    }
    comparison
}

/// Unified diff from the reference tree to the agent's tree for every text
/// file that is not matched.
fn render_diff(modified: &Path, expected: &Path, comparison: &TreeComparison) -> Result<String> {
    let mut out = String::new();
    for file in &comparison.files {
        let (old, new) = match file.status {
            FileStatus::Matched | FileStatus::BinaryChanged => continue,
            FileStatus::Changed => (read(expected, &file.path)?, read(modified, &file.path)?),
            FileStatus::Added => (Vec::new(), read(modified, &file.path)?),
            FileStatus::Removed => (read(expected, &file.path)?, Vec::new()),
        };
        if diff::is_binary(&old) || diff::is_binary(&new) {
            out.push_str(&format!("Binary file {} differs\n", file.path));
            continue;
        }
        let old = String::from_utf8_lossy(&old);
        let new = String::from_utf8_lossy(&new);
        out.push_str(&diff::diff_lines(&old, &new).unified(
            &format!("expected/{}", file.path),
            &format!("modified/{}", file.path),
            3,
        ));
    }
    Ok(out)
}

/// Scores the agent's tree against the expected reference tree.
#[derive(Debug, Clone)]
pub struct ExpectedDiffEvaluator {
    name: String,
    config: ExpectedDiffConfig,
}

impl ExpectedDiffEvaluator {
    pub const NAME: &'static str = "expected-diff";

    pub fn from_config(name: &str, config: &Value) -> Result<Self, String> {
        let config: ExpectedDiffConfig =
            serde_json::from_value(config.clone()).map_err(|e| format!("invalid config: {e}"))?;
        if !(0.0..=1.0).contains(&config.threshold) {
            return Err(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                config.threshold
            ));
        }
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }
}

#[async_trait]
impl Evaluator for ExpectedDiffEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Similarity of the modified tree to the expected reference tree"
    }

    fn requires_expected_reference(&self) -> bool {
        true
    }

    async fn check_preconditions(&self, ctx: &EvaluationContext) -> Result<(), String> {
        match ctx.expected_dir() {
            None => Err("no expected reference configured (repository.expected_ref)".to_string()),
            Some(dir) if !dir.is_dir() => Err(format!("expected tree {} is missing", dir.display())),
            Some(_) => Ok(()),
        }
    }

    async fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult> {
        let Some(expected) = ctx.expected_dir().map(Path::to_path_buf) else {
            return Ok(EvaluationResult::skipped(
                &self.name,
                "no expected reference configured",
            ));
        };
        let modified = ctx.modified_dir().to_path_buf();
        let save_diff = self.config.save_diff;

        let (comparison, patch) = tokio::task::spawn_blocking(move || -> Result<_> {
            let comparison = compare_trees(&modified, &expected)?;
            let patch = if save_diff {
                Some(render_diff(&modified, &expected, &comparison)?)
            } else {
                None
            };
            Ok((comparison, patch))
        })
        .await
        .context("comparison task panicked")??;

        let aggregate = comparison.aggregate();
        let threshold = self.config.threshold;
        let passed = aggregate >= threshold;
        let message = format!(
            "aggregate similarity {aggregate:.3} {} threshold {threshold:.3} ({} matched, {} changed, {} added, {} removed)",
            if passed { ">=" } else { "<" },
            comparison.count(FileStatus::Matched),
            comparison.count(FileStatus::Changed),
            comparison.count(FileStatus::Added),
            comparison.count(FileStatus::Removed),
        );

        let mut result = EvaluationResult::verdict(&self.name, passed, message)
            .with_metric("aggregate_similarity", aggregate)
            .with_metric("threshold", threshold)
            .with_metric("files_compared", comparison.scored())
            .with_metric("matched", comparison.count(FileStatus::Matched))
            .with_metric("changed", comparison.count(FileStatus::Changed))
            .with_metric("added", comparison.count(FileStatus::Added))
            .with_metric("removed", comparison.count(FileStatus::Removed))
            .with_metric("binary_changed", comparison.count(FileStatus::BinaryChanged))
            .with_metric("files", json!(comparison.files));

        if let Some(patch) = patch {
            let artifact = ctx
                .write_artifact("expected.diff", &patch)
                .context("failed to write expected.diff")?;
            result.artifacts.push(artifact);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    fn find<'a>(cmp: &'a TreeComparison, path: &str) -> &'a FileComparison {
        cmp.files.iter().find(|f| f.path == path).unwrap()
    }

    #[test]
    fn hello_world_scenario() {
        let modified = tree(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        let expected = tree(&[("a.txt", b"hello"), ("b.txt", b"worlds"), ("c.txt", b"new")]);

        let cmp = compare_trees(modified.path(), expected.path()).unwrap();
        assert_eq!(find(&cmp, "a.txt").status, FileStatus::Matched);
        assert_eq!(find(&cmp, "a.txt").similarity, Some(1.0));

        let b = find(&cmp, "b.txt");
        assert_eq!(b.status, FileStatus::Changed);
        let b_score = b.similarity.unwrap();
        assert!(b_score > 0.0 && b_score < 1.0);

        assert_eq!(find(&cmp, "c.txt").status, FileStatus::Removed);
        assert_eq!(find(&cmp, "c.txt").similarity, Some(0.0));

        let aggregate = cmp.aggregate();
        assert!(aggregate > 0.0 && aggregate < 1.0);
        assert!(aggregate < 0.9);
        assert!((aggregate - (1.0 + 5.0 / 6.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn identical_trees_score_one() {
        let a = tree(&[("src/lib.rs", b"fn main() {}\n"), ("README", b"x\n")]);
        let b = tree(&[("src/lib.rs", b"fn main() {}\n"), ("README", b"x\n")]);
        let cmp = compare_trees(a.path(), b.path()).unwrap();
        assert_eq!(cmp.aggregate(), 1.0);
        assert_eq!(cmp.count(FileStatus::Matched), 2);
    }

    #[test]
    fn empty_trees_score_one() {
        let a = tree(&[]);
        let b = tree(&[]);
        assert_eq!(compare_trees(a.path(), b.path()).unwrap().aggregate(), 1.0);
    }

    #[test]
    fn git_directory_is_ignored() {
        let a = tree(&[("f", b"1"), (".git/HEAD", b"ref: a")]);
        let b = tree(&[("f", b"1"), (".git/HEAD", b"ref: b"), (".git/config", b"")]);
        let cmp = compare_trees(a.path(), b.path()).unwrap();
        assert_eq!(cmp.files.len(), 1);
    }

    #[test]
    fn binary_changes_are_not_scored() {
        let a = tree(&[("img.bin", b"\x00\x01\x02"), ("t.txt", b"same")]);
        let b = tree(&[("img.bin", b"\x00\x01\x03"), ("t.txt", b"same")]);
        let cmp = compare_trees(a.path(), b.path()).unwrap();
        let bin = find(&cmp, "img.bin");
        assert_eq!(bin.status, FileStatus::BinaryChanged);
        assert_eq!(bin.similarity, None);
        assert_eq!(cmp.aggregate(), 1.0);
        assert_eq!(cmp.scored(), 1);
    }

    #[test]
    fn added_files_count_lines() {
        let a = tree(&[("new.rs", b"a\nb\nc\n")]);
        let b = tree(&[]);
        let cmp = compare_trees(a.path(), b.path()).unwrap();
        let added = find(&cmp, "new.rs");
        assert_eq!(added.status, FileStatus::Added);
        assert_eq!(added.lines_added, 3);
        assert_eq!(cmp.aggregate(), 0.0);
    }

    #[test]
    fn rendered_diff_covers_unmatched_files() {
        let modified = tree(&[("a.txt", b"hello\n"), ("b.txt", b"world\n")]);
        let expected = tree(&[("a.txt", b"hello\n"), ("b.txt", b"worlds\n"), ("c.txt", b"new\n")]);
        let cmp = compare_trees(modified.path(), expected.path()).unwrap();
        let patch = render_diff(modified.path(), expected.path(), &cmp).unwrap();
        assert!(!patch.contains("a.txt"));
        assert!(patch.contains("--- expected/b.txt\n+++ modified/b.txt\n"));
        assert!(patch.contains("-worlds\n+world\n"));
        assert!(patch.contains("-new\n"));
    }

    #[test]
    fn threshold_is_validated() {
        assert!(ExpectedDiffEvaluator::from_config("expected-diff", &json!({"threshold": 1.5})).is_err());
        let evaluator =
            ExpectedDiffEvaluator::from_config("expected-diff", &json!({})).unwrap();
        assert_eq!(evaluator.config.threshold, DEFAULT_THRESHOLD);
        assert!(evaluator.requires_expected_reference());
    }
}
