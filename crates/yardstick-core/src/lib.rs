//! Core of the yardstick evaluation harness.
//!
//! A run clones a repository into an isolated workspace, lets a coding agent
//! work on a task there, then scores the result with a set of evaluators and
//! writes `results.json`. [`orchestrator::Orchestrator`] is the entry point.

pub mod agent;
pub mod config;
pub mod diff;
pub mod evaluator;
pub mod orchestrator;
pub mod process;
pub mod results;
pub mod vcs;
pub mod workspace;
