//! Configuration file management for yardstick.
//!
//! Provides a TOML-based config file at `~/.config/yardstick/config.toml` and
//! a resolution chain for the workspace root: CLI flag > env var > config
//! file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the workspace root.
pub const WORKSPACE_ROOT_ENV_VAR: &str = "YARDSTICK_WORKSPACE_ROOT";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Directory new run workspaces are created under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the yardstick config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/yardstick` or
/// `~/.config/yardstick`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("yardstick");
    }
    home_dir().join(".config").join("yardstick")
}

/// Return the path to the yardstick config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default workspace root: `$XDG_DATA_HOME/yardstick/workspaces` or
/// `~/.local/share/yardstick/workspaces`.
pub fn default_workspace_root() -> PathBuf {
    let data = match std::env::var("XDG_DATA_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => home_dir().join(".local").join("share"),
    };
    data.join("yardstick").join("workspaces")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct YardstickConfig {
    pub workspace_root: PathBuf,
}

impl YardstickConfig {
    /// Resolve using the chain: `cli_root` > `YARDSTICK_WORKSPACE_ROOT` >
    /// `workspace_root` in the config file > [`default_workspace_root`].
    ///
    /// A config file that exists but cannot be parsed is an error; a missing
    /// one is not.
    pub fn resolve(cli_root: Option<&Path>) -> Result<Self> {
        let path = config_path();
        let file_config = if path.exists() {
            Some(load_config_from(&path)?)
        } else {
            None
        };

        let workspace_root = if let Some(root) = cli_root {
            root.to_path_buf()
        } else if let Some(root) = std::env::var_os(WORKSPACE_ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            PathBuf::from(root)
        } else if let Some(root) = file_config.and_then(|c| c.workspace_root) {
            root
        } else {
            default_workspace_root()
        };

        Ok(Self { workspace_root })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
