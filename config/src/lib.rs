//! Load a project `.env` and apply it to the process environment with
//! priority: **existing env > .env**.
//!
//! The orchestrator reads all of its settings from `MCP_*` variables
//! (`mcp::OrchestratorConfig::from_env`), so this crate's only job is to get
//! a development `.env` into the environment without clobbering anything the
//! operator set explicitly.

mod dotenv;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads `.env` (from `override_dir`, or the current directory) and sets
/// each variable that is **not** already present in the process environment.
///
/// Returns the keys that were applied, in no particular order.
pub fn load_and_apply(override_dir: Option<&Path>) -> Result<Vec<String>, LoadError> {
    let map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;
    let mut applied = Vec::new();
    for (key, value) in map {
        if std::env::var_os(&key).is_some() {
            continue; // existing env wins
        }
        std::env::set_var(&key, value);
        applied.push(key);
    }
    Ok(applied)
}
