//! Layered configuration for the clause server.
//!
//! 1. Compiled defaults ([`ClauseSettings::default()`])
//! 2. `~/.clause/settings.json` (or an explicit path), deep-merged
//! 3. `CLAUSE_*` environment variables

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
