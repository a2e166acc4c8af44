//! # scribe-settings
//!
//! Configuration with layered sources for the scribe ASR server.
//!
//! Settings are resolved from four layers (lowest to highest priority):
//! 1. **Compiled defaults**: [`ScribeSettings::default()`]
//! 2. **Settings file**: `~/.scribe/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SCRIBE_*` overrides
//! 4. **Command-line flags**: applied by the binary after loading
//!
//! The resolved value is validated once with [`ScribeSettings::validate`]
//! and never mutated after the service starts.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_env_overrides_from, deep_merge, load_settings_from_path, parse_bool,
    settings_path,
};
pub use types::*;
