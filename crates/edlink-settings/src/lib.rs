//! # edlink-settings
//!
//! Configuration management with layered sources for the edlink client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EdlinkSettings::default()`]
//! 2. **User file**: `~/.edlink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `EDLINK_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use edlink_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("realtime port: {}", settings.realtime.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{EdlinkSettings, LoggingSettings, RealtimeSettings};
