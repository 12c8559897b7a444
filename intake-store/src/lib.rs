//! intake-store - persistence for the registration service
//!
//! A redb-backed cache for the small configuration documents the wizard
//! pages load, and a SQLite log of verification and submission attempts.

pub mod attempt_log;
pub mod config_cache;
pub mod error;

pub use attempt_log::{AttemptEntry, AttemptEvent, AttemptLog, AttemptOutcome};
pub use config_cache::{CachedConfig, ConfigCache};
pub use error::{Result, StoreError};
