//! Repowiki Core Library
//!
//! This crate provides the foundational utilities shared by every Repowiki crate:
//! - Error handling (`AppError`, `AppResult`, schema version records)
//! - Logging infrastructure
//! - Configuration management

pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult, SchemaMismatch, SchemaVersion};
