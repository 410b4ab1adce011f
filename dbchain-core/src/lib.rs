//! dbchain core library
//!
//! Full + incremental backup chains for MySQL-compatible servers: deciding
//! what to dump, keeping chain markers, restore planning and retention.

pub mod config;
pub mod db;
pub mod models;
pub mod ports;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, ChainIntegrityError, Result};
