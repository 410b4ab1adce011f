//! Utility modules shared by the core services.

pub mod clock;
pub mod errors;
pub mod logger;

pub use clock::{Clock, SystemClock};
pub use errors::{BackupError, ChainIntegrityError, Result};
