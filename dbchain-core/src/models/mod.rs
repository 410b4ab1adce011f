pub mod artifact;
pub mod chain_marker;
pub mod policy;
pub mod server;

pub use artifact::{BackupArtifact, BackupKind};
pub use chain_marker::ChainMarker;
pub use policy::{BackupSetSelection, RetentionPolicy, ScheduleRule, SelectionMode};
pub use server::{Access, ConnectionMode, Server};
