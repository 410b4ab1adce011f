pub mod artifact_store;
pub mod backup_scheduler;
pub mod chain_state;
pub mod connection_resolver;
pub mod orchestrator;
pub mod restore_planner;
pub mod retention;
pub mod run_lock;
