pub mod connector;
pub mod local_shell;
pub mod mysql;
pub mod ssh_tunnel;
