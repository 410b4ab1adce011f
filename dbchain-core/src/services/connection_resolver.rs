use crate::models::{Access, ConnectionMode, Server};
use crate::ports::{Connector, DatabaseBackupPort};
use crate::utils::errors::{BackupError, Result};
use std::time::Duration;

/// Picks direct or tunneled access for a server, once per run.
pub struct ConnectionResolver<'a> {
    connector: &'a dyn Connector,
    probe_timeout: Duration,
}

impl<'a> ConnectionResolver<'a> {
    pub fn new(connector: &'a dyn Connector, probe_timeout: Duration) -> Self {
        Self {
            connector,
            probe_timeout,
        }
    }

    pub fn resolve(&self, server: &Server) -> Access {
        if server.force_tunnel {
            return Access::Tunneled;
        }
        match server.connection {
            ConnectionMode::Local => Access::Direct,
            ConnectionMode::Remote => Access::Tunneled,
            ConnectionMode::Auto => {
                if self.connector.probe(server, self.probe_timeout) {
                    tracing::debug!(server = %server.name, "Direct probe succeeded");
                    Access::Direct
                } else {
                    tracing::info!(
                        server = %server.name,
                        timeout_secs = self.probe_timeout.as_secs(),
                        "Direct probe failed, using tunnel"
                    );
                    Access::Tunneled
                }
            }
        }
    }

    /// Resolve and connect. In auto mode a failed connection is retried
    /// once over the other access method.
    pub fn connect(&self, server: &Server) -> Result<(Access, Box<dyn DatabaseBackupPort>)> {
        let access = self.resolve(server);
        let first_error = match self.connector.connect(server, access) {
            Ok(port) => return Ok((access, port)),
            Err(e) => e,
        };

        let may_fall_back = server.connection == ConnectionMode::Auto && !server.force_tunnel;
        if !may_fall_back {
            return Err(connectivity(server, access, first_error));
        }

        let fallback = access.other();
        tracing::warn!(
            server = %server.name,
            failed = %access,
            fallback = %fallback,
            error = %first_error,
            "Connection failed, retrying over fallback access"
        );
        match self.connector.connect(server, fallback) {
            Ok(port) => Ok((fallback, port)),
            Err(e) => Err(connectivity(server, fallback, e)),
        }
    }
}

fn connectivity(server: &Server, access: Access, err: BackupError) -> BackupError {
    match err {
        BackupError::Connectivity { .. } => err,
        other => BackupError::Connectivity {
            server: server.name.clone(),
            reason: format!("{access} connection failed: {other}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;
    use std::path::PathBuf;

    fn server(mode: ConnectionMode) -> Server {
        let mut server = Server::for_tests("db1", PathBuf::from("/tmp/unused"));
        server.connection = mode;
        server
    }

    #[test]
    fn test_explicit_modes_skip_probe() {
        let connector = FakeConnector::new();
        let resolver = ConnectionResolver::new(&connector, Duration::from_secs(1));

        assert_eq!(resolver.resolve(&server(ConnectionMode::Local)), Access::Direct);
        assert_eq!(resolver.resolve(&server(ConnectionMode::Remote)), Access::Tunneled);
        assert_eq!(connector.probe_count(), 0);
    }

    #[test]
    fn test_force_tunnel_wins() {
        let connector = FakeConnector::new();
        let resolver = ConnectionResolver::new(&connector, Duration::from_secs(1));
        let mut legacy = server(ConnectionMode::Local);
        legacy.force_tunnel = true;
        assert_eq!(resolver.resolve(&legacy), Access::Tunneled);
    }

    #[test]
    fn test_auto_follows_probe() {
        let reachable = FakeConnector::new();
        let resolver = ConnectionResolver::new(&reachable, Duration::from_secs(1));
        assert_eq!(resolver.resolve(&server(ConnectionMode::Auto)), Access::Direct);

        let unreachable = FakeConnector::new().with_probe(false);
        let resolver = ConnectionResolver::new(&unreachable, Duration::from_secs(1));
        assert_eq!(resolver.resolve(&server(ConnectionMode::Auto)), Access::Tunneled);
    }

    #[test]
    fn test_auto_falls_back_once() {
        let connector = FakeConnector::new().failing_access(Access::Direct);
        let resolver = ConnectionResolver::new(&connector, Duration::from_secs(1));
        let (access, _port) = resolver.connect(&server(ConnectionMode::Auto)).unwrap();
        assert_eq!(access, Access::Tunneled);
        assert_eq!(connector.connect_attempts(), vec![Access::Direct, Access::Tunneled]);
    }

    #[test]
    fn test_explicit_mode_does_not_fall_back() {
        let connector = FakeConnector::new().failing_access(Access::Direct);
        let resolver = ConnectionResolver::new(&connector, Duration::from_secs(1));
        let err = resolver.connect(&server(ConnectionMode::Local)).err().unwrap();
        assert!(matches!(err, BackupError::Connectivity { .. }));
        assert_eq!(connector.connect_attempts(), vec![Access::Direct]);
    }

    #[test]
    fn test_both_methods_failing_is_connectivity_error() {
        let connector = FakeConnector::new()
            .failing_access(Access::Direct)
            .failing_access(Access::Tunneled);
        let resolver = ConnectionResolver::new(&connector, Duration::from_secs(1));
        let err = resolver.connect(&server(ConnectionMode::Auto)).err().unwrap();
        assert!(matches!(err, BackupError::Connectivity { .. }));
    }
}
