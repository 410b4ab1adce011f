use crate::services::local_shell::LocalShell;
use crate::services::mysql::MysqlPort;
use dbchain_core::models::{Access, Server};
use dbchain_core::ports::{Connector, DatabaseBackupPort, ExecutionContext, TunnelPort};
use dbchain_core::{BackupError, Result};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// MySQL client tools, run locally for direct access or over the tunnel.
pub struct MysqlConnector<T> {
    tunnel: T,
}

impl<T: TunnelPort> MysqlConnector<T> {
    pub fn new(tunnel: T) -> Self {
        Self { tunnel }
    }
}

impl<T: TunnelPort> Connector for MysqlConnector<T> {
    fn probe(&self, server: &Server, timeout: Duration) -> bool {
        let endpoint = (server.database.host.as_str(), server.database.port);
        let addrs: Vec<SocketAddr> = match endpoint.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                tracing::debug!(server = %server.name, error = %e, "Probe could not resolve database host");
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
    }

    fn connect(&self, server: &Server, access: Access) -> Result<Box<dyn DatabaseBackupPort>> {
        let exec: Box<dyn ExecutionContext> = match access {
            Access::Direct => Box::new(LocalShell),
            Access::Tunneled => self.tunnel.open(server)?,
        };
        let port = MysqlPort::new(server, exec);
        port.ping().map_err(|e| BackupError::Connectivity {
            server: server.name.clone(),
            reason: format!("{access} database check failed: {e}"),
        })?;
        Ok(Box::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    struct NoTunnel;

    impl TunnelPort for NoTunnel {
        fn open(&self, server: &Server) -> Result<Box<dyn ExecutionContext>> {
            Err(BackupError::Connectivity {
                server: server.name.clone(),
                reason: "tunnel disabled".into(),
            })
        }
    }

    fn server(host: &str, port: u16) -> Server {
        let config = dbchain_core::Config::parse(&format!(
            r#"
[[servers]]
name = "db1"
connection = "local"
[servers.database]
host = "{host}"
port = {port}
user = "backup"
"#
        ))
        .unwrap();
        config.servers[0].clone()
    }

    #[test]
    fn test_probe_reachable_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().port();
        let connector = MysqlConnector::new(NoTunnel);
        assert!(connector.probe(&server("127.0.0.1", open), Duration::from_secs(1)));

        drop(listener);
        assert!(!connector.probe(&server("127.0.0.1", open), Duration::from_secs(1)));
    }

    #[test]
    fn test_tunnel_errors_pass_through() {
        let connector = MysqlConnector::new(NoTunnel);
        let err = connector
            .connect(&server("127.0.0.1", 3306), Access::Tunneled)
            .err()
            .unwrap();
        assert!(err.to_string().contains("tunnel disabled"));
    }
}
