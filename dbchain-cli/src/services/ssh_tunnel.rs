//! SSH access to servers that cannot be reached directly.

use dbchain_core::models::server::TunnelEndpoint;
use dbchain_core::models::Server;
use dbchain_core::ports::{ExecutionContext, TunnelPort};
use dbchain_core::{BackupError, Result};
use ssh2::{Channel, Session};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct SshTunnel;

fn connectivity(server: &Server, reason: impl std::fmt::Display) -> BackupError {
    BackupError::Connectivity {
        server: server.name.clone(),
        reason: reason.to_string(),
    }
}

fn connect_tcp(tunnel: &TunnelEndpoint, timeout: Duration) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (tunnel.host.as_str(), tunnel.port).to_socket_addrs()?.collect();
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Key first; a configured password is tried once if the key is refused.
fn authenticate(sess: &Session, server: &Server, tunnel: &TunnelEndpoint) -> Result<()> {
    if let Some(key_path) = &tunnel.key_path {
        match sess.userauth_pubkey_file(&tunnel.user, None, key_path, None) {
            Ok(()) => return Ok(()),
            Err(e) if tunnel.password.is_some() => {
                tracing::warn!(
                    server = %server.name,
                    key = %key_path.display(),
                    error = %e,
                    "SSH key authentication failed, falling back to password"
                );
            }
            Err(e) => return Err(connectivity(server, format!("SSH key authentication failed: {e}"))),
        }
    }

    match &tunnel.password {
        Some(password) => sess
            .userauth_password(&tunnel.user, password)
            .map_err(|e| connectivity(server, format!("SSH password authentication failed: {e}"))),
        None => Err(connectivity(server, "no SSH authentication method configured")),
    }
}

impl TunnelPort for SshTunnel {
    fn open(&self, server: &Server) -> Result<Box<dyn ExecutionContext>> {
        let tunnel = server
            .tunnel
            .as_ref()
            .ok_or_else(|| connectivity(server, "no [servers.tunnel] configured"))?;
        let timeout = Duration::from_secs(tunnel.connect_timeout_secs);

        let tcp = connect_tcp(tunnel, timeout)
            .map_err(|e| connectivity(server, format!("SSH connect to {}:{} failed: {e}", tunnel.host, tunnel.port)))?;
        let mut sess = Session::new().map_err(|e| connectivity(server, e))?;
        sess.set_tcp_stream(tcp);
        // Bound the handshake and authentication; dumps run without a timeout.
        sess.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        sess.handshake()
            .map_err(|e| connectivity(server, format!("SSH handshake failed: {e}")))?;

        authenticate(&sess, server, tunnel)?;
        if !sess.authenticated() {
            return Err(connectivity(server, "SSH authentication failed"));
        }
        sess.set_timeout(0);

        tracing::debug!(server = %server.name, host = %tunnel.host, user = %tunnel.user, "SSH session established");
        Ok(Box::new(SshContext { session: sess }))
    }
}

/// Commands run on the far side of an SSH session.
pub struct SshContext {
    session: Session,
}

fn exec_channel(session: &Session, command: &str) -> Result<Channel> {
    let mut channel = session.channel_session().map_err(io::Error::from)?;
    channel.exec(command).map_err(io::Error::from)?;
    Ok(channel)
}

fn finish(mut channel: Channel) -> Result<()> {
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);
    channel.wait_close().map_err(io::Error::from)?;
    let code = channel.exit_status().map_err(io::Error::from)?;
    if code != 0 {
        return Err(BackupError::Command(format!("exit status: {code}: {}", stderr.trim())));
    }
    Ok(())
}

impl ExecutionContext for SshContext {
    fn exec_streaming(&self, command: &str, stdout: &mut dyn Write) -> Result<u64> {
        let mut channel = exec_channel(&self.session, command)?;
        let copied = io::copy(&mut channel, stdout);
        finish(channel)?;
        Ok(copied?)
    }

    fn exec_with_input(&self, command: &str, stdin: &mut dyn Read) -> Result<()> {
        let mut channel = exec_channel(&self.session, command)?;
        let fed = io::copy(stdin, &mut channel);
        channel.send_eof().map_err(io::Error::from)?;
        io::copy(&mut channel, &mut io::sink())?;
        finish(channel)?;
        fed?;
        Ok(())
    }
}
