use std::future::Future;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::SshSettings;
use crate::spec::Credentials;
use crate::{Error, Result};

/// How a session authenticates, in the order password, key file, agent.
#[derive(Clone)]
pub(crate) enum SshAuth {
    Password(Credentials),
    KeyFile { username: String, path: PathBuf },
    Agent { username: String },
}

impl SshAuth {
    pub(crate) fn resolve(credentials: &Credentials, settings: &SshSettings) -> Self {
        if credentials.has_secret() {
            return Self::Password(credentials.clone());
        }
        match &settings.identity_file {
            Some(path) => Self::KeyFile {
                username: credentials.username.clone(),
                path: path.clone(),
            },
            None => Self::Agent {
                username: credentials.username.clone(),
            },
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFile { .. } => "publickey",
            Self::Agent { .. } => "agent",
        }
    }
}

/// An authenticated SSH transport shared by the SFTP, SCP and command paths.
///
/// All methods block; async callers run them on the blocking pool.
pub(crate) struct SshConnection {
    session: ssh2::Session,
    socket: TcpStream,
    host: String,
    busy: Arc<AtomicBool>,
}

impl SshConnection {
    pub(crate) fn connect(host: &str, port: u16, auth: &SshAuth, timeout: Duration) -> Result<Self> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(host, format!("resolve failed: {e}")))?;

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = tcp.ok_or_else(|| {
            let message = match last_err {
                Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    format!("timed out after {}s", timeout.as_secs())
                }
                Some(e) => e.to_string(),
                None => "host resolved to no addresses".to_string(),
            };
            Error::connection(host, message)
        })?;
        let socket = tcp
            .try_clone()
            .map_err(|e| Error::connection(host, format!("socket clone failed: {e}")))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| Error::connection(host, format!("ssh session init failed: {e}")))?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::connection(host, format!("ssh handshake failed: {e}")))?;

        if let Some(hash) = session.host_key_hash(ssh2::HashType::Sha256) {
            tracing::debug!(
                event = "ssh.host_key_accepted",
                host,
                sha256 = %hex::encode(hash),
                "ssh.host_key_accepted"
            );
        }

        let authed = match auth {
            SshAuth::Password(c) => session.userauth_password(&c.username, c.secret()),
            SshAuth::KeyFile { username, path } => {
                session.userauth_pubkey_file(username, None, path, None)
            }
            SshAuth::Agent { username } => session.userauth_agent(username),
        };
        authed.map_err(|e| {
            Error::authentication(host, format!("{} auth rejected: {}", auth.method(), e.message()))
        })?;
        if !session.authenticated() {
            return Err(Error::authentication(
                host,
                format!("{} auth did not complete", auth.method()),
            ));
        }
        session.set_timeout(0);

        tracing::debug!(event = "ssh.connected", host, method = auth.method(), "ssh.connected");
        Ok(Self {
            session,
            socket,
            host: host.to_string(),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn session(&self) -> &ssh2::Session {
        &self.session
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    /// Clone for a blocking task; the guard marks the connection busy until dropped.
    fn lease(&self) -> (ssh2::Session, BusyGuard) {
        self.busy.store(true, Ordering::SeqCst);
        (
            self.session.clone(),
            BusyGuard {
                busy: self.busy.clone(),
            },
        )
    }

    /// Runs `f` on the blocking pool against a clone of the session.
    ///
    /// The task is spawned immediately, before the returned future is polled,
    /// so callers can drain progress channels while it runs.
    pub(crate) fn spawn<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send + use<T, F>
    where
        F: FnOnce(&ssh2::Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (session, guard) = self.lease();
        let host = self.host.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&session)
        });
        async move {
            handle
                .await
                .map_err(|e| Error::connection(&host, format!("ssh task failed: {e}")))?
        }
    }

    /// Ends the connection. A busy connection (an abandoned blocking call) only
    /// gets its socket shut down, which makes the blocked call return.
    pub(crate) fn close(&self) {
        if !self.busy.load(Ordering::SeqCst) {
            let _ = self.session.disconnect(None, "closing", None);
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        tracing::debug!(event = "ssh.closed", host = %self.host, "ssh.closed");
    }
}

pub(crate) struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Opens an [`SshConnection`] on the blocking pool.
pub(crate) async fn connect_async(
    host: &str,
    port: u16,
    auth: SshAuth,
    timeout: Duration,
) -> Result<SshConnection> {
    let owned_host = host.to_string();
    tokio::task::spawn_blocking(move || SshConnection::connect(&owned_host, port, &auth, timeout))
        .await
        .map_err(|e| Error::connection(host, format!("connect task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_wins_over_key_file() {
        let settings = SshSettings {
            port: 22,
            identity_file: Some(PathBuf::from("/k")),
        };
        let auth = SshAuth::resolve(&Credentials::new("u", "p"), &settings);
        assert_eq!(auth.method(), "password");

        let auth = SshAuth::resolve(&Credentials::new("u", ""), &settings);
        assert!(matches!(auth, SshAuth::KeyFile { ref path, .. } if path == &PathBuf::from("/k")));

        let auth = SshAuth::resolve(&Credentials::new("u", ""), &SshSettings::default());
        assert_eq!(auth.method(), "agent");
    }

    #[test]
    fn unresolvable_host_is_connection_error() {
        let auth = SshAuth::Agent {
            username: "u".to_string(),
        };
        let err = SshConnection::connect("host.invalid", 22, &auth, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
