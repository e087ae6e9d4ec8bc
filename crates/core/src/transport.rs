use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

use crate::config::Settings;
use crate::progress::{ProgressShape, ProgressTracker};
use crate::spec::{DestinationSpec, Protocol};
use crate::{Error, Result};

mod ftp;
mod memory;
mod s3;
mod scp;
mod sftp;
mod smb;
mod ssh;

pub use memory::{InMemoryConnector, RecordedPut, TransportLog};
pub(crate) use ssh::{SshAuth, SshConnection, connect_async};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Security-relevant facts about a destination the operator should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// Control channel is encrypted, file contents travel in the clear.
    PlaintextDataChannel,
    /// Existing remote files with the same name are replaced.
    OverwritesExisting,
}

impl Notice {
    pub fn message(self) -> &'static str {
        match self {
            Self::PlaintextDataChannel => {
                "credentials are sent over an encrypted control channel, file data is sent unencrypted"
            }
            Self::OverwritesExisting => {
                "files on the remote share with the same name will be overwritten"
            }
        }
    }
}

/// An open, authenticated connection to one destination.
///
/// A session is owned by exactly one transfer at a time. `close` is idempotent
/// and must be called on every path.
pub trait Session: Send {
    fn progress_shape(&self) -> ProgressShape;

    fn notices(&self) -> Vec<Notice> {
        Vec::new()
    }

    /// Prepares `path` as the base for later uploads and returns the
    /// resolved location for display.
    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>>;

    fn make_dir<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        let shape = self.progress_shape();
        Box::pin(async move {
            Err(Error::remote_path(
                path,
                format!("directory creation is not supported ({shape:?} transport)"),
            ))
        })
    }

    /// Uploads `local` as `remote_name`, relative to the ensured path unless
    /// `remote_name` is absolute. Returns the number of bytes sent.
    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait Connector: Send + Sync {
    fn open<'a>(
        &'a self,
        destination: &'a DestinationSpec,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>>;
}

/// Connects to real endpoints, picking the transport by protocol.
pub struct ProtocolConnector {
    settings: Settings,
    http: reqwest::Client,
}

impl ProtocolConnector {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }
}

impl Connector for ProtocolConnector {
    fn open<'a>(
        &'a self,
        destination: &'a DestinationSpec,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>> {
        Box::pin(async move {
            let session: Box<dyn Session> = match destination.protocol {
                Protocol::Ftp => {
                    Box::new(ftp::FtpSession::open(destination, &self.settings.ftp, timeout).await?)
                }
                Protocol::Sftp => Box::new(
                    sftp::SftpSession::open(destination, &self.settings.ssh, timeout).await?,
                ),
                Protocol::Scp => {
                    Box::new(scp::ScpSession::open(destination, &self.settings.ssh, timeout).await?)
                }
                Protocol::Smb => {
                    Box::new(smb::SmbSession::open(destination, &self.settings.smb, timeout).await?)
                }
                Protocol::S3 => Box::new(
                    s3::S3Session::open(destination, &self.settings.s3, self.http.clone()).await?,
                ),
            };
            Ok(session)
        })
    }
}

/// Joins a remote base directory and a file name with `/`.
pub(crate) fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() || name.starts_with('/') {
        return name.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

pub(crate) fn credentials_of<'a>(
    destination: &'a DestinationSpec,
) -> Result<&'a crate::spec::Credentials> {
    destination
        .credentials
        .as_ref()
        .ok_or_else(|| Error::MalformedSpec {
            entry: destination.label(),
            message: format!("{} requires credentials", destination.protocol),
        })
}

pub(crate) fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath {
            path: path.to_path_buf(),
            message: "file name must be UTF-8".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_handles_separators() {
        assert_eq!(join_remote("/remote/", "a.txt"), "/remote/a.txt");
        assert_eq!(join_remote("/remote", "a.txt"), "/remote/a.txt");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
        assert_eq!(join_remote("/remote", "/abs/b.txt"), "/abs/b.txt");
    }

    #[test]
    fn notices_have_operator_text() {
        assert!(Notice::PlaintextDataChannel.message().contains("unencrypted"));
        assert!(Notice::OverwritesExisting.message().contains("overwritten"));
    }
}
