use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use super::ssh::{self, SshAuth, SshConnection};
use super::{BoxFuture, Session, credentials_of, join_remote};
use crate::config::SshSettings;
use crate::progress::{ProgressShape, ProgressTracker};
use crate::spec::DestinationSpec;
use crate::{Error, Result};

const WRITE_BUF_BYTES: usize = 32 * 1024;

pub(crate) struct SftpSession {
    conn: Option<SshConnection>,
    host: String,
    base: String,
}

impl SftpSession {
    pub(crate) async fn open(
        destination: &DestinationSpec,
        settings: &SshSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let auth = SshAuth::resolve(credentials_of(destination)?, settings);
        let conn = ssh::connect_async(&destination.host, settings.port, auth, timeout).await?;
        Ok(Self {
            conn: Some(conn),
            host: destination.host.clone(),
            base: String::new(),
        })
    }

    fn conn(&self) -> Result<&SshConnection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::connection(&self.host, "sftp session already closed"))
    }
}

impl Session for SftpSession {
    fn progress_shape(&self) -> ProgressShape {
        ProgressShape::Cumulative
    }

    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if path.is_empty() {
                self.base.clear();
                return Ok(".".to_string());
            }
            let owned = path.to_string();
            let resolved = self
                .conn()?
                .spawn(move |session| ensure_dir_all(session, &owned))
                .await?;
            self.base = path.to_string();
            Ok(resolved)
        })
    }

    fn make_dir<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let owned = path.to_string();
            self.conn()?
                .spawn(move |session| {
                    let sftp = session
                        .sftp()
                        .map_err(|e| Error::remote_path(&owned, format!("sftp subsystem: {e}")))?;
                    sftp.mkdir(Path::new(&owned), 0o755)
                        .map_err(|e| Error::remote_path(&owned, e.message().to_string()))
                })
                .await
        })
    }

    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let remote = join_remote(&self.base, remote_name);
            let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
            let local_owned = local.to_path_buf();
            let remote_owned = remote.clone();
            let task = self
                .conn()?
                .spawn(move |session| upload(session, &local_owned, &remote_owned, &tx));

            while let Some(sent) = rx.recv().await {
                progress.cumulative(sent);
            }
            task.await
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(conn) = self.conn.take() {
                let _ = tokio::task::spawn_blocking(move || conn.close()).await;
            }
        })
    }
}

fn ensure_dir_all(session: &ssh2::Session, path: &str) -> Result<String> {
    let sftp = session
        .sftp()
        .map_err(|e| Error::remote_path(path, format!("sftp subsystem: {e}")))?;

    match sftp.stat(Path::new(path)) {
        Ok(stat) if stat.is_dir() => {}
        Ok(_) => return Err(Error::remote_path(path, "exists and is not a directory")),
        Err(_) => {
            let mut current = PathBuf::new();
            for component in Path::new(path).components() {
                current.push(component);
                if sftp.stat(&current).is_ok() {
                    continue;
                }
                sftp.mkdir(&current, 0o755)
                    .map_err(|e| Error::remote_path(path, format!("mkdir {current:?}: {e}")))?;
            }
        }
    }

    let resolved = sftp
        .realpath(Path::new(path))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string());
    Ok(resolved)
}

fn upload(
    session: &ssh2::Session,
    local: &Path,
    remote: &str,
    progress: &mpsc::UnboundedSender<u64>,
) -> Result<u64> {
    let sftp = session
        .sftp()
        .map_err(|e| Error::transfer(remote, format!("sftp subsystem: {e}")))?;
    let mut src = std::fs::File::open(local)
        .map_err(|e| Error::transfer(remote, format!("open {}: {e}", local.display())))?;
    let mut dst = sftp
        .create(Path::new(remote))
        .map_err(|e| Error::transfer(remote, format!("create: {e}")))?;

    let mut buf = vec![0u8; WRITE_BUF_BYTES];
    let mut sent = 0u64;
    loop {
        let n = src
            .read(&mut buf)
            .map_err(|e| Error::transfer(remote, format!("read local: {e}")))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| Error::transfer(remote, format!("write: {e}")))?;
        sent += n as u64;
        let _ = progress.send(sent);
    }
    dst.flush()
        .map_err(|e| Error::transfer(remote, format!("flush: {e}")))?;
    Ok(sent)
}
