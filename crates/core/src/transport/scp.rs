use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use super::ssh::{self, SshAuth, SshConnection};
use super::{BoxFuture, Session, credentials_of, file_name_of, join_remote};
use crate::config::SshSettings;
use crate::progress::{ProgressShape, ProgressTracker};
use crate::spec::DestinationSpec;
use crate::{Error, Result};

const CHUNK_BYTES: usize = 32 * 1024;

/// `(file name, transferred, total)` as the copy loop reports it.
type ScpProgress = (String, u64, u64);

pub(crate) struct ScpSession {
    conn: Option<SshConnection>,
    host: String,
    base: String,
}

impl ScpSession {
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
            .ok_or_else(|| Error::connection(&self.host, "scp session already closed"))
    }
}

impl Session for ScpSession {
    fn progress_shape(&self) -> ProgressShape {
        ProgressShape::Cumulative
    }

    /// SCP has no directory step; the path is only remembered as upload base.
    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.conn()?;
            self.base = path.to_string();
            Ok(if path.is_empty() { "." } else { path }.to_string())
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
            let name = file_name_of(local)?.to_string();
            let (tx, mut rx) = mpsc::unbounded_channel::<ScpProgress>();
            let local_owned = local.to_path_buf();
            let task = self
                .conn()?
                .spawn(move |session| copy(session, &local_owned, &remote, &name, &tx));

            while let Some((_name, transferred, _total)) = rx.recv().await {
                progress.cumulative(transferred);
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

fn copy(
    session: &ssh2::Session,
    local: &Path,
    remote: &str,
    name: &str,
    progress: &mpsc::UnboundedSender<ScpProgress>,
) -> Result<u64> {
    let src = std::fs::File::open(local)
        .map_err(|e| Error::transfer(remote, format!("open {}: {e}", local.display())))?;
    let total = src
        .metadata()
        .map_err(|e| Error::transfer(remote, format!("stat {}: {e}", local.display())))?
        .len();

    let mut channel = session
        .scp_send(Path::new(remote), 0o644, total, None)
        .map_err(|e| Error::transfer(remote, format!("scp_send: {e}")))?;

    let sent = send_exact(src, &mut channel, total, |sent| {
        let _ = progress.send((name.to_string(), sent, total));
    })
    .map_err(|e| Error::transfer(remote, e.to_string()))?;

    channel
        .send_eof()
        .and_then(|()| channel.wait_eof())
        .and_then(|()| channel.close())
        .and_then(|()| channel.wait_close())
        .map_err(|e| Error::transfer(remote, format!("scp finish: {e}")))?;
    Ok(sent)
}

/// Streams exactly `total` bytes, the length announced in the SCP header.
/// Bytes appended after the header was sent are left out; a file that
/// shrank is an error rather than a short copy the server would wait on.
fn send_exact<R: Read, W: Write>(
    src: R,
    dst: &mut W,
    total: u64,
    mut on_progress: impl FnMut(u64),
) -> std::io::Result<u64> {
    let mut src = src.take(total);
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut sent = 0u64;
    loop {
        let n = src
            .read(&mut buf)
            .map_err(|e| std::io::Error::new(e.kind(), format!("read local: {e}")))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| std::io::Error::new(e.kind(), format!("write: {e}")))?;
        sent += n as u64;
        on_progress(sent);
    }
    if sent < total {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("local file shrank during upload: sent {sent} of {total} bytes"),
        ));
    }
    Ok(sent)
}
