use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::fileset::{EntryKind, WalkFailure, resolve_tree};
use crate::progress::ProgressTracker;
use crate::spec::{DestinationSpec, Protocol};
use crate::transfer::{
    TransferOptions, TransferOutcome, TransferStatus, cancellable, open_session,
};
use crate::transport::{Connector, Session, join_remote};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub destination: DestinationSpec,
    pub local_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirFailure {
    pub remote: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorReport {
    pub destination: String,
    pub location: String,
    pub remote_root: String,
    pub dirs_created: Vec<String>,
    pub dir_failures: Vec<DirFailure>,
    pub files: Vec<TransferOutcome>,
    pub walk_failures: Vec<WalkFailure>,
}

impl MirrorReport {
    pub fn is_complete(&self) -> bool {
        self.dir_failures.is_empty()
            && self.walk_failures.is_empty()
            && self.files.iter().all(|f| f.status.is_success())
    }
}

/// Remote name of `relative` below the mirrored root directory.
fn remote_relative(root_name: &str, relative: &Path) -> String {
    let rel = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    match (root_name.is_empty(), rel.is_empty()) {
        (true, _) => rel,
        (false, true) => root_name.to_string(),
        (false, false) => format!("{root_name}/{rel}"),
    }
}

pub async fn mirror(connector: &dyn Connector, request: &MirrorRequest) -> Result<MirrorReport> {
    mirror_with(connector, request, TransferOptions::default()).await
}

/// Recreates `local_root` below the destination's remote path over SFTP.
///
/// Only opening the session and preparing the remote root are fatal. A
/// directory that cannot be created or a file that fails to upload is recorded
/// and the walk goes on.
pub async fn mirror_with(
    connector: &dyn Connector,
    request: &MirrorRequest,
    options: TransferOptions<'_>,
) -> Result<MirrorReport> {
    let destination = &request.destination;
    if destination.protocol != Protocol::Sftp {
        return Err(Error::InvalidConfig {
            message: format!(
                "directory mirroring needs an sftp destination, got {}",
                destination.protocol
            ),
        });
    }

    let walk = resolve_tree(&request.local_root)?;
    let root_name = std::path::absolute(&request.local_root)?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let started = Instant::now();
    let mut session = open_session(connector, destination, &options).await?;
    let mut report = MirrorReport {
        destination: destination.label(),
        remote_root: join_remote(&destination.remote_path, &root_name),
        walk_failures: walk.failures,
        ..MirrorReport::default()
    };

    let result = mirror_entries(
        session.as_mut(),
        destination,
        &root_name,
        &walk.entries,
        &options,
        &mut report,
    )
    .await;
    session.close().await;

    result?;
    debug!(
        event = "mirror.finish",
        destination = %report.destination,
        dirs_created = report.dirs_created.len(),
        dir_failures = report.dir_failures.len(),
        files = report.files.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "mirror.finish"
    );
    Ok(report)
}

async fn mirror_entries(
    session: &mut dyn Session,
    destination: &DestinationSpec,
    root_name: &str,
    entries: &[crate::fileset::TreeEntry],
    options: &TransferOptions<'_>,
    report: &mut MirrorReport,
) -> Result<()> {
    report.location =
        cancellable(options.cancel, session.ensure_remote_path(&destination.remote_path)).await?;

    let mut tracker = ProgressTracker::new(report.destination.clone(), options.progress);
    for entry in entries {
        let relative = remote_relative(root_name, &entry.relative);
        if relative.is_empty() {
            continue;
        }
        let remote = join_remote(&destination.remote_path, &relative);

        match entry.kind {
            EntryKind::Dir => {
                match cancellable(options.cancel, session.make_dir(&remote)).await {
                    Ok(()) => {
                        debug!(event = "mirror.mkdir", remote = %remote, "mirror.mkdir");
                        report.dirs_created.push(remote);
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(
                            event = "mirror.mkdir_failed",
                            remote = %remote,
                            error = %e,
                            "mirror.mkdir_failed"
                        );
                        report.dir_failures.push(DirFailure {
                            remote,
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            EntryKind::File => {
                let size = match tokio::fs::metadata(&entry.path).await {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        let err = Error::InvalidPath {
                            path: entry.path.clone(),
                            message: e.to_string(),
                        };
                        report.files.push(TransferOutcome {
                            file: entry.path.clone(),
                            remote,
                            bytes_sent: 0,
                            status: TransferStatus::failed(&err),
                        });
                        continue;
                    }
                };
                tracker.begin_file(&relative, size);
                let put = session.put_file(&entry.path, &relative, &mut tracker);
                let outcome = match cancellable(options.cancel, put).await {
                    Ok(sent) => {
                        tracker.finish();
                        TransferOutcome {
                            file: entry.path.clone(),
                            remote,
                            bytes_sent: sent,
                            status: TransferStatus::Success,
                        }
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(
                            event = "mirror.file_failed",
                            path = %entry.path.display(),
                            error = %e,
                            "mirror.file_failed"
                        );
                        TransferOutcome {
                            file: entry.path.clone(),
                            remote,
                            bytes_sent: tracker.state().transferred_bytes,
                            status: TransferStatus::failed(&e),
                        }
                    }
                };
                report.files.push(outcome);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_relative_prefixes_root_name() {
        assert_eq!(remote_relative("site", Path::new("")), "site");
        assert_eq!(remote_relative("site", Path::new("css/a.css")), "site/css/a.css");
        assert_eq!(remote_relative("", Path::new("css")), "css");
    }

    #[tokio::test]
    async fn non_sftp_destination_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let connector = crate::transport::InMemoryConnector::new();
        let request = MirrorRequest {
            destination: DestinationSpec::parse("scp:h1:/r/:u:p").unwrap(),
            local_root: dir.path().to_path_buf(),
        };
        let err = mirror(&connector, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(connector.log().opens.is_empty());
    }
}
