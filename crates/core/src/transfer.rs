use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::error::ErrorKind;
use crate::fileset::FileSet;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::spec::DestinationSpec;
use crate::transport::{Connector, Notice, Session, file_name_of};
use crate::{Error, Result};

/// One destination plus the local files it receives.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub destination: DestinationSpec,
    pub files: FileSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    Success,
    Failed { kind: ErrorKind, message: String },
}

impl TransferStatus {
    pub fn failed(err: &Error) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub file: PathBuf,
    pub remote: String,
    pub bytes_sent: u64,
    #[serde(flatten)]
    pub status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationReport {
    pub destination: String,
    /// Remote location as the transport resolved it, once a session was opened.
    pub location: Option<String>,
    pub notices: Vec<Notice>,
    pub outcomes: Vec<TransferOutcome>,
    /// Files left untouched after a transport failure or a cancel stopped the destination.
    pub not_attempted: Vec<PathBuf>,
    pub skipped_dirs: Vec<PathBuf>,
    /// The run was cancelled after this destination started uploading.
    pub cancelled: bool,
}

impl DestinationReport {
    fn new(destination: String) -> Self {
        Self {
            destination,
            location: None,
            notices: Vec::new(),
            outcomes: Vec::new(),
            not_attempted: Vec::new(),
            skipped_dirs: Vec::new(),
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.not_attempted.is_empty()
            && self.outcomes.iter().all(|o| o.status.is_success())
    }

    fn failed_outcome(&mut self, file: &Path, remote: &str, bytes_sent: u64, err: &Error) {
        self.outcomes.push(TransferOutcome {
            file: file.to_path_buf(),
            remote: remote.to_string(),
            bytes_sent,
            status: TransferStatus::failed(err),
        });
    }

    pub fn bytes_sent(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes_sent).sum()
    }
}

#[derive(Default, Clone, Copy)]
pub struct TransferOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
    /// Bound on opening a session; defaults to [`DEFAULT_CONNECT_TIMEOUT_SECS`].
    pub connect_timeout: Option<Duration>,
}

impl TransferOptions<'_> {
    pub(crate) fn timeout(&self) -> Duration {
        self.connect_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

/// Races `fut` against the cancellation token, if any.
pub(crate) async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = fut => result,
            }
        }
    }
}

/// Opens a session for `destination`, failing with a timeout condition
/// instead of hanging.
pub(crate) async fn open_session(
    connector: &dyn Connector,
    destination: &DestinationSpec,
    options: &TransferOptions<'_>,
) -> Result<Box<dyn Session>> {
    let timeout = options.timeout();
    let label = destination.label();
    debug!(event = "dest.open", destination = %label, timeout_secs = timeout.as_secs(), "dest.open");

    let open = async {
        tokio::time::timeout(timeout, connector.open(destination, timeout))
            .await
            .map_err(|_| {
                Error::connection(
                    &label,
                    format!("timed out after {}s", timeout.as_secs()),
                )
            })?
    };
    let session = cancellable(options.cancel, open).await?;
    for notice in session.notices() {
        warn!(event = "dest.notice", destination = %label, notice = ?notice, "{}", notice.message());
    }
    Ok(session)
}

pub async fn transfer(connector: &dyn Connector, request: &TransferRequest) -> Result<DestinationReport> {
    transfer_with(connector, request, TransferOptions::default()).await
}

/// Uploads every file of `request` to its destination over one session.
///
/// Errors returned directly are destination-level: the session could not be
/// opened, the remote path could not be prepared, or the run was cancelled
/// before anything was recorded. A failure during an upload is recorded in the
/// report and stops the rest of this destination's files; a cancel once files
/// are under way does the same and sets [`DestinationReport::cancelled`]. The
/// session is closed on every path.
pub async fn transfer_with(
    connector: &dyn Connector,
    request: &TransferRequest,
    options: TransferOptions<'_>,
) -> Result<DestinationReport> {
    let started = Instant::now();
    let label = request.destination.label();
    let mut report = DestinationReport::new(label.clone());
    let mut session: Option<Box<dyn Session>> = None;

    let result = run_files(connector, request, &options, &mut session, &mut report).await;

    if let Some(mut session) = session {
        session.close().await;
        debug!(event = "dest.close", destination = %label, "dest.close");
    }

    match &result {
        Ok(()) => debug!(
            event = "dest.finish",
            destination = %label,
            files = report.outcomes.len(),
            bytes_sent = report.bytes_sent(),
            success = report.is_success(),
            duration_ms = started.elapsed().as_millis() as u64,
            "dest.finish"
        ),
        Err(e) => warn!(
            event = "dest.failed",
            destination = %label,
            error_kind = %e.kind(),
            error = %e,
            "dest.failed"
        ),
    }
    result.map(|()| report)
}

async fn run_files(
    connector: &dyn Connector,
    request: &TransferRequest,
    options: &TransferOptions<'_>,
    session: &mut Option<Box<dyn Session>>,
    report: &mut DestinationReport,
) -> Result<()> {
    let destination = &request.destination;
    let mut tracker = ProgressTracker::new(report.destination.clone(), options.progress);

    let files = request.files.files();
    for (index, file) in files.iter().enumerate() {
        if options.cancel.is_some_and(CancellationToken::is_cancelled) {
            if session.is_none() && report.outcomes.is_empty() {
                return Err(Error::Cancelled);
            }
            report.cancelled = true;
            report.not_attempted = files[index..].to_vec();
            return Ok(());
        }

        let meta = match tokio::fs::metadata(file).await {
            Ok(meta) => meta,
            Err(e) => {
                let err = Error::InvalidPath {
                    path: file.clone(),
                    message: e.to_string(),
                };
                report.failed_outcome(file, "", 0, &err);
                continue;
            }
        };
        if meta.is_dir() {
            debug!(event = "file.skip_dir", path = %file.display(), "file.skip_dir");
            report.skipped_dirs.push(file.clone());
            continue;
        }

        let name = match file_name_of(file) {
            Ok(name) => name,
            Err(err) => {
                warn!(event = "file.bad_name", path = %file.display(), "file.bad_name");
                report.failed_outcome(file, "", 0, &err);
                continue;
            }
        };
        let active = match session {
            Some(active) => active,
            None => {
                let opened = session.insert(open_session(connector, destination, options).await?);
                report.notices = opened.notices();
                let location =
                    cancellable(options.cancel, opened.ensure_remote_path(&destination.remote_path))
                        .await?;
                debug!(
                    event = "dest.ensure_path",
                    destination = %report.destination,
                    location = %location,
                    "dest.ensure_path"
                );
                report.location = Some(location);
                opened
            }
        };

        tracker.begin_file(name, meta.len());
        debug!(event = "file.put", path = %file.display(), bytes = meta.len(), "file.put");
        match cancellable(options.cancel, active.put_file(file, name, &mut tracker)).await {
            Ok(sent) => {
                tracker.finish();
                report.outcomes.push(TransferOutcome {
                    file: file.clone(),
                    remote: name.to_string(),
                    bytes_sent: sent,
                    status: TransferStatus::Success,
                });
            }
            Err(e) => {
                warn!(
                    event = "file.failed",
                    path = %file.display(),
                    error_kind = %e.kind(),
                    error = %e,
                    "file.failed"
                );
                report.failed_outcome(file, name, tracker.state().transferred_bytes, &e);
                report.cancelled = matches!(e, Error::Cancelled);
                report.not_attempted = files[index + 1..].to_vec();
                return Ok(());
            }
        }
    }
    Ok(())
}
