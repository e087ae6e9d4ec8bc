use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BoxFuture, Connector, Notice, Session, join_remote};
use crate::progress::{FIXED_CHUNK_BYTES, ProgressShape, ProgressTracker};
use crate::spec::{DestinationSpec, Protocol};
use crate::{Error, Result};

/// Step used when replaying cumulative and delta progress.
const REPORT_STEP: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPut {
    pub target: String,
    pub remote: String,
    pub bytes: u64,
}

/// Everything an [`InMemoryConnector`] was asked to do, in call order.
#[derive(Debug, Clone, Default)]
pub struct TransportLog {
    pub opens: Vec<String>,
    pub ensures: Vec<(String, String)>,
    pub mkdirs: Vec<(String, String)>,
    pub puts: Vec<RecordedPut>,
    pub closes: Vec<String>,
}

impl TransportLog {
    pub fn puts_to(&self, target: &str) -> Vec<&RecordedPut> {
        self.puts.iter().filter(|p| p.target == target).collect()
    }

    pub fn ensures_on(&self, target: &str) -> usize {
        self.ensures.iter().filter(|(t, _)| t == target).count()
    }

    pub fn closes_of(&self, target: &str) -> usize {
        self.closes.iter().filter(|t| *t == target).count()
    }
}

/// Scripted transport for tests and dry runs.
///
/// Targets are keyed by host, or by bucket for object storage. Nothing leaves
/// the process; uploads read the local file and record its size.
#[derive(Default)]
pub struct InMemoryConnector {
    unreachable: HashSet<String>,
    rejects_auth: HashSet<String>,
    stalled: HashSet<String>,
    unwritable: Vec<String>,
    failing_files: HashSet<String>,
    missing_object_credentials: bool,
    open_delay: Option<Duration>,
    log: Arc<Mutex<TransportLog>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    pub fn reject_auth(mut self, host: &str) -> Self {
        self.rejects_auth.insert(host.to_string());
        self
    }

    /// Object-storage targets fail credential resolution on open.
    pub fn without_object_credentials(mut self) -> Self {
        self.missing_object_credentials = true;
        self
    }

    /// Remote directory (and everything below it) where mkdir and uploads fail.
    pub fn unwritable(mut self, remote_dir: &str) -> Self {
        self.unwritable.push(remote_dir.trim_end_matches('/').to_string());
        self
    }

    /// Uploads whose remote name ends with `name` fail mid-transfer.
    pub fn failing_file(mut self, name: &str) -> Self {
        self.failing_files.insert(name.to_string());
        self
    }

    /// Uploads to `host` never complete; used to exercise cancellation.
    pub fn stall_uploads(mut self, host: &str) -> Self {
        self.stalled.insert(host.to_string());
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn log(&self) -> TransportLog {
        self.log.lock().expect("transport log mutex poisoned").clone()
    }

    fn record(&self, f: impl FnOnce(&mut TransportLog)) {
        f(&mut self.log.lock().expect("transport log mutex poisoned"));
    }
}

fn target_of(destination: &DestinationSpec) -> String {
    destination
        .bucket()
        .unwrap_or(destination.host.as_str())
        .to_string()
}

fn shape_of(protocol: Protocol) -> ProgressShape {
    match protocol {
        Protocol::Ftp => ProgressShape::FixedChunk,
        Protocol::Sftp | Protocol::Scp => ProgressShape::Cumulative,
        Protocol::Smb => ProgressShape::Indeterminate,
        Protocol::S3 => ProgressShape::Delta,
    }
}

impl Connector for InMemoryConnector {
    fn open<'a>(
        &'a self,
        destination: &'a DestinationSpec,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>> {
        Box::pin(async move {
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            let target = target_of(destination);
            if destination.protocol == Protocol::S3 && self.missing_object_credentials {
                return Err(Error::CredentialResolution {
                    message: "no credentials configured for object storage".to_string(),
                });
            }
            if self.unreachable.contains(&target) {
                return Err(Error::connection(&target, "host unreachable"));
            }
            if self.rejects_auth.contains(&target) {
                return Err(Error::authentication(&target, "credentials rejected"));
            }

            self.record(|log| log.opens.push(target.clone()));
            let session = MemorySession {
                protocol: destination.protocol,
                stalled: self.stalled.contains(&target),
                target,
                base: String::new(),
                unwritable: self.unwritable.clone(),
                failing_files: self.failing_files.clone(),
                log: self.log.clone(),
                closed: false,
            };
            Ok(Box::new(session) as Box<dyn Session>)
        })
    }
}

struct MemorySession {
    protocol: Protocol,
    target: String,
    base: String,
    unwritable: Vec<String>,
    failing_files: HashSet<String>,
    stalled: bool,
    log: Arc<Mutex<TransportLog>>,
    closed: bool,
}

impl MemorySession {
    fn is_unwritable(&self, remote: &str) -> bool {
        let remote = remote.trim_end_matches('/');
        self.unwritable.iter().any(|dir| {
            remote == dir
                || remote
                    .strip_prefix(dir.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::connection(&self.target, "session already closed"));
        }
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut TransportLog)) {
        f(&mut self.log.lock().expect("transport log mutex poisoned"));
    }
}

impl Session for MemorySession {
    fn progress_shape(&self) -> ProgressShape {
        shape_of(self.protocol)
    }

    fn notices(&self) -> Vec<Notice> {
        match self.protocol {
            Protocol::Ftp => vec![Notice::PlaintextDataChannel],
            Protocol::Smb | Protocol::S3 => vec![Notice::OverwritesExisting],
            Protocol::Sftp | Protocol::Scp => Vec::new(),
        }
    }

    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.check_open()?;
            self.record(|log| log.ensures.push((self.target.clone(), path.to_string())));
            if self.protocol != Protocol::S3 && self.is_unwritable(path) {
                return Err(Error::remote_path(path, "permission denied"));
            }
            if self.protocol == Protocol::S3 {
                return Ok(format!("s3://{}/", self.target));
            }
            self.base = path.to_string();
            Ok(if path.is_empty() { "." } else { path }.to_string())
        })
    }

    fn make_dir<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            if self.protocol != Protocol::Sftp {
                return Err(Error::remote_path(path, "directory creation is not supported"));
            }
            if self.is_unwritable(path) {
                return Err(Error::remote_path(path, "permission denied"));
            }
            self.record(|log| log.mkdirs.push((self.target.clone(), path.to_string())));
            Ok(())
        })
    }

    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.check_open()?;
            let remote = join_remote(&self.base, remote_name);
            let size = tokio::fs::metadata(local)
                .await
                .map_err(|e| Error::transfer(&remote, format!("stat {}: {e}", local.display())))?
                .len();

            if self.stalled {
                progress.indeterminate();
                std::future::pending::<()>().await;
            }
            let parent = remote.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            if !parent.is_empty() && self.is_unwritable(parent) {
                return Err(Error::transfer(&remote, "permission denied"));
            }

            let fails = self.failing_files.iter().any(|f| remote.ends_with(f.as_str()));
            let replay_until = if fails { size / 2 } else { size };
            match self.progress_shape() {
                ProgressShape::Cumulative => {
                    let mut sent = 0;
                    while sent < replay_until {
                        sent = (sent + REPORT_STEP).min(replay_until);
                        progress.cumulative(sent);
                    }
                }
                ProgressShape::FixedChunk => {
                    for _ in 0..replay_until.div_ceil(FIXED_CHUNK_BYTES) {
                        progress.chunk();
                    }
                }
                ProgressShape::Delta => {
                    let mut left = replay_until;
                    while left > 0 {
                        let step = left.min(REPORT_STEP);
                        progress.delta(step);
                        left -= step;
                    }
                }
                ProgressShape::Indeterminate => progress.indeterminate(),
            }
            if fails {
                return Err(Error::transfer(&remote, "connection reset during upload"));
            }

            self.record(|log| {
                log.puts.push(RecordedPut {
                    target: self.target.clone(),
                    remote: remote.clone(),
                    bytes: size,
                })
            });
            Ok(size)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;
            self.record(|log| log.closes.push(self.target.clone()));
        })
    }
}
