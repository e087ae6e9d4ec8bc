use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DEFAULT_CONNECT_TIMEOUT_SECS, SshSettings};
use crate::spec::{Credentials, DestinationSpec};
use crate::transport::{BoxFuture, SshAuth, SshConnection, connect_async};
use crate::{Error, Result};

/// A host to run a command on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub host: String,
    pub credentials: Credentials,
}

impl CommandTarget {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            credentials,
        }
    }

    /// Targets for every host entry of a destination list, whatever its
    /// upload protocol. Object storage entries have no host and are skipped.
    pub fn from_specs(specs: &[DestinationSpec]) -> Vec<Self> {
        specs
            .iter()
            .filter_map(|spec| {
                if spec.protocol.is_object_storage() {
                    debug!(
                        event = "command.skip_target",
                        destination = %spec.label(),
                        "command.skip_target"
                    );
                    return None;
                }
                let credentials = spec.credentials.clone()?;
                Some(Self::new(spec.host.clone(), credentials))
            })
            .collect()
    }
}

/// Raw result of one remote execution, whatever the exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_status: i32,
    /// stdout and stderr, merged in arrival order.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub host: String,
    pub exit_status: i32,
    pub output: String,
    pub duration_ms: u64,
}

/// Opens a session to a host, runs one command and closes the session.
pub trait RemoteShell: Send + Sync {
    fn exec<'a>(
        &'a self,
        target: &'a CommandTarget,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>>;
}

pub struct SshShell {
    settings: SshSettings,
}

impl SshShell {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

/// Shuts the connection down if the exec future is dropped mid-command.
struct CloseOnDrop(Option<SshConnection>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            conn.close();
        }
    }
}

impl RemoteShell for SshShell {
    fn exec<'a>(
        &'a self,
        target: &'a CommandTarget,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let auth = SshAuth::resolve(&target.credentials, &self.settings);
            let conn = connect_async(&target.host, self.settings.port, auth, timeout).await?;

            let host = target.host.clone();
            let command = command.to_string();
            let task = conn.spawn(move |session| run_exec(session, &host, &command));
            let mut guard = CloseOnDrop(Some(conn));
            let output = task.await;

            if let Some(conn) = guard.0.take() {
                let _ = tokio::task::spawn_blocking(move || conn.close()).await;
            }
            output
        })
    }
}

fn run_exec(session: &ssh2::Session, host: &str, command: &str) -> Result<CommandOutput> {
    let fail = |what: &str, message: String| Error::Command {
        host: host.to_string(),
        message: format!("{what}: {message}"),
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| fail("open channel", e.to_string()))?;
    channel
        .handle_extended_data(ssh2::ExtendedData::Merge)
        .map_err(|e| fail("merge stderr", e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| fail("exec", e.to_string()))?;

    let mut raw = Vec::new();
    channel
        .read_to_end(&mut raw)
        .map_err(|e| fail("read output", e.to_string()))?;
    channel
        .wait_close()
        .map_err(|e| fail("close channel", e.to_string()))?;
    let exit_status = channel
        .exit_status()
        .map_err(|e| fail("exit status", e.to_string()))?;

    Ok(CommandOutput {
        exit_status,
        output: String::from_utf8_lossy(&raw).into_owned(),
    })
}

#[derive(Default, Clone, Copy)]
pub struct CommandOptions<'a> {
    /// Stops the whole run; hosts not yet reached are reported as cancelled.
    pub cancel: Option<&'a CancellationToken>,
    /// `notify_waiters` abandons only the host currently executing.
    pub interrupt: Option<&'a Notify>,
    pub connect_timeout: Option<Duration>,
}

impl CommandOptions<'_> {
    fn timeout(&self) -> Duration {
        self.connect_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let cancelled = async {
            match self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let interrupted = async {
            match self.interrupt {
                Some(notify) => notify.notified().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(Error::Cancelled),
            _ = interrupted => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}

/// Runs `command` on one host. A non-zero exit status is a [`Error::Command`].
pub async fn run_command(
    shell: &dyn RemoteShell,
    target: &CommandTarget,
    command: &str,
    options: CommandOptions<'_>,
) -> Result<CommandResult> {
    let started = Instant::now();
    debug!(event = "command.start", host = %target.host, "command.start");

    let output = options
        .guard(shell.exec(target, command, options.timeout()))
        .await?;
    let duration_ms = started.elapsed().as_millis() as u64;
    debug!(
        event = "command.finish",
        host = %target.host,
        exit_status = output.exit_status,
        duration_ms,
        "command.finish"
    );

    if output.exit_status != 0 {
        let tail = output
            .output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        return Err(Error::Command {
            host: target.host.clone(),
            message: format!("exit status {}: {tail}", output.exit_status),
        });
    }
    Ok(CommandResult {
        host: target.host.clone(),
        exit_status: output.exit_status,
        output: output.output,
        duration_ms,
    })
}

#[derive(Debug)]
pub struct HostRun {
    pub host: String,
    pub result: Result<CommandResult>,
}

/// Runs `command` on each target in order, one at a time. A failing or
/// interrupted host never stops the hosts after it; only the cancel token does.
pub async fn run_on_all(
    shell: &dyn RemoteShell,
    targets: &[CommandTarget],
    command: &str,
    options: CommandOptions<'_>,
) -> Vec<HostRun> {
    let mut runs = Vec::with_capacity(targets.len());
    for target in targets {
        let result = if options.cancel.is_some_and(CancellationToken::is_cancelled) {
            Err(Error::Cancelled)
        } else {
            run_command(shell, target, command, options).await
        };
        if let Err(e) = &result {
            warn!(
                event = "command.failed",
                host = %target.host,
                error_kind = %e.kind(),
                error = %e,
                "command.failed"
            );
        }
        runs.push(HostRun {
            host: target.host.clone(),
            result,
        });
    }
    runs
}

/// What a [`ScriptedShell`] does for one host.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Exit { status: i32, output: String },
    Unreachable,
    /// Never returns; only cancellation or an interrupt ends it.
    Hang,
}

/// In-process [`RemoteShell`] with canned replies per host.
///
/// Hosts without a reply exit 0 and echo the command.
#[derive(Default)]
pub struct ScriptedShell {
    replies: HashMap<String, ScriptedReply>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, host: &str, reply: ScriptedReply) -> Self {
        self.replies.insert(host.to_string(), reply);
        self
    }

    /// `(host, command)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("scripted shell mutex poisoned").clone()
    }
}

impl RemoteShell for ScriptedShell {
    fn exec<'a>(
        &'a self,
        target: &'a CommandTarget,
        command: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("scripted shell mutex poisoned")
                .push((target.host.clone(), command.to_string()));
            match self.replies.get(&target.host) {
                None => Ok(CommandOutput {
                    exit_status: 0,
                    output: format!("{command}\n"),
                }),
                Some(ScriptedReply::Exit { status, output }) => Ok(CommandOutput {
                    exit_status: *status,
                    output: output.clone(),
                }),
                Some(ScriptedReply::Unreachable) => {
                    Err(Error::connection(&target.host, "host unreachable"))
                }
                Some(ScriptedReply::Hang) => std::future::pending().await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::spec::parse_inline;

    #[test]
    fn from_specs_skips_object_storage() {
        let parsed = parse_inline(
            "sftp:h1:/r/:u:p,s3:mybucket,ftp:h2:/d/:u:p,scp:h3:/t/:u:p,smb:h4:/share/x/:u:p",
        );
        let hosts: Vec<String> = CommandTarget::from_specs(&parsed.specs)
            .into_iter()
            .map(|t| t.host)
            .collect();
        assert_eq!(hosts, vec!["h1", "h2", "h3", "h4"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_error() {
        let shell = ScriptedShell::new().reply(
            "h1",
            ScriptedReply::Exit {
                status: 2,
                output: "working\nno such file\n".to_string(),
            },
        );
        let target = CommandTarget::new("h1", Credentials::new("u", "p"));
        let err = run_command(&shell, &target, "ls /x", CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command);
        assert!(err.to_string().contains("exit status 2: no such file"));
    }

    #[tokio::test]
    async fn cancelled_token_skips_remaining_hosts() {
        let shell = ScriptedShell::new();
        let targets = vec![
            CommandTarget::new("h1", Credentials::new("u", "p")),
            CommandTarget::new("h2", Credentials::new("u", "p")),
        ];
        let token = CancellationToken::new();
        token.cancel();
        let options = CommandOptions {
            cancel: Some(&token),
            ..CommandOptions::default()
        };
        let runs = run_on_all(&shell, &targets, "uptime", options).await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| matches!(r.result, Err(Error::Cancelled))));
        assert!(shell.calls().is_empty());
    }
}
