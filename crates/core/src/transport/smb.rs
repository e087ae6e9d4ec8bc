use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;

use super::{BoxFuture, Notice, Session, credentials_of};
use crate::config::SmbSettings;
use crate::progress::{ProgressShape, ProgressTracker};
use crate::spec::{Credentials, DestinationSpec};
use crate::{Error, Result};

const LOGIN_SHARE: &str = "IPC$";

static NT_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NT_STATUS_[A-Z0-9_]+").expect("valid NT_STATUS regex"));

/// Splits `DOMAIN\user` into its parts; a bare name has no domain.
pub(crate) fn split_domain_user(username: &str) -> (Option<&str>, &str) {
    match username.split_once('\\') {
        Some((domain, user)) if !domain.is_empty() => (Some(domain), user),
        Some((_, user)) => (None, user),
        None => (None, username),
    }
}

/// NetBIOS name used for the server: leading DNS label, upper-cased.
pub(crate) fn netbios_name(host: &str) -> String {
    host.split('.').next().unwrap_or(host).to_uppercase()
}

/// Splits `/share/dir/sub/` into `("share", "/dir/sub/")`.
pub(crate) fn split_share(remote_path: &str) -> Option<(String, String)> {
    let normalized = remote_path.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    let (share, rest) = match trimmed.split_once('/') {
        Some((share, rest)) => (share, rest),
        None => (trimmed, ""),
    };
    if share.is_empty() {
        return None;
    }
    Some((share.to_string(), format!("/{rest}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Auth,
    Path,
    Connection,
    Other,
}

fn classify(output: &str) -> Option<(Failure, String)> {
    let status = NT_STATUS_RE.find(output)?.as_str();
    let kind = match status {
        "NT_STATUS_LOGON_FAILURE"
        | "NT_STATUS_WRONG_PASSWORD"
        | "NT_STATUS_ACCOUNT_DISABLED"
        | "NT_STATUS_ACCOUNT_LOCKED_OUT"
        | "NT_STATUS_PASSWORD_EXPIRED"
        | "NT_STATUS_LOGON_TYPE_NOT_GRANTED" => Failure::Auth,
        "NT_STATUS_BAD_NETWORK_NAME"
        | "NT_STATUS_ACCESS_DENIED"
        | "NT_STATUS_OBJECT_NAME_NOT_FOUND"
        | "NT_STATUS_OBJECT_PATH_NOT_FOUND"
        | "NT_STATUS_NOT_A_DIRECTORY"
        | "NT_STATUS_OBJECT_NAME_COLLISION" => Failure::Path,
        "NT_STATUS_IO_TIMEOUT"
        | "NT_STATUS_HOST_UNREACHABLE"
        | "NT_STATUS_NETWORK_UNREACHABLE"
        | "NT_STATUS_CONNECTION_REFUSED"
        | "NT_STATUS_CONNECTION_RESET"
        | "NT_STATUS_CONNECTION_DISCONNECTED" => Failure::Connection,
        _ => Failure::Other,
    };
    Some((kind, status.to_string()))
}

fn quoted(value: &str) -> std::result::Result<String, String> {
    if value.contains('"') || value.contains(';') || value.contains('\n') {
        return Err(format!("{value:?} cannot be passed to smbclient"));
    }
    Ok(format!("\"{value}\""))
}

/// SMB/CIFS through the `smbclient` binary over direct TCP.
///
/// Each operation is one `smbclient -c` invocation, so there is no incremental
/// progress; uploads report [`ProgressShape::Indeterminate`].
pub(crate) struct SmbSession {
    settings: SmbSettings,
    host: String,
    address: SocketAddr,
    netbios: String,
    domain: Option<String>,
    user: String,
    credentials: Credentials,
    share: Option<String>,
    base: String,
    closed: bool,
}

impl SmbSession {
    pub(crate) async fn open(
        destination: &DestinationSpec,
        settings: &SmbSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let host = destination.host.as_str();
        let credentials = credentials_of(destination)?.clone();
        let (domain, user) = split_domain_user(&credentials.username);
        let (domain, user) = (domain.map(str::to_string), user.to_string());

        let address = tokio::net::lookup_host((host, settings.port))
            .await
            .map_err(|e| Error::connection(host, format!("resolve failed: {e}")))?
            .next()
            .ok_or_else(|| Error::connection(host, "host resolved to no addresses"))?;
        tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::connection(host, format!("timed out after {}s", timeout.as_secs())))?
            .map_err(|e| Error::connection(host, e.to_string()))?;

        let session = Self {
            settings: settings.clone(),
            host: host.to_string(),
            address,
            netbios: netbios_name(host),
            domain,
            user,
            credentials,
            share: None,
            base: "/".to_string(),
            closed: false,
        };
        session.login().await?;

        tracing::debug!(
            event = "smb.connected",
            host,
            netbios = %session.netbios,
            domain = session.domain.as_deref().unwrap_or(""),
            "smb.connected"
        );
        Ok(session)
    }

    /// Session setup against `IPC$`, which every server exposes, so a bad
    /// login fails here rather than on the first file.
    async fn login(&self) -> Result<()> {
        match self.run(LOGIN_SHARE, "exit").await? {
            Ok(()) => Ok(()),
            Err((Failure::Auth, status)) => Err(Error::authentication(&self.host, status)),
            Err((_, status)) if status == "NT_STATUS_ACCESS_DENIED" => {
                Err(Error::authentication(&self.host, status))
            }
            Err((_, status)) => Err(Error::connection(&self.host, status)),
        }
    }

    async fn run(&self, share: &str, script: &str) -> Result<std::result::Result<(), (Failure, String)>> {
        if self.closed {
            return Err(Error::connection(&self.host, "smb session already closed"));
        }

        let mut cmd = tokio::process::Command::new(&self.settings.smbclient);
        cmd.arg(format!("//{}/{}", self.netbios, share))
            .arg("-I")
            .arg(self.address.ip().to_string())
            .arg("-p")
            .arg(self.settings.port.to_string())
            .arg("-U")
            .arg(&self.user)
            .arg("-t")
            .arg(self.settings.timeout_secs.to_string())
            .arg("-c")
            .arg(script)
            .env("PASSWD", self.credentials.secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(domain) = &self.domain {
            cmd.arg("-W").arg(domain);
        }

        let output = cmd.output().await.map_err(|e| Error::InvalidConfig {
            message: format!("failed to run {}: {e}", self.settings.smbclient),
        })?;
        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if let Some(failure) = classify(&text) {
            return Ok(Err(failure));
        }
        if !output.status.success() {
            let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Ok(Err((Failure::Other, format!("{} ({last})", output.status))));
        }
        Ok(Ok(()))
    }
}

impl Session for SmbSession {
    fn progress_shape(&self) -> ProgressShape {
        ProgressShape::Indeterminate
    }

    fn notices(&self) -> Vec<Notice> {
        vec![Notice::OverwritesExisting]
    }

    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let (share, in_share) = split_share(path)
                .ok_or_else(|| Error::remote_path(path, "path must start with a share name"))?;
            let script = format!(
                "cd {}",
                quoted(&in_share).map_err(|m| Error::remote_path(path, m))?
            );

            match self.run(&share, &script).await? {
                Ok(()) => {}
                Err((Failure::Auth, status)) => {
                    return Err(Error::authentication(&self.host, status));
                }
                Err((Failure::Connection, status)) => {
                    return Err(Error::connection(&self.host, status));
                }
                Err((_, status)) => {
                    return Err(Error::remote_path(
                        path,
                        format!("unable to access share, permissions may be invalid: {status}"),
                    ));
                }
            }

            let display = format!("//{}/{}{}", self.netbios, share, in_share);
            self.share = Some(share);
            self.base = in_share;
            Ok(display)
        })
    }

    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let fail = |message: String| Error::transfer(remote_name, message);
            let share = self
                .share
                .clone()
                .ok_or_else(|| fail("no share selected".to_string()))?;
            let size = tokio::fs::metadata(local)
                .await
                .map_err(|e| fail(format!("stat {}: {e}", local.display())))?
                .len();
            let local_str = local
                .to_str()
                .ok_or_else(|| fail("local path must be UTF-8".to_string()))?;

            let put = format!(
                "put {} {}",
                quoted(local_str).map_err(fail)?,
                quoted(remote_name).map_err(fail)?
            );
            let script = if remote_name.starts_with('/') {
                put
            } else {
                format!("cd {}; {put}", quoted(&self.base).map_err(fail)?)
            };

            progress.indeterminate();
            match self.run(&share, &script).await? {
                Ok(()) => Ok(size),
                Err((Failure::Auth, status)) => Err(Error::authentication(&self.host, status)),
                Err((Failure::Connection, status)) => Err(Error::connection(&self.host, status)),
                Err((_, status)) => Err(fail(status)),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::progress::testing::Recorder;

    /// Writes an executable stand-in for `smbclient` that appends its
    /// arguments to `calls.log` and then runs `body`.
    #[cfg(unix)]
    fn fake_smbclient(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let path = dir.join("smbclient");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    async fn open_with(body: &str) -> (tempfile::TempDir, Result<SmbSession>) {
        let temp = tempfile::TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = SmbSettings {
            port: listener.local_addr().unwrap().port(),
            smbclient: fake_smbclient(temp.path(), body),
            timeout_secs: 15,
        };
        let dest = DestinationSpec::parse("smb:127.0.0.1:/drop/in/:CORP\\op:s3cret").unwrap();
        let opened = SmbSession::open(&dest, &settings, Duration::from_secs(5)).await;
        (temp, opened)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bad_login_fails_at_open() {
        let (_temp, opened) = open_with(
            "echo 'session setup failed: NT_STATUS_LOGON_FAILURE' >&2; exit 1",
        )
        .await;
        assert_eq!(opened.err().unwrap().kind(), ErrorKind::Authentication);

        let (_temp, opened) =
            open_with("echo 'tree connect failed: NT_STATUS_ACCESS_DENIED'; exit 1").await;
        assert_eq!(opened.err().unwrap().kind(), ErrorKind::Authentication);

        let (_temp, opened) =
            open_with("echo 'Connection failed (Error NT_STATUS_IO_TIMEOUT)'; exit 1").await;
        assert_eq!(opened.err().unwrap().kind(), ErrorKind::Connection);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn login_ensure_and_put_run_smbclient_in_order() {
        let (temp, opened) = open_with("exit 0").await;
        let mut session = opened.unwrap();

        assert_eq!(
            session.ensure_remote_path("/drop/in/").await.unwrap(),
            "//127/drop/in/"
        );
        let local = temp.path().join("a.txt");
        std::fs::write(&local, b"hello smb").unwrap();
        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("smb://127.0.0.1/drop/in", Some(&rec));
        tracker.begin_file("a.txt", 9);
        assert_eq!(session.put_file(&local, "a.txt", &mut tracker).await.unwrap(), 9);
        assert!(rec.saw_indeterminate());
        session.close().await;

        let calls = std::fs::read_to_string(temp.path().join("calls.log")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("//127/IPC$ -I 127.0.0.1"));
        assert!(calls[0].contains("-U op") && calls[0].ends_with("-c exit -W CORP"));
        assert!(calls[1].starts_with("//127/drop ") && calls[1].contains("-c cd \"/in/\""));
        assert!(calls[2].contains("put \"") && calls[2].contains("\"a.txt\""));
        assert!(calls.iter().all(|c| !c.contains("s3cret")));

        let err = session.put_file(&local, "a.txt", &mut tracker).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn domain_user_is_split_on_backslash() {
        assert_eq!(split_domain_user("CORP\\alice"), (Some("CORP"), "alice"));
        assert_eq!(split_domain_user("alice"), (None, "alice"));
        assert_eq!(split_domain_user("\\alice"), (None, "alice"));
    }

    #[test]
    fn netbios_name_is_upper_leading_label() {
        assert_eq!(netbios_name("fs01.corp.example.com"), "FS01");
        assert_eq!(netbios_name("nas"), "NAS");
        assert_eq!(netbios_name("10.0.0.7"), "10");
    }

    #[test]
    fn share_is_first_segment() {
        assert_eq!(
            split_share("/public/drop/in/"),
            Some(("public".to_string(), "/drop/in/".to_string()))
        );
        assert_eq!(
            split_share("public"),
            Some(("public".to_string(), "/".to_string()))
        );
        assert_eq!(
            split_share("\\public\\x"),
            Some(("public".to_string(), "/x".to_string()))
        );
        assert_eq!(split_share("/"), None);
    }

    #[test]
    fn nt_status_is_classified() {
        assert_eq!(
            classify("session setup failed: NT_STATUS_LOGON_FAILURE"),
            Some((Failure::Auth, "NT_STATUS_LOGON_FAILURE".to_string()))
        );
        assert_eq!(
            classify("tree connect failed: NT_STATUS_BAD_NETWORK_NAME").map(|f| f.0),
            Some(Failure::Path)
        );
        assert_eq!(
            classify("Connection to x failed (Error NT_STATUS_IO_TIMEOUT)").map(|f| f.0),
            Some(Failure::Connection)
        );
        assert_eq!(classify("putting file a.txt as \\a.txt"), None);
    }

    #[test]
    fn quotes_in_names_are_refused() {
        assert_eq!(quoted("/a b/").unwrap(), "\"/a b/\"");
        assert!(quoted("evil\"; rm").is_err());
    }
}
