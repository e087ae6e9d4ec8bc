use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::{BoxFuture, Notice, Session, credentials_of};
use crate::config::FtpSettings;
use crate::progress::{FIXED_CHUNK_BYTES, ProgressShape, ProgressTracker};
use crate::spec::DestinationSpec;
use crate::{Error, Result};

static PASV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("valid PASV regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is(&self, codes: &[u16]) -> bool {
        codes.contains(&self.code)
    }
}

/// Command/reply codec over a plain or TLS control stream.
struct Control<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Control<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn send(&mut self, cmd: &str) -> std::io::Result<()> {
        let shown = if cmd.starts_with("PASS ") { "PASS ***" } else { cmd };
        tracing::trace!(event = "ftp.command", command = shown, "ftp.command");
        self.stream.write_all(format!("{cmd}\r\n").as_bytes()).await?;
        self.stream.flush().await
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        let mut buf = String::new();
        if self.stream.read_line(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the control connection",
            ));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads one reply, following `NNN-` continuation lines up to `NNN `.
    async fn read_reply(&mut self) -> std::io::Result<Reply> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];
        if lines[0].as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator);
                lines.push(next);
                if done {
                    break;
                }
            }
        }
        tracing::trace!(event = "ftp.reply", code, "ftp.reply");
        Ok(Reply { code, lines })
    }

    async fn execute(&mut self, cmd: &str) -> std::io::Result<Reply> {
        self.send(cmd).await?;
        self.read_reply().await
    }
}

fn parse_code(line: &str) -> std::io::Result<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed reply line: {line:?}"),
            )
        })
}

/// Extracts the directory from a `257 "<dir>" ...` reply; `""` is an escaped quote.
fn parse_pwd(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let mut out = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
                continue;
            }
            return Some(out);
        }
        out.push(c);
    }
    None
}

fn parse_pasv_port(text: &str) -> Option<u16> {
    let caps = PASV_RE.captures(text)?;
    let p1 = caps[5].parse::<u8>().ok()?;
    let p2 = caps[6].parse::<u8>().ok()?;
    Some(u16::from(p1) * 256 + u16::from(p2))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Sends `PBSZ 0` and `PROT P`. Returns whether the server agreed to a
/// protected data channel; a refusal is not an error.
async fn protect_data_channel<S: AsyncRead + AsyncWrite + Unpin>(
    control: &mut Control<S>,
    host: &str,
) -> Result<bool> {
    for cmd in ["PBSZ 0", "PROT P"] {
        let reply = control
            .execute(cmd)
            .await
            .map_err(|e| Error::connection(host, format!("{cmd}: {e}")))?;
        if reply.code / 100 != 2 {
            tracing::warn!(
                event = "ftp.prot_refused",
                host,
                command = cmd,
                code = reply.code,
                "ftp.prot_refused"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

fn tls_connector(accept_invalid_certs: bool) -> std::result::Result<TlsConnector, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls config: {e}"))?;

    let config = if accept_invalid_certs {
        tracing::warn!(
            event = "ftp.tls_verify_disabled",
            "ftp.tls_verify_disabled"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { algorithms }))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        let (added, _ignored) = roots.add_parsable_certificates(native.certs);
        if added == 0 {
            return Err("no trusted root certificates available".to_string());
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

type DataTls = (TlsConnector, ServerName<'static>);

/// FTP over explicit TLS (`AUTH TLS`).
///
/// The data channel stays in the clear, reported as
/// [`Notice::PlaintextDataChannel`], unless `protect_data` is set and the
/// server accepts `PROT P`.
pub(crate) struct FtpSession {
    control: Option<Control<TlsStream<TcpStream>>>,
    host: String,
    peer: IpAddr,
    timeout: Duration,
    data_tls: Option<DataTls>,
}

impl FtpSession {
    pub(crate) async fn open(
        destination: &DestinationSpec,
        settings: &FtpSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let host = destination.host.as_str();
        let credentials = credentials_of(destination)?;
        let conn_err = |message: String| Error::connection(host, message);
        let timed_out = || conn_err(format!("timed out after {}s", timeout.as_secs()));

        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, settings.port)))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| conn_err(e.to_string()))?;
        let peer = tcp.peer_addr().map_err(|e| conn_err(e.to_string()))?.ip();

        let mut plain = Control::new(tcp);
        let banner = tokio::time::timeout(timeout, plain.read_reply())
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| conn_err(format!("banner: {e}")))?;
        if !banner.is(&[220]) {
            return Err(conn_err(format!("unexpected banner: {}", banner.text())));
        }

        let auth = plain
            .execute("AUTH TLS")
            .await
            .map_err(|e| conn_err(format!("AUTH TLS: {e}")))?;
        if !auth.is(&[234]) {
            return Err(conn_err(format!("server refused AUTH TLS: {}", auth.text())));
        }

        let connector = tls_connector(settings.accept_invalid_certs).map_err(conn_err)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| conn_err(format!("invalid tls server name: {e}")))?;
        let tls = tokio::time::timeout(
            timeout,
            connector.connect(server_name.clone(), plain.into_inner()),
        )
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| conn_err(format!("tls handshake failed: {e}")))?;
        let mut control = Control::new(tls);

        let user = control
            .execute(&format!("USER {}", credentials.username))
            .await
            .map_err(|e| conn_err(format!("USER: {e}")))?;
        if user.is(&[331]) {
            let pass = control
                .execute(&format!("PASS {}", credentials.secret()))
                .await
                .map_err(|e| conn_err(format!("PASS: {e}")))?;
            if !pass.is(&[230, 202]) {
                return Err(Error::authentication(host, pass.text()));
            }
        } else if !user.is(&[230]) {
            return Err(Error::authentication(host, user.text()));
        }

        let binary = control
            .execute("TYPE I")
            .await
            .map_err(|e| conn_err(format!("TYPE I: {e}")))?;
        if binary.code / 100 != 2 {
            return Err(conn_err(format!("TYPE I refused: {}", binary.text())));
        }

        let data_tls = if settings.protect_data {
            protect_data_channel(&mut control, host)
                .await?
                .then_some((connector, server_name))
        } else {
            None
        };

        tracing::debug!(
            event = "ftp.connected",
            host,
            protected_data = data_tls.is_some(),
            "ftp.connected"
        );
        Ok(Self {
            control: Some(control),
            host: host.to_string(),
            peer,
            timeout,
            data_tls,
        })
    }

    fn control(&mut self) -> Result<&mut Control<TlsStream<TcpStream>>> {
        let host = &self.host;
        self.control
            .as_mut()
            .ok_or_else(|| Error::connection(host, "ftp session already closed"))
    }
}

impl Session for FtpSession {
    fn progress_shape(&self) -> ProgressShape {
        ProgressShape::FixedChunk
    }

    fn notices(&self) -> Vec<Notice> {
        if self.data_tls.is_some() {
            Vec::new()
        } else {
            vec![Notice::PlaintextDataChannel]
        }
    }

    fn ensure_remote_path<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let control = self.control()?;
            let io_err = |e: std::io::Error| Error::remote_path(path, e.to_string());
            if !path.is_empty() {
                let cwd = control.execute(&format!("CWD {path}")).await.map_err(io_err)?;
                if cwd.code / 100 != 2 {
                    return Err(Error::remote_path(path, cwd.text()));
                }
            }
            let pwd = control.execute("PWD").await.map_err(io_err)?;
            Ok(parse_pwd(&pwd.text()).unwrap_or_else(|| path.to_string()))
        })
    }

    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let peer = self.peer;
            let timeout = self.timeout;
            let data_tls = self.data_tls.clone();
            let control = self.control()?;
            let fail = |message: String| Error::transfer(remote_name, message);

            let pasv = control
                .execute("PASV")
                .await
                .map_err(|e| fail(format!("PASV: {e}")))?;
            let port = pasv
                .is(&[227])
                .then(|| parse_pasv_port(&pasv.text()))
                .flatten()
                .ok_or_else(|| fail(format!("unusable PASV reply: {}", pasv.text())))?;
            let data_tcp = tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(peer, port)))
                .await
                .map_err(|_| fail("data connection timed out".to_string()))?
                .map_err(|e| fail(format!("data connection: {e}")))?;

            let stor = control
                .execute(&format!("STOR {remote_name}"))
                .await
                .map_err(|e| fail(format!("STOR: {e}")))?;
            if !stor.is(&[125, 150]) {
                return Err(fail(stor.text()));
            }
            let mut data: Box<dyn AsyncWrite + Unpin + Send> = match data_tls {
                Some((connector, name)) => Box::new(
                    tokio::time::timeout(timeout, connector.connect(name, data_tcp))
                        .await
                        .map_err(|_| fail("data tls handshake timed out".to_string()))?
                        .map_err(|e| fail(format!("data tls handshake: {e}")))?,
                ),
                None => Box::new(data_tcp),
            };

            let mut file = tokio::fs::File::open(local)
                .await
                .map_err(|e| fail(format!("open {}: {e}", local.display())))?;
            let mut buf = vec![0u8; FIXED_CHUNK_BYTES as usize];
            let mut sent = 0u64;
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| fail(format!("read local: {e}")))?;
                if n == 0 {
                    break;
                }
                data.write_all(&buf[..n])
                    .await
                    .map_err(|e| fail(format!("data write: {e}")))?;
                sent += n as u64;
                progress.chunk();
            }
            data.shutdown()
                .await
                .map_err(|e| fail(format!("data close: {e}")))?;
            drop(data);

            let done = control
                .read_reply()
                .await
                .map_err(|e| fail(format!("transfer reply: {e}")))?;
            if !done.is(&[226, 250]) {
                return Err(fail(done.text()));
            }
            Ok(sent)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut control) = self.control.take() {
                let _ = tokio::time::timeout(Duration::from_secs(2), control.execute("QUIT")).await;
                let _ = control.into_inner().shutdown().await;
                tracing::debug!(event = "ftp.closed", host = %self.host, "ftp.closed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_rustls::TlsAcceptor;

    use super::*;
    use crate::ErrorKind;
    use crate::progress::testing::Recorder;

    fn acceptor() -> TlsAcceptor {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    /// Reply codes the scripted server uses where a test wants to vary them.
    #[derive(Clone, Copy)]
    struct Script {
        pass: u16,
        prot: u16,
        done: u16,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                pass: 230,
                prot: 200,
                done: 226,
            }
        }
    }

    struct Served {
        commands: Vec<String>,
        received: Vec<u8>,
    }

    /// One-client FTPS server on loopback answering from `script`.
    async fn serve(script: Script) -> (u16, JoinHandle<Served>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = acceptor();

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut plain = Control::new(tcp);
            plain.send("220 scripted ftpd").await.unwrap();
            assert_eq!(plain.read_line().await.unwrap(), "AUTH TLS");
            plain.send("234 go ahead").await.unwrap();
            let tls = acceptor.accept(plain.into_inner()).await.unwrap();
            let mut control = Control::new(tls);

            let mut served = Served {
                commands: Vec::new(),
                received: Vec::new(),
            };
            let mut passive: Option<TcpListener> = None;
            let mut protected = false;
            while let Ok(line) = control.read_line().await {
                served.commands.push(line.clone());
                let verb = line.split(' ').next().unwrap_or_default().to_string();
                let reply = match verb.as_str() {
                    "USER" => "331 password required".to_string(),
                    "PASS" => format!("{} login", script.pass),
                    "TYPE" => "200 binary".to_string(),
                    "PBSZ" => "200 PBSZ=0".to_string(),
                    "PROT" => {
                        protected = script.prot == 200;
                        format!("{} prot", script.prot)
                    }
                    "CWD" => "250 directory changed".to_string(),
                    "PWD" => "257 \"/d\" is the current directory".to_string(),
                    "PASV" => {
                        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                        let p = data.local_addr().unwrap().port();
                        passive = Some(data);
                        format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256)
                    }
                    "STOR" => {
                        control.send("150 opening data connection").await.unwrap();
                        let (data, _) = passive.take().unwrap().accept().await.unwrap();
                        if protected {
                            let mut data = acceptor.accept(data).await.unwrap();
                            data.read_to_end(&mut served.received).await.unwrap();
                        } else {
                            let mut data = data;
                            data.read_to_end(&mut served.received).await.unwrap();
                        }
                        format!("{} transfer complete", script.done)
                    }
                    "QUIT" => {
                        control.send("221 bye").await.unwrap();
                        break;
                    }
                    _ => "502 not implemented".to_string(),
                };
                control.send(&reply).await.unwrap();
            }
            served
        });
        (port, handle)
    }

    fn settings(port: u16, protect_data: bool) -> FtpSettings {
        FtpSettings {
            port,
            accept_invalid_certs: true,
            protect_data,
        }
    }

    fn local_file(dir: &tempfile::TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("c.bin");
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    async fn open(port: u16, protect_data: bool) -> Result<FtpSession> {
        let dest = DestinationSpec::parse("ftp:127.0.0.1:/d/:op:pw").unwrap();
        FtpSession::open(&dest, &settings(port, protect_data), Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn upload_reports_fixed_chunks_over_clear_data_channel() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = local_file(&temp, 20_000);
        let (port, server) = serve(Script::default()).await;

        let mut session = open(port, false).await.unwrap();
        assert_eq!(session.notices(), vec![Notice::PlaintextDataChannel]);
        assert_eq!(session.ensure_remote_path("/d/").await.unwrap(), "/d");

        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("ftp://127.0.0.1/d", Some(&rec));
        tracker.begin_file("c.bin", 20_000);
        let sent = session.put_file(&file, "c.bin", &mut tracker).await.unwrap();
        session.close().await;

        assert_eq!(sent, 20_000);
        assert_eq!(rec.updates(), vec![8192, 16_384, 20_000]);
        assert_eq!(rec.completions(), 1);

        let served = server.await.unwrap();
        assert_eq!(served.received.len(), 20_000);
        assert!(served.commands.contains(&"CWD /d/".to_string()));
        assert!(served.commands.contains(&"STOR c.bin".to_string()));
        assert!(!served.commands.iter().any(|c| c.starts_with("PROT")));
        assert_eq!(served.commands.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn protected_data_channel_when_server_accepts_prot_p() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = local_file(&temp, 9000);
        let (port, server) = serve(Script::default()).await;

        let mut session = open(port, true).await.unwrap();
        assert!(session.notices().is_empty());
        session.ensure_remote_path("/d/").await.unwrap();
        let mut tracker = ProgressTracker::new("ftp://127.0.0.1/d", None);
        tracker.begin_file("c.bin", 9000);
        assert_eq!(session.put_file(&file, "c.bin", &mut tracker).await.unwrap(), 9000);
        session.close().await;

        let served = server.await.unwrap();
        assert_eq!(served.received, vec![7u8; 9000]);
        assert!(served.commands.contains(&"PBSZ 0".to_string()));
        assert!(served.commands.contains(&"PROT P".to_string()));
    }

    #[tokio::test]
    async fn refused_prot_p_keeps_clear_channel_and_notice() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = local_file(&temp, 100);
        let (port, server) = serve(Script {
            prot: 534,
            ..Script::default()
        })
        .await;

        let mut session = open(port, true).await.unwrap();
        assert_eq!(session.notices(), vec![Notice::PlaintextDataChannel]);
        session.ensure_remote_path("/d/").await.unwrap();
        let mut tracker = ProgressTracker::new("ftp://127.0.0.1/d", None);
        tracker.begin_file("c.bin", 100);
        assert_eq!(session.put_file(&file, "c.bin", &mut tracker).await.unwrap(), 100);
        session.close().await;
        assert_eq!(server.await.unwrap().received.len(), 100);
    }

    #[tokio::test]
    async fn rejected_password_is_authentication_error() {
        let (port, server) = serve(Script {
            pass: 530,
            ..Script::default()
        })
        .await;

        let err = open(port, false).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        let served = server.await.unwrap();
        assert_eq!(served.commands.last().map(String::as_str), Some("PASS pw"));
    }

    #[tokio::test]
    async fn failing_transfer_reply_is_transfer_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = local_file(&temp, 5000);
        let (port, server) = serve(Script {
            done: 451,
            ..Script::default()
        })
        .await;

        let mut session = open(port, false).await.unwrap();
        session.ensure_remote_path("/d/").await.unwrap();
        let mut tracker = ProgressTracker::new("ftp://127.0.0.1/d", None);
        tracker.begin_file("c.bin", 5000);
        let err = session.put_file(&file, "c.bin", &mut tracker).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        session.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn multi_line_reply_is_read_to_terminator() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"220-Welcome\r\n220-second line\r\n220 ready\r\n")
            .await
            .unwrap();

        let mut control = Control::new(client);
        let reply = control.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.lines[2], "220 ready");
    }

    #[tokio::test]
    async fn password_is_masked_but_sent() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut control = Control::new(client);
        control.send("PASS s3cret").await.unwrap();

        let mut buf = vec![0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PASS s3cret\r\n");
    }

    #[test]
    fn pwd_reply_is_unquoted() {
        assert_eq!(
            parse_pwd("257 \"/home/op/d\" is the current directory").as_deref(),
            Some("/home/op/d")
        );
        assert_eq!(parse_pwd("257 \"/a \"\"q\"\"\"").as_deref(), Some("/a \"q\""));
        assert_eq!(parse_pwd("257 no quotes"), None);
    }

    #[test]
    fn pasv_port_is_decoded() {
        assert_eq!(
            parse_pasv_port("227 Entering Passive Mode (192,168,1,5,195,80)."),
            Some(195 * 256 + 80)
        );
        assert_eq!(parse_pasv_port("227 Entering Passive Mode"), None);
        assert_eq!(parse_pasv_port("227 (1,2,3,4,999,1)"), None);
    }

    #[test]
    fn malformed_reply_line_is_rejected() {
        assert!(parse_code("2x").is_err());
        assert_eq!(parse_code("230 ok").unwrap(), 230);
    }
}
