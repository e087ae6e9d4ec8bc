use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use super::{BoxFuture, Notice, Session};
use crate::config::S3Settings;
use crate::progress::{ProgressShape, ProgressTracker};
use crate::spec::DestinationSpec;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const DEFAULT_REGION: &str = "us-east-1";

/// Unreserved characters stay literal in object keys; everything else is escaped.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const CREDENTIAL_GUIDANCE: &str = "set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, \
     or add the profile to ~/.aws/credentials (see AWS_PROFILE)";

pub(crate) struct AwsCredentials {
    access_key_id: String,
    secret_access_key: SecretString,
    session_token: Option<SecretString>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Environment lookup, injectable so resolution can be tested without
/// mutating the process environment.
type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Ambient credential chain: environment first, then the shared credentials file.
fn resolve_credentials_with(settings: &S3Settings, env: EnvLookup<'_>) -> Result<AwsCredentials> {
    if let (Some(id), Some(secret)) = (env("AWS_ACCESS_KEY_ID"), env("AWS_SECRET_ACCESS_KEY")) {
        tracing::debug!(event = "s3.credentials_resolved", source = "env", "s3.credentials_resolved");
        return Ok(AwsCredentials {
            access_key_id: id,
            secret_access_key: SecretString::new(secret),
            session_token: env("AWS_SESSION_TOKEN").map(SecretString::new),
        });
    }

    let profile = settings
        .profile
        .clone()
        .or_else(|| env("AWS_PROFILE"))
        .unwrap_or_else(|| "default".to_string());
    let path = env("AWS_SHARED_CREDENTIALS_FILE")
        .map(PathBuf::from)
        .or_else(|| {
            env("HOME")
                .or_else(|| env("USERPROFILE"))
                .map(|home| Path::new(&home).join(".aws").join("credentials"))
        })
        .ok_or_else(|| Error::CredentialResolution {
            message: format!("no home directory to look for a credentials file; {CREDENTIAL_GUIDANCE}"),
        })?;

    let text = std::fs::read_to_string(&path).map_err(|e| Error::CredentialResolution {
        message: format!("{}: {e}; {CREDENTIAL_GUIDANCE}", path.display()),
    })?;
    let creds = parse_credentials_file(&text, &profile).ok_or_else(|| Error::CredentialResolution {
        message: format!(
            "profile {profile:?} in {} has no access key; {CREDENTIAL_GUIDANCE}",
            path.display()
        ),
    })?;
    tracing::debug!(
        event = "s3.credentials_resolved",
        source = "shared_file",
        profile = %profile,
        "s3.credentials_resolved"
    );
    Ok(creds)
}

/// Reads one profile out of an INI-style shared credentials file.
fn parse_credentials_file(text: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let access_key_id = values.remove("aws_access_key_id").filter(|v| !v.is_empty())?;
    let secret = values.remove("aws_secret_access_key").filter(|v| !v.is_empty())?;
    Some(AwsCredentials {
        access_key_id,
        secret_access_key: SecretString::new(secret),
        session_token: values
            .remove("aws_session_token")
            .filter(|v| !v.is_empty())
            .map(SecretString::new),
    })
}

fn resolve_region(settings: &S3Settings, env: EnvLookup<'_>) -> String {
    settings
        .region
        .clone()
        .or_else(|| env("AWS_REGION"))
        .or_else(|| env("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Escapes each `/`-separated segment of an object key.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Virtual-hosted style on AWS; path style for custom endpoints and dotted buckets.
fn object_url(
    endpoint: Option<&str>,
    region: &str,
    bucket: &str,
    key: Option<&str>,
) -> Result<url::Url> {
    let key = key.map(encode_key).unwrap_or_default();
    let raw = match endpoint {
        Some(endpoint) => format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/')),
        None if bucket.contains('.') => format!("https://s3.{region}.amazonaws.com/{bucket}/{key}"),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    };
    url::Url::parse(&raw).map_err(|e| Error::InvalidConfig {
        message: format!("invalid object storage url {raw:?}: {e}"),
    })
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 signer for unsigned-payload S3 requests.
struct Signer<'a> {
    credentials: &'a AwsCredentials,
    region: &'a str,
}

impl Signer<'_> {
    /// Returns every header the request must carry, `authorization` included.
    fn sign(&self, method: &str, url: &url::Url, now: DateTime<Utc>) -> BTreeMap<String, String> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host_header(url));
        headers.insert("x-amz-content-sha256".to_string(), UNSIGNED_PAYLOAD.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(token) = &self.credentials.session_token {
            headers.insert(
                "x-amz-security-token".to_string(),
                token.expose_secret().to_string(),
            );
        }

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_request = format!(
            "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{UNSIGNED_PAYLOAD}",
            url.path(),
            canonical_query(url),
        );

        let scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret = format!("AWS4{}", self.credentials.secret_access_key.expose_secret());
        let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        headers.insert(
            "authorization".to_string(),
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
        );
        headers
    }
}

fn host_header(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn canonical_query(url: &url::Url) -> String {
    let mut pairs: Vec<&str> = url.query().unwrap_or_default().split('&').collect();
    pairs.retain(|p| !p.is_empty());
    pairs.sort_unstable();
    pairs
        .into_iter()
        .map(|p| if p.contains('=') { p.to_string() } else { format!("{p}=") })
        .collect::<Vec<_>>()
        .join("&")
}

/// Pulls `<Code>` out of an S3 XML error body.
fn error_code(body: &str) -> Option<&str> {
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(body[start..end].trim())
}

pub(crate) struct S3Session {
    http: reqwest::Client,
    credentials: AwsCredentials,
    region: String,
    endpoint: Option<String>,
    bucket: String,
    closed: bool,
}

impl S3Session {
    /// Resolves ambient credentials; no network traffic happens until the
    /// bucket is checked.
    pub(crate) async fn open(
        destination: &DestinationSpec,
        settings: &S3Settings,
        http: reqwest::Client,
    ) -> Result<Self> {
        Self::open_with(destination, settings, http, &process_env)
    }

    fn open_with(
        destination: &DestinationSpec,
        settings: &S3Settings,
        http: reqwest::Client,
        env: EnvLookup<'_>,
    ) -> Result<Self> {
        let bucket = destination
            .bucket()
            .ok_or_else(|| Error::MalformedSpec {
                entry: destination.label(),
                message: "object storage destination has no bucket".to_string(),
            })?
            .to_string();
        let credentials = resolve_credentials_with(settings, env)?;
        let region = resolve_region(settings, env);
        tracing::debug!(event = "s3.session_opened", bucket = %bucket, region = %region, "s3.session_opened");
        Ok(Self {
            http,
            credentials,
            region,
            endpoint: settings.endpoint_url.clone(),
            bucket,
            closed: false,
        })
    }

    fn signer(&self) -> Signer<'_> {
        Signer {
            credentials: &self.credentials,
            region: &self.region,
        }
    }

    fn url(&self, key: Option<&str>) -> Result<url::Url> {
        object_url(self.endpoint.as_deref(), &self.region, &self.bucket, key)
    }

    fn classify_put(&self, key: &str, status: StatusCode, body: &str) -> Error {
        let code = error_code(body).unwrap_or_default();
        let message = if code.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("{code} (HTTP {status})")
        };
        match code {
            "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken" => {
                Error::authentication(&self.bucket, message)
            }
            "NoSuchBucket" | "AccessDenied" | "AllAccessDisabled" => Error::AccessOrNotFound {
                bucket: self.bucket.clone(),
                message,
            },
            _ => Error::transfer(key, message),
        }
    }
}

impl Session for S3Session {
    fn progress_shape(&self) -> ProgressShape {
        ProgressShape::Delta
    }

    fn notices(&self) -> Vec<Notice> {
        vec![Notice::OverwritesExisting]
    }

    /// Checks the bucket with `HEAD`; objects are written under its root.
    fn ensure_remote_path<'a>(&'a mut self, _path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if self.closed {
                return Err(Error::connection(&self.bucket, "s3 session already closed"));
            }
            let url = self.url(None)?;
            let mut req = self.http.head(url.clone());
            for (name, value) in self.signer().sign("HEAD", &url, Utc::now()) {
                if name != "host" {
                    req = req.header(name, value);
                }
            }
            let response = req
                .send()
                .await
                .map_err(|e| Error::connection(host_header(&url).as_str(), e.to_string()))?;

            let status = response.status();
            tracing::debug!(event = "s3.bucket_checked", bucket = %self.bucket, status = status.as_u16(), "s3.bucket_checked");
            match status {
                s if s.is_success() => Ok(format!("s3://{}/", self.bucket)),
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::MOVED_PERMANENTLY => {
                    Err(Error::AccessOrNotFound {
                        bucket: self.bucket.clone(),
                        message: format!("HEAD bucket returned HTTP {status}"),
                    })
                }
                StatusCode::BAD_REQUEST => Err(Error::authentication(
                    &self.bucket,
                    format!("HEAD bucket returned HTTP {status}; check region and credentials"),
                )),
                _ => Err(Error::connection(
                    host_header(&url).as_str(),
                    format!("HEAD bucket returned HTTP {status}"),
                )),
            }
        })
    }

    fn put_file<'a>(
        &'a mut self,
        local: &'a Path,
        remote_name: &'a str,
        progress: &'a mut ProgressTracker<'_>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let key = remote_name.trim_start_matches('/');
            let file = tokio::fs::File::open(local)
                .await
                .map_err(|e| Error::transfer(key, format!("open {}: {e}", local.display())))?;
            let size = file
                .metadata()
                .await
                .map_err(|e| Error::transfer(key, format!("stat {}: {e}", local.display())))?
                .len();

            let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
            let stream = ReaderStream::new(file).inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    let _ = tx.send(bytes.len() as u64);
                }
            });

            let url = self.url(Some(key))?;
            let mut req = self
                .http
                .put(url.clone())
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(reqwest::Body::wrap_stream(stream));
            for (name, value) in self.signer().sign("PUT", &url, Utc::now()) {
                if name != "host" {
                    req = req.header(name, value);
                }
            }

            let send = req.send();
            tokio::pin!(send);
            let response = loop {
                tokio::select! {
                    Some(n) = rx.recv() => progress.delta(n),
                    result = &mut send => break result,
                }
            };
            while let Ok(n) = rx.try_recv() {
                progress.delta(n);
            }

            let response = response.map_err(|e| Error::transfer(key, e.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(size);
            }
            let body = response.text().await.unwrap_or_default();
            Err(self.classify_put(key, status, &body))
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
    use chrono::TimeZone;

    use super::*;

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn environment_credentials_win() {
        let env = env_of(&[
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_SESSION_TOKEN", "token"),
        ]);
        let creds = resolve_credentials_with(&S3Settings::default(), &env).unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert!(creds.session_token.is_some());
    }

    #[test]
    fn shared_file_profile_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(
            &path,
            "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = s1\n\n\
             [ci]\naws_access_key_id=AKIDCI\naws_secret_access_key=s2\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let env = move |name: &str| match name {
            "AWS_SHARED_CREDENTIALS_FILE" => Some(path_str.clone()),
            "AWS_PROFILE" => Some("ci".to_string()),
            _ => None,
        };
        let creds = resolve_credentials_with(&S3Settings::default(), &env).unwrap();
        assert_eq!(creds.access_key_id, "AKIDCI");

        let settings = S3Settings {
            profile: Some("default".to_string()),
            ..S3Settings::default()
        };
        let creds = resolve_credentials_with(&settings, &env).unwrap();
        assert_eq!(creds.access_key_id, "AKIDDEFAULT");
    }

    #[test]
    fn missing_credentials_carry_guidance() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_string_lossy().into_owned();
        let env = move |name: &str| (name == "HOME").then(|| home.clone());
        let err = resolve_credentials_with(&S3Settings::default(), &env).unwrap_err();
        assert!(matches!(err, Error::CredentialResolution { .. }));
        assert!(err.to_string().contains("AWS_ACCESS_KEY_ID"));
    }

    #[test]
    fn region_precedence() {
        let env = env_of(&[("AWS_DEFAULT_REGION", "eu-west-1")]);
        assert_eq!(resolve_region(&S3Settings::default(), &env), "eu-west-1");
        let settings = S3Settings {
            region: Some("ap-south-1".to_string()),
            ..S3Settings::default()
        };
        assert_eq!(resolve_region(&settings, &env), "ap-south-1");
        assert_eq!(resolve_region(&S3Settings::default(), &env_of(&[])), "us-east-1");
    }

    #[test]
    fn urls_pick_addressing_style() {
        let url = object_url(None, "us-east-1", "mybucket", Some("a b+.txt")).unwrap();
        assert_eq!(url.as_str(), "https://mybucket.s3.us-east-1.amazonaws.com/a%20b%2B.txt");

        let url = object_url(None, "us-east-1", "my.bucket", None).unwrap();
        assert_eq!(url.as_str(), "https://s3.us-east-1.amazonaws.com/my.bucket/");

        let url = object_url(Some("http://127.0.0.1:9000/"), "us-east-1", "b", Some("x")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/b/x");
        assert_eq!(host_header(&url), "127.0.0.1:9000");
    }

    #[test]
    fn signature_is_stable_and_scoped() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: SecretString::new("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            session_token: None,
        };
        let signer = Signer {
            credentials: &creds,
            region: "us-east-1",
        };
        let url = object_url(None, "us-east-1", "examplebucket", Some("test.txt")).unwrap();
        let now = Utc.with_ymd_and_hms(2013, 5, 24, 0, 0, 0).unwrap();

        let a = signer.sign("PUT", &url, now);
        let b = signer.sign("PUT", &url, now);
        assert_eq!(a, b);
        assert_eq!(a["x-amz-date"], "20130524T000000Z");
        assert_eq!(a["x-amz-content-sha256"], UNSIGNED_PAYLOAD);

        let auth = &a["authorization"];
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20130524/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        assert!(!auth.contains("wJalrXUtnFEMI"));
        let signature = auth.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        let other = signer.sign("HEAD", &url, now);
        assert_ne!(other["authorization"], a["authorization"]);
    }

    #[test]
    fn session_token_is_signed() {
        let creds = AwsCredentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: SecretString::new("s".to_string()),
            session_token: Some(SecretString::new("tok".to_string())),
        };
        let signer = Signer {
            credentials: &creds,
            region: "eu-central-1",
        };
        let url = object_url(None, "eu-central-1", "bucket", None).unwrap();
        let headers = signer.sign("HEAD", &url, Utc::now());
        assert_eq!(headers["x-amz-security-token"], "tok");
        assert!(headers["authorization"].contains("x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn error_codes_are_read_from_xml() {
        let body = "<?xml version=\"1.0\"?><Error><Code>NoSuchBucket</Code><Message>x</Message></Error>";
        assert_eq!(error_code(body), Some("NoSuchBucket"));
        assert_eq!(error_code("not xml"), None);
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        let url = url::Url::parse("https://h/b?uploads&a=1").unwrap();
        assert_eq!(canonical_query(&url), "a=1&uploads=");
    }

    /// One request as the stub server saw it.
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        authorization: String,
        body_len: usize,
    }

    /// Minimal HTTP/1.1 endpoint answering each request with `respond`.
    async fn stub_endpoint(
        respond: fn(&str) -> (u16, &'static str),
    ) -> (String, std::sync::Arc<std::sync::Mutex<Vec<Seen>>>) {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let log = log.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let mut parts = request_line.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();
                    let mut content_length = 0usize;
                    let mut authorization = String::new();
                    loop {
                        let mut line = String::new();
                        reader.read_line(&mut line).await.unwrap();
                        let line = line.trim_end();
                        if line.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = line.split_once(':') {
                            match name.to_ascii_lowercase().as_str() {
                                "content-length" => {
                                    content_length = value.trim().parse().unwrap()
                                }
                                "authorization" => authorization = value.trim().to_string(),
                                _ => {}
                            }
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    reader.read_exact(&mut body).await.unwrap();

                    let (status, reply) = respond(&method);
                    log.lock().unwrap().push(Seen {
                        method,
                        path,
                        authorization,
                        body_len: body.len(),
                    });
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    let mut socket = reader.into_inner();
                    socket.write_all(response.as_bytes()).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });
        (endpoint, seen)
    }

    fn session_for(endpoint: String) -> S3Session {
        let settings = S3Settings {
            region: Some("eu-west-1".to_string()),
            endpoint_url: Some(endpoint),
            profile: None,
        };
        let env = env_of(&[
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI"),
        ]);
        let dest = DestinationSpec::parse("s3:drop-bucket").unwrap();
        S3Session::open_with(&dest, &settings, reqwest::Client::new(), &env).unwrap()
    }

    #[tokio::test]
    async fn upload_streams_body_and_reports_deltas() {
        let (endpoint, seen) = stub_endpoint(|_| (200, "")).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report 1.csv");
        std::fs::write(&local, vec![b'x'; 150_000]).unwrap();

        let recorder = crate::progress::testing::Recorder::default();
        let mut tracker = ProgressTracker::new("s3:drop-bucket", Some(&recorder));
        tracker.begin_file("report 1.csv", 150_000);

        let mut session = session_for(endpoint);
        let location = session.ensure_remote_path("").await.unwrap();
        assert_eq!(location, "s3://drop-bucket/");
        let sent = session
            .put_file(&local, "report 1.csv", &mut tracker)
            .await
            .unwrap();
        tracker.finish();

        assert_eq!(sent, 150_000);
        assert_eq!(recorder.updates().last(), Some(&150_000));
        assert_eq!(recorder.completions(), 1);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].method.as_str(), seen[0].path.as_str()), ("HEAD", "/drop-bucket/"));
        assert_eq!(seen[1].method, "PUT");
        assert_eq!(seen[1].path, "/drop-bucket/report%201.csv");
        assert_eq!(seen[1].body_len, 150_000);
        assert!(seen[1].authorization.starts_with(ALGORITHM));
        assert!(seen[1].authorization.contains("AKIDEXAMPLE/"));
        assert!(!seen[1].authorization.contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn forbidden_bucket_is_access_or_not_found() {
        let (endpoint, _) = stub_endpoint(|_| (403, "")).await;
        let mut session = session_for(endpoint);
        let err = session.ensure_remote_path("").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AccessOrNotFound);
    }

    #[tokio::test]
    async fn rejected_put_is_classified_from_the_error_body() {
        let (endpoint, _) = stub_endpoint(|method| match method {
            "PUT" => (
                403,
                "<Error><Code>SignatureDoesNotMatch</Code></Error>",
            ),
            _ => (200, ""),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"abc").unwrap();
        let mut tracker = ProgressTracker::new("s3:drop-bucket", None);
        tracker.begin_file("a.bin", 3);

        let mut session = session_for(endpoint);
        session.ensure_remote_path("").await.unwrap();
        let err = session.put_file(&local, "a.bin", &mut tracker).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Authentication);
        assert!(err.to_string().contains("SignatureDoesNotMatch"));
    }

    #[tokio::test]
    async fn server_error_on_put_is_transfer_error() {
        let (endpoint, _) = stub_endpoint(|method| match method {
            "PUT" => (500, ""),
            _ => (200, ""),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"abc").unwrap();
        let mut tracker = ProgressTracker::new("s3:drop-bucket", None);
        tracker.begin_file("a.bin", 3);

        let mut session = session_for(endpoint);
        let err = session.put_file(&local, "a.bin", &mut tracker).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transfer);
    }
}
