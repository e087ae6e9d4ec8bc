use std::fmt;
use std::path::Path;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Sftp,
    Scp,
    Smb,
    S3,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Ftp,
        Protocol::Sftp,
        Protocol::Scp,
        Protocol::Smb,
        Protocol::S3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::Scp => "scp",
            Self::Smb => "smb",
            Self::S3 => "s3",
        }
    }

    /// Number of `:`-separated fields an entry of this protocol carries.
    pub fn arity(self) -> usize {
        match self {
            Self::S3 => 2,
            _ => 5,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ftp" => Some(Self::Ftp),
            "sftp" => Some(Self::Sftp),
            "scp" => Some(Self::Scp),
            "smb" | "cifs" => Some(Self::Smb),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }

    /// Object storage entries carry no host login.
    pub fn is_object_storage(self) -> bool {
        matches!(self, Self::S3)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Username plus secret. The secret is redacted from `Debug` output.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    secret: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: SecretString::new(secret.into()),
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.expose_secret().is_empty()
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.username.clone(), self.secret.expose_secret().clone())
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.secret.expose_secret() == other.secret.expose_secret()
    }
}

impl Eq for Credentials {}

/// One parsed destination entry.
///
/// For `s3` the host is empty, `remote_path` holds the bucket and credentials
/// are absent (they come from the ambient provider chain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    pub protocol: Protocol,
    pub host: String,
    pub remote_path: String,
    pub credentials: Option<Credentials>,
}

impl DestinationSpec {
    pub fn parse(entry: &str) -> Result<Self> {
        let malformed = |message: String| Error::MalformedSpec {
            entry: redact_entry(entry),
            message,
        };

        let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
        let protocol = Protocol::from_name(fields[0])
            .ok_or_else(|| malformed(format!("unknown protocol {:?}", fields[0])))?;
        if fields.len() != protocol.arity() {
            return Err(malformed(format!(
                "{protocol} expects {} fields, found {}",
                protocol.arity(),
                fields.len()
            )));
        }

        if protocol == Protocol::S3 {
            let bucket = fields[1];
            if bucket.is_empty() {
                return Err(malformed("bucket name is empty".to_string()));
            }
            if let Err(message) = check_bucket_name(bucket) {
                tracing::warn!(event = "spec.bucket_name", bucket, message, "spec.bucket_name");
            }
            return Ok(Self {
                protocol,
                host: String::new(),
                remote_path: bucket.to_string(),
                credentials: None,
            });
        }

        let (host, remote_path, username, secret) = (fields[1], fields[2], fields[3], fields[4]);
        if host.is_empty() {
            return Err(malformed("host is empty".to_string()));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
            return Err(malformed(format!("invalid host {host:?}")));
        }
        if username.is_empty() {
            tracing::warn!(
                event = "spec.empty_username",
                protocol = %protocol,
                host,
                "spec.empty_username"
            );
        }
        if protocol == Protocol::Smb && smb_share_of(remote_path).is_none() {
            return Err(malformed(
                "smb remote path must start with a share name".to_string(),
            ));
        }

        Ok(Self {
            protocol,
            host: host.to_string(),
            remote_path: remote_path.to_string(),
            credentials: Some(Credentials::new(username, secret)),
        })
    }

    pub fn bucket(&self) -> Option<&str> {
        match self.protocol {
            Protocol::S3 => Some(&self.remote_path),
            _ => None,
        }
    }

    /// Serializes back to the entry grammar, secret included.
    pub fn to_spec_string(&self) -> String {
        match (&self.protocol, &self.credentials) {
            (Protocol::S3, _) => format!("s3:{}", self.remote_path),
            (protocol, Some(c)) => format!(
                "{protocol}:{}:{}:{}:{}",
                self.host,
                self.remote_path,
                c.username,
                c.secret()
            ),
            (protocol, None) => format!("{protocol}:{}:{}::", self.host, self.remote_path),
        }
    }

    /// Display form without the secret, suitable for logs and reports.
    pub fn label(&self) -> String {
        match (&self.protocol, &self.credentials) {
            (Protocol::S3, _) => format!("s3://{}", self.remote_path),
            (protocol, Some(c)) => format!(
                "{protocol}://{}@{}/{}",
                c.username,
                self.host,
                self.remote_path.trim_start_matches('/')
            ),
            (protocol, None) => format!(
                "{protocol}://{}/{}",
                self.host,
                self.remote_path.trim_start_matches('/')
            ),
        }
    }
}

impl FromStr for DestinationSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// S3 naming rules. A violation is only logged; the service has the last word.
fn check_bucket_name(bucket: &str) -> std::result::Result<(), String> {
    if !(3..=63).contains(&bucket.len()) {
        return Err(format!("bucket name {bucket:?} must be 3-63 characters"));
    }
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    let valid_edges = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .is_some_and(|(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric());
    if !valid_chars || !valid_edges {
        return Err(format!("invalid bucket name {bucket:?}"));
    }
    Ok(())
}

/// First segment of an SMB remote path, the share name.
pub(crate) fn smb_share_of(remote_path: &str) -> Option<&str> {
    remote_path
        .trim_start_matches(['/', '\\'])
        .split(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
}

/// Keeps protocol, host and path of a rejected entry and masks the credential fields.
fn redact_entry(entry: &str) -> String {
    let fields: Vec<&str> = entry.split(':').collect();
    if fields.len() > 3 {
        format!("{}:***", fields[..3].join(":").trim())
    } else {
        entry.trim().to_string()
    }
}

#[derive(Debug)]
pub struct RejectedEntry {
    /// 1-based position of the entry in its list.
    pub position: usize,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ParsedSpecs {
    pub specs: Vec<DestinationSpec>,
    pub rejected: Vec<RejectedEntry>,
}

impl ParsedSpecs {
    fn from_entries<'a>(entries: impl Iterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        for (idx, raw) in entries.enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match DestinationSpec::parse(raw) {
                Ok(spec) => out.specs.push(spec),
                Err(error) => {
                    tracing::warn!(
                        event = "spec.rejected",
                        position = idx + 1,
                        error = %error,
                        "spec.rejected"
                    );
                    out.rejected.push(RejectedEntry {
                        position: idx + 1,
                        error,
                    });
                }
            }
        }
        out
    }
}

/// Parses a comma-separated inline list. Each entry is parsed independently.
pub fn parse_inline(input: &str) -> ParsedSpecs {
    ParsedSpecs::from_entries(input.split(','))
}

/// Parses list-file content: one entry per line, blank lines ignored.
pub fn parse_list(text: &str) -> ParsedSpecs {
    ParsedSpecs::from_entries(text.trim_end().split('\n').map(|l| l.trim_end_matches('\r')))
}

pub fn read_list_file(path: &Path) -> Result<ParsedSpecs> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidPath {
        path: path.to_path_buf(),
        message: format!("list file read failed: {e}"),
    })?;
    Ok(parse_list(&text))
}
