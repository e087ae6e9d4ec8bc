use std::path::PathBuf;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid path {path:?}: {message}")]
    InvalidPath { path: PathBuf, message: String },

    #[error("malformed destination spec {entry:?}: {message}")]
    MalformedSpec { entry: String, message: String },

    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("authentication on {host} failed: {message}")]
    Authentication { host: String, message: String },

    #[error("remote path {path:?} unavailable: {message}")]
    RemotePath { path: String, message: String },

    #[error("object storage credentials could not be resolved: {message}")]
    CredentialResolution { message: String },

    #[error("bucket {bucket:?} does not exist or access was denied: {message}")]
    AccessOrNotFound { bucket: String, message: String },

    #[error("transfer of {file:?} failed: {message}")]
    Transfer { file: String, message: String },

    #[error("command on {host} failed: {message}")]
    Command { host: String, message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    MalformedSpec,
    Connection,
    Authentication,
    RemotePath,
    CredentialResolution,
    AccessOrNotFound,
    Transfer,
    Command,
    InvalidConfig,
    Io,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::MalformedSpec { .. } => ErrorKind::MalformedSpec,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::RemotePath { .. } => ErrorKind::RemotePath,
            Self::CredentialResolution { .. } => ErrorKind::CredentialResolution,
            Self::AccessOrNotFound { .. } => ErrorKind::AccessOrNotFound,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Command { .. } => ErrorKind::Command,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::Io(_) => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn connection(host: &str, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn authentication(host: &str, message: impl Into<String>) -> Self {
        Self::Authentication {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn remote_path(path: &str, message: impl Into<String>) -> Self {
        Self::RemotePath {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn transfer(file: &str, message: impl Into<String>) -> Self {
        Self::Transfer {
            file: file.to_string(),
            message: message.into(),
        }
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPath => "invalid_path",
            Self::MalformedSpec => "malformed_spec",
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::RemotePath => "remote_path",
            Self::CredentialResolution => "credential_resolution",
            Self::AccessOrNotFound => "access_or_not_found",
            Self::Transfer => "transfer",
            Self::Command => "command",
            Self::InvalidConfig => "invalid_config",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
