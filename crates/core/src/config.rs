use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub ftp: FtpSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub smb: SmbSettings,
    #[serde(default)]
    pub s3: S3Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Destinations transferred at once; 1 keeps the batch sequential.
    pub max_parallel: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtpSettings {
    pub port: u16,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Ask for `PROT P` so file data travels over TLS too.
    #[serde(default)]
    pub protect_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    pub port: u16,
    /// Private key tried when a destination carries no password.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmbSettings {
    pub port: u16,
    pub smbclient: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct S3Settings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_parallel: 1 }
    }
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            port: 21,
            accept_invalid_certs: false,
            protect_data: false,
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            identity_file: None,
        }
    }
}

impl Default for SmbSettings {
    fn default() -> Self {
        Self {
            port: 445,
            smbclient: "smbclient".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            batch: BatchSettings::default(),
            ftp: FtpSettings::default(),
            ssh: SshSettings::default(),
            smb: SmbSettings::default(),
            s3: S3Settings::default(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => {
            let mut s = toml::from_str::<Settings>(text)?;
            normalize_settings(&mut s);
            Ok(s)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

fn normalize_settings(settings: &mut Settings) {
    for v in [
        &mut settings.s3.region,
        &mut settings.s3.endpoint_url,
        &mut settings.s3.profile,
    ] {
        if v.as_deref().is_some_and(|s| s.trim().is_empty()) {
            *v = None;
        }
    }
    if let Some(url) = settings.s3.endpoint_url.as_mut() {
        *url = url.trim().trim_end_matches('/').to_string();
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let invalid = |message: String| Err(Error::InvalidConfig { message });

    if settings.version != SETTINGS_SCHEMA_VERSION {
        return invalid(format!(
            "unsupported settings schema version: {} (expected {SETTINGS_SCHEMA_VERSION})",
            settings.version
        ));
    }
    if !(1..=300).contains(&settings.connect_timeout_secs) {
        return invalid("connect_timeout_secs must be within 1..=300".to_string());
    }
    if !(1..=64).contains(&settings.batch.max_parallel) {
        return invalid("batch.max_parallel must be within 1..=64".to_string());
    }
    for (name, port) in [
        ("ftp.port", settings.ftp.port),
        ("ssh.port", settings.ssh.port),
        ("smb.port", settings.smb.port),
    ] {
        if port == 0 {
            return invalid(format!("{name} must be > 0"));
        }
    }
    if settings.smb.smbclient.trim().is_empty() {
        return invalid("smb.smbclient must not be empty".to_string());
    }
    if settings.smb.timeout_secs == 0 {
        return invalid("smb.timeout_secs must be > 0".to_string());
    }
    if let Some(url) = &settings.s3.endpoint_url {
        match url::Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => {}
            _ => return invalid(format!("s3.endpoint_url is not an http(s) url: {url:?}")),
        }
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
