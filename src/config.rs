//! Configuration: work-root layout, SMTP credentials, signature, and
//! dispatch tunables.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use ini::{EscapePolicy, Ini, ParseOption, WriteOption};
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// File names anchored at the work root.
pub mod paths {
    use std::path::{Path, PathBuf};

    pub const SMTP_CONFIG: &str = "smtp_config.ini";
    pub const SIGNATURE: &str = "Signature.txt";
    pub const ADDRESS_TABLE: &str = "EmailAddress.csv";
    pub const LOG: &str = "email_smtp_log.log";
    /// Developer override directory, consulted before the work root.
    pub const DEV_DIR: &str = "dev";

    fn dev_first(work_root: &Path, filename: &str) -> PathBuf {
        let dev = work_root.join(DEV_DIR).join(filename);
        if dev.exists() {
            dev
        } else {
            work_root.join(filename)
        }
    }

    pub fn smtp_config(work_root: &Path) -> PathBuf {
        dev_first(work_root, SMTP_CONFIG)
    }

    pub fn signature(work_root: &Path) -> PathBuf {
        dev_first(work_root, SIGNATURE)
    }

    pub fn address_table(work_root: &Path) -> PathBuf {
        work_root.join(ADDRESS_TABLE)
    }

    pub fn log_file(work_root: &Path) -> PathBuf {
        work_root.join(LOG)
    }
}

/// Directory and file naming conventions inside the work root.
pub mod layout {
    /// Project directories end with this marker.
    pub const PROJECT_SUFFIX: &str = "项目";
    /// Attachments waiting to be sent.
    pub const PENDING_DIR: &str = "待外发";
    /// Attachments already sent.
    pub const SENT_DIR: &str = "已外发";
    /// Attachments whose email exhausted its retries. Created lazily.
    pub const FAILED_DIR: &str = "failed";
    /// Eligible attachment extension.
    pub const ATTACHMENT_EXT: &str = ".xlsx";
    /// Appended to the project name to form the subject line.
    pub const SUBJECT_SUFFIX: &str = "零件供货方式确认";
}

const SMTP_SECTION: &str = "smtp";
const DEFAULT_SMTP_HOST: &str = "smtp.csvw.com";
const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP connection parameters. The password is never logged.
#[derive(Clone)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for SmtpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl SmtpEndpoint {
    /// Host and username must both be present before a run may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingSmtp("host is empty".into()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::MissingSmtp("username is empty".into()));
        }
        Ok(())
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Build from the raw `[smtp]` section, applying defaults.
    fn from_section(section: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| section.get(key).map(|v| v.trim()).unwrap_or_default();

        let port = match section.get("port").map(|v| v.trim()) {
            None | Some("") => DEFAULT_SMTP_PORT,
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "port".into(),
                message: format!("'{raw}' is not a valid port"),
            })?,
        };

        Ok(Self {
            host: get("host").to_string(),
            port,
            use_ssl: parse_flag(section.get("use_ssl"), false),
            use_tls: parse_flag(section.get("use_tls"), true),
            username: get("username").to_string(),
            password: SecretString::from(get("password").to_string()),
        })
    }
}

fn parse_flag(value: Option<&String>, default: bool) -> bool {
    match value.map(|v| v.trim()) {
        None | Some("") => default,
        Some(v) => v.eq_ignore_ascii_case("true"),
    }
}

/// Parsed INI file: section → key → value.
type IniSections = BTreeMap<String, BTreeMap<String, String>>;

/// Values are kept byte for byte: no quote stripping, no escape handling.
fn read_ini(path: &Path) -> Result<IniSections, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let option = ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    };
    let parsed = Ini::load_from_str_opt(&content, option).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut sections = IniSections::new();
    for (name, properties) in parsed.iter() {
        // Keys outside any section are not used.
        let Some(name) = name else {
            continue;
        };
        let entries = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sections.insert(name.to_string(), entries);
    }
    Ok(sections)
}

fn write_ini(path: &Path, sections: &IniSections) -> Result<(), ConfigError> {
    let mut ini = Ini::new();
    for (name, entries) in sections {
        let mut section = ini.with_section(Some(name.as_str()));
        for (key, value) in entries {
            section.set(key.as_str(), value.as_str());
        }
    }
    let option = WriteOption {
        escape_policy: EscapePolicy::Nothing,
        ..WriteOption::default()
    };
    ini.write_to_file_opt(path, option)?;
    Ok(())
}

/// Load SMTP parameters from the work root. `Ok(None)` when the file or
/// its `[smtp]` section is absent.
pub fn load_smtp_endpoint(work_root: &Path) -> Result<Option<SmtpEndpoint>, ConfigError> {
    let path = paths::smtp_config(work_root);
    if !path.exists() {
        return Ok(None);
    }
    let sections = read_ini(&path)?;
    match sections.get(SMTP_SECTION) {
        Some(section) => SmtpEndpoint::from_section(section).map(Some),
        None => Ok(None),
    }
}

/// Store SMTP credentials, keeping any other keys and filling connection
/// defaults that are not yet set.
pub fn save_smtp_credentials(
    work_root: &Path,
    username: &str,
    password: &str,
) -> Result<String, ConfigError> {
    let path = paths::smtp_config(work_root);
    let mut sections = if path.exists() {
        read_ini(&path)?
    } else {
        IniSections::new()
    };

    let section = sections.entry(SMTP_SECTION.to_string()).or_default();
    for (key, default) in [
        ("host", DEFAULT_SMTP_HOST.to_string()),
        ("port", DEFAULT_SMTP_PORT.to_string()),
        ("use_ssl", "false".to_string()),
        ("use_tls", "true".to_string()),
    ] {
        let entry = section.entry(key.to_string()).or_default();
        if entry.trim().is_empty() {
            *entry = default;
        }
    }
    section.insert("username".into(), username.trim().to_string());
    section.insert("password".into(), password.trim().to_string());

    write_ini(&path, &sections)?;
    tracing::info!(path = %path.display(), "SMTP credentials saved");
    Ok("SMTP credentials saved".to_string())
}

/// Signature appended to every email body. Empty when absent or unreadable.
pub fn load_signature(work_root: &Path) -> String {
    let path = paths::signature(work_root);
    std::fs::read_to_string(&path).unwrap_or_default()
}

pub fn save_signature(work_root: &Path, content: &str) -> Result<String, ConfigError> {
    let path = paths::signature(work_root);
    std::fs::write(&path, content)?;
    Ok("Signature saved".to_string())
}

/// Pacing and retry tunables for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Nominal gap between two sends (holds the emails-per-minute ceiling).
    pub send_interval: Duration,
    /// Uniform jitter applied to `send_interval` in both directions.
    pub send_jitter: Duration,
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts, scaled by `retry_jitter`.
    pub retry_base_delay: Duration,
    /// Range of the multiplicative retry jitter.
    pub retry_jitter: (f64, f64),
    /// Smoothing factor for the throughput average.
    pub ema_alpha: f64,
    /// SMTP command timeout.
    pub smtp_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_secs(12),
            send_jitter: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_jitter: (0.8, 1.2),
            ema_alpha: 0.3,
            smtp_timeout: Duration::from_secs(60),
        }
    }
}
