use clap::ValueEnum;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password, Select};
use dirs::home_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub host: HostConfig,
    pub install: InstallAnswers,
    pub installer: InstallerConfig,
    pub readiness: ReadinessConfig,
}

/// Where the workload lives on the host. Relative paths resolve against
/// `install_root`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub service_account: String,
    pub install_root: String,
    pub installer_script: String,
    pub installer_url: String,
    pub data_dir: String,
    pub settings_file: String,
    pub completion_artifact: String,
    pub passwd_file: String,
    pub container_filter: String,
    pub log_file: String,
    pub lock_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    LetsEncrypt,
    SelfSigned,
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Us,
    Eu,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Eu => "EU",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub username: String,
    pub password: String,
    pub admin_email: String,
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("admin_email", &self.admin_email)
            .finish()
    }
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            ssl: false,
            username: String::new(),
            password: String::new(),
            admin_email: String::new(),
        }
    }
}

/// Answers as they appear in the config file. Empty strings mean "not given yet".
#[derive(Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct InstallAnswers {
    pub domain: String,
    pub tls: TlsMode,
    pub email: String,
    pub installation_id: String,
    pub installation_key: String,
    pub region: Region,
    pub database_name: String,
    pub smtp: Option<SmtpSettings>,
}

impl fmt::Debug for InstallAnswers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallAnswers")
            .field("domain", &self.domain)
            .field("tls", &self.tls)
            .field("email", &self.email)
            .field("installation_id", &self.installation_id)
            .field("installation_key", &"<redacted>")
            .field("region", &self.region)
            .field("database_name", &self.database_name)
            .field("smtp", &self.smtp)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    pub run_as_service_account: bool,
    /// Run the script through this program (e.g. `bash`) instead of exec'ing it.
    pub interpreter: String,
    pub subcommand: String,
    pub prompt_timeout_sec: u64,
    pub completion_timeout_sec: u64,
    pub success_pattern: String,
    pub error_signatures: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    pub interval_sec: u64,
    pub max_attempts: u32,
    pub http_url: String,
    pub success_codes: Vec<u16>,
    pub expected_containers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            host: HostConfig::default(),
            install: InstallAnswers::default(),
            installer: InstallerConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            service_account: "bitwarden".to_string(),
            install_root: "/opt/bitwarden".to_string(),
            installer_script: "bitwarden.sh".to_string(),
            installer_url: "https://func.bitwarden.com/api/dl/?app=self-host&platform=linux"
                .to_string(),
            data_dir: "bwdata".to_string(),
            settings_file: "bwdata/env/global.override.env".to_string(),
            completion_artifact: "bwdata/config.yml".to_string(),
            passwd_file: "/etc/passwd".to_string(),
            container_filter: "bitwarden".to_string(),
            log_file: "/var/log/vaultwright/install.log".to_string(),
            lock_file: "/run/vaultwright.lock".to_string(),
        }
    }
}

impl Default for InstallAnswers {
    fn default() -> Self {
        Self {
            domain: String::new(),
            tls: TlsMode::LetsEncrypt,
            email: String::new(),
            installation_id: String::new(),
            installation_key: String::new(),
            region: Region::Us,
            database_name: "vault".to_string(),
            smtp: None,
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            run_as_service_account: true,
            interpreter: String::new(),
            subcommand: "install".to_string(),
            prompt_timeout_sec: 120,
            completion_timeout_sec: 1_800,
            success_pattern: "(?i)installation complete|setup complete".to_string(),
            error_signatures: vec![
                r"(?i)\berror\b".to_string(),
                r"(?i)\bfailed\b".to_string(),
                "(?i)permission denied".to_string(),
            ],
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_sec: 5,
            max_attempts: 36,
            http_url: "http://127.0.0.1".to_string(),
            success_codes: vec![200, 301, 302, 307, 308],
            expected_containers: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn install_root(&self) -> PathBuf {
        PathBuf::from(&self.install_root)
    }

    fn under_root(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.install_root().join(path)
        }
    }

    pub fn installer_script_path(&self) -> PathBuf {
        self.under_root(&self.installer_script)
    }

    pub fn data_dir_path(&self) -> PathBuf {
        self.under_root(&self.data_dir)
    }

    pub fn settings_file_path(&self) -> PathBuf {
        self.under_root(&self.settings_file)
    }

    pub fn completion_artifact_path(&self) -> PathBuf {
        self.under_root(&self.completion_artifact)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.under_root(&self.log_file)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.under_root(&self.lock_file)
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("VAULTWRIGHT_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("vaultwright");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    default_config_dir().join("config.yaml")
}

pub fn read_config_from_str(content: &str) -> Result<Config, ProvisionError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(ProvisionError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// A missing config file is not an error: the embedded defaults apply.
pub fn read_config(path: &Path) -> Result<Config, ProvisionError> {
    match fs::read_to_string(path) {
        Ok(content) => read_config_from_str(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            read_config_from_str(DEFAULT_CONFIG_YAML)
        }
        Err(err) => Err(ProvisionError::Io(err)),
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), ProvisionError> {
    if cfg.host.service_account.trim().is_empty() {
        return Err(ProvisionError::Config(
            "host.service_account must not be empty".to_string(),
        ));
    }
    if cfg.host.container_filter.trim().is_empty() {
        return Err(ProvisionError::Config(
            "host.container_filter must not be empty".to_string(),
        ));
    }
    if !Path::new(&cfg.host.install_root).is_absolute() {
        return Err(ProvisionError::Config(format!(
            "host.install_root must be absolute (got '{}')",
            cfg.host.install_root
        )));
    }
    if cfg.readiness.max_attempts == 0 {
        return Err(ProvisionError::Config(
            "readiness.max_attempts must be at least 1".to_string(),
        ));
    }
    if cfg.installer.prompt_timeout_sec == 0 || cfg.installer.completion_timeout_sec == 0 {
        return Err(ProvisionError::Config(
            "installer timeouts must be greater than zero".to_string(),
        ));
    }
    if cfg.installer.subcommand.trim().is_empty() {
        return Err(ProvisionError::Config(
            "installer.subcommand must not be empty".to_string(),
        ));
    }
    let patterns = std::iter::once(&cfg.installer.success_pattern)
        .chain(cfg.installer.error_signatures.iter());
    for pattern in patterns {
        Regex::new(pattern).map_err(|err| {
            ProvisionError::Config(format!("invalid installer pattern '{pattern}': {err}"))
        })?;
    }
    if let Some(code) = cfg
        .readiness
        .success_codes
        .iter()
        .find(|code| !(100..=599).contains(*code))
    {
        return Err(ProvisionError::Config(format!(
            "readiness.success_codes contains invalid HTTP status {code}"
        )));
    }
    Ok(())
}

/// Opaque credentials issued by the vendor for a self-hosted installation.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationCredentials {
    pub id: String,
    pub key: String,
}

impl fmt::Debug for InstallationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationCredentials")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Answers for one run, validated and frozen. Built once by an [`AnswerSource`]
/// and only ever passed around by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationConfig {
    pub domain: String,
    pub tls: TlsMode,
    pub email: String,
    pub credentials: InstallationCredentials,
    pub region: Region,
    pub database_name: String,
    pub smtp: Option<SmtpSettings>,
}

impl InstallationConfig {
    pub fn from_answers(answers: &InstallAnswers) -> Result<Self, ProvisionError> {
        let missing = missing_fields(answers);
        if !missing.is_empty() {
            return Err(ProvisionError::Config(format!(
                "missing installation answers: {} (set them in the config file or pass flags)",
                missing.join(", ")
            )));
        }
        if let Some(smtp) = &answers.smtp {
            validate_smtp(smtp)?;
        }
        Ok(Self {
            domain: answers.domain.trim().to_string(),
            tls: answers.tls,
            email: answers.email.trim().to_string(),
            credentials: InstallationCredentials {
                id: answers.installation_id.trim().to_string(),
                key: answers.installation_key.trim().to_string(),
            },
            region: answers.region,
            database_name: answers.database_name.trim().to_string(),
            smtp: answers.smtp.clone(),
        })
    }
}

fn missing_fields(answers: &InstallAnswers) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if answers.domain.trim().is_empty() {
        missing.push("domain");
    }
    if answers.tls == TlsMode::LetsEncrypt && answers.email.trim().is_empty() {
        missing.push("email");
    }
    if answers.installation_id.trim().is_empty() {
        missing.push("installation_id");
    }
    if answers.installation_key.trim().is_empty() {
        missing.push("installation_key");
    }
    if answers.database_name.trim().is_empty() {
        missing.push("database_name");
    }
    missing
}

pub fn validate_smtp(smtp: &SmtpSettings) -> Result<(), ProvisionError> {
    if smtp.host.trim().is_empty() {
        return Err(ProvisionError::Config("smtp.host must not be empty".to_string()));
    }
    if smtp.port == 0 {
        return Err(ProvisionError::Config("smtp.port must not be zero".to_string()));
    }
    if smtp.admin_email.trim().is_empty() {
        return Err(ProvisionError::Config(
            "smtp.admin_email must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct AnswerOverrides {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub tls: Option<TlsMode>,
    pub region: Option<Region>,
    pub installation_id: Option<String>,
    pub installation_key: Option<String>,
    pub smtp_password: Option<String>,
}

impl InstallAnswers {
    pub fn with_overrides(mut self, overrides: &AnswerOverrides) -> Self {
        if let Some(domain) = &overrides.domain {
            self.domain = domain.clone();
        }
        if let Some(email) = &overrides.email {
            self.email = email.clone();
        }
        if let Some(tls) = overrides.tls {
            self.tls = tls;
        }
        if let Some(region) = overrides.region {
            self.region = region;
        }
        if let Some(id) = &overrides.installation_id {
            self.installation_id = id.clone();
        }
        if let Some(key) = &overrides.installation_key {
            self.installation_key = key.clone();
        }
        if let (Some(smtp), Some(password)) = (self.smtp.as_mut(), &overrides.smtp_password) {
            smtp.password = password.clone();
        }
        self
    }
}

/// Supplies the run's [`InstallationConfig`]. Only asked when the planned
/// action actually drives the installer.
pub trait AnswerSource {
    fn collect(&self) -> Result<InstallationConfig, ProvisionError>;
}

impl AnswerSource for InstallationConfig {
    fn collect(&self) -> Result<InstallationConfig, ProvisionError> {
        Ok(self.clone())
    }
}

pub struct PromptingAnswers {
    draft: InstallAnswers,
    interactive: bool,
}

impl PromptingAnswers {
    pub fn new(draft: InstallAnswers, interactive: bool) -> Self {
        Self { draft, interactive }
    }
}

impl AnswerSource for PromptingAnswers {
    fn collect(&self) -> Result<InstallationConfig, ProvisionError> {
        if !self.interactive || missing_fields(&self.draft).is_empty() {
            return InstallationConfig::from_answers(&self.draft);
        }
        let theme = ColorfulTheme::default();
        let mut answers = self.draft.clone();
        if answers.domain.trim().is_empty() {
            answers.domain = Input::<String>::with_theme(&theme)
                .with_prompt("Domain name for this installation")
                .interact_text()?;
        }
        // No contact email yet: confirm the operator really wants Let's Encrypt.
        if answers.tls == TlsMode::LetsEncrypt && answers.email.trim().is_empty() {
            let modes = ["Let's Encrypt", "Self-signed certificate", "No TLS"];
            answers.tls = match Select::with_theme(&theme)
                .with_prompt("TLS certificate")
                .items(&modes)
                .default(0)
                .interact()?
            {
                0 => TlsMode::LetsEncrypt,
                1 => TlsMode::SelfSigned,
                _ => TlsMode::None,
            };
        }
        if answers.tls == TlsMode::LetsEncrypt && answers.email.trim().is_empty() {
            answers.email = Input::<String>::with_theme(&theme)
                .with_prompt("Contact email for certificate notices")
                .interact_text()?;
        }
        if answers.installation_id.trim().is_empty() {
            answers.installation_id = Input::<String>::with_theme(&theme)
                .with_prompt("Installation id")
                .interact_text()?;
        }
        if answers.installation_key.trim().is_empty() {
            answers.installation_key = Password::with_theme(&theme)
                .with_prompt("Installation key")
                .interact()?;
        }
        if answers.database_name.trim().is_empty() {
            answers.database_name = Input::<String>::with_theme(&theme)
                .with_prompt("Database name")
                .default("vault".to_string())
                .interact_text()?;
        }
        InstallationConfig::from_answers(&answers)
    }
}
