use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::driver::DriverError;
use crate::envfile::ConfigWriteError;

/// Process exit codes. Each fatal condition gets its own code so monitoring can
/// tell "nothing to do" apart from "needs a human".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    UserDeclined,
    DependencyMissing,
    Timeout,
    CorruptedState,
    Permission,
    ConfigWrite,
    Interrupted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::UserDeclined => 10,
            Self::DependencyMissing => 11,
            Self::Timeout => 12,
            Self::CorruptedState => 13,
            Self::Permission => 14,
            Self::ConfigWrite => 15,
            Self::Interrupted => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::UserDeclined => "user_declined_action",
            Self::DependencyMissing => "dependency_missing",
            Self::Timeout => "timeout",
            Self::CorruptedState => "corrupted_state_needs_manual_intervention",
            Self::Permission => "permission_denied",
            Self::ConfigWrite => "config_write_failed",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("permission error: {message}\nHint: {hint}")]
    Permission { message: String, hint: String },
    #[error("missing dependency: {name}\nHint: {hint}")]
    MissingDependency { name: String, hint: String },
    #[error("installer failed: {0}")]
    Driver(#[from] DriverError),
    #[error("settings update failed: {0}")]
    ConfigWrite(#[from] ConfigWriteError),
    #[error("workload did not become ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },
    #[error("host state is corrupted: {0}; inspect the install root manually, then re-run")]
    Corrupted(String),
    #[error("declined: {0}")]
    Declined(String),
    #[error("interrupted, re-run to resume")]
    Interrupted,
    #[error("another provisioning run holds the lock at {} (pid {holder})", .path.display())]
    Locked { path: PathBuf, holder: String },
}

impl ProvisionError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Permission { .. } => ExitStatus::Permission,
            Self::MissingDependency { .. } => ExitStatus::DependencyMissing,
            Self::Driver(DriverError::PromptTimeout { .. })
            | Self::Driver(DriverError::CompletionTimeout { .. })
            | Self::ReadinessTimeout { .. } => ExitStatus::Timeout,
            Self::Driver(DriverError::Spawn { source, .. })
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                ExitStatus::Permission
            }
            Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                ExitStatus::Permission
            }
            Self::ConfigWrite(_) => ExitStatus::ConfigWrite,
            Self::Corrupted(_) => ExitStatus::CorruptedState,
            Self::Declined(_) => ExitStatus::UserDeclined,
            Self::Interrupted => ExitStatus::Interrupted,
            _ => ExitStatus::Failure,
        }
    }
}
