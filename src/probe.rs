use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::docker::{running_containers, DockerRunner};

/// Point-in-time classification of the host. Always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    NotInstalled,
    ScriptMissing,
    DataIncomplete,
    InstalledStopped,
    InstalledRunning,
    Corrupted,
}

impl InstallState {
    pub const ALL: [InstallState; 6] = [
        Self::NotInstalled,
        Self::ScriptMissing,
        Self::DataIncomplete,
        Self::InstalledStopped,
        Self::InstalledRunning,
        Self::Corrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::ScriptMissing => "script_missing",
            Self::DataIncomplete => "data_incomplete",
            Self::InstalledStopped => "installed_stopped",
            Self::InstalledRunning => "installed_running",
            Self::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw facts gathered from the host. Later fields are only filled in when the
/// earlier ones are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub account_exists: bool,
    pub install_dir: bool,
    pub installer_script: bool,
    pub data_dir: bool,
    pub running_containers: Vec<String>,
    pub workload_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

#[derive(Debug)]
struct ProbeFault(String);

fn inspect(path: &Path, want_dir: bool) -> Result<bool, ProbeFault> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() == want_dir => Ok(true),
        Ok(_) => Err(ProbeFault(format!(
            "{} exists but is not a {}",
            path.display(),
            if want_dir { "directory" } else { "file" }
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ProbeFault(format!("cannot inspect {}: {err}", path.display()))),
    }
}

fn account_in_passwd(passwd: &Path, account: &str) -> Result<bool, ProbeFault> {
    match fs::read_to_string(passwd) {
        Ok(text) => Ok(text
            .lines()
            .filter_map(|line| line.split(':').next())
            .any(|name| name == account)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ProbeFault(format!(
            "cannot read {}: {err}",
            passwd.display()
        ))),
    }
}

/// Maps observed facts to a state. Evaluation order is fixed and
/// short-circuits on the first absence.
pub fn classify(obs: &Observation) -> InstallState {
    if obs.fault.is_some() {
        return InstallState::Corrupted;
    }
    if !obs.install_dir {
        return InstallState::NotInstalled;
    }
    if !obs.installer_script {
        return InstallState::ScriptMissing;
    }
    if !obs.data_dir {
        return InstallState::DataIncomplete;
    }
    if !obs.workload_running {
        return InstallState::InstalledStopped;
    }
    InstallState::InstalledRunning
}

pub struct StatusProbe<'a, R: DockerRunner> {
    host: &'a HostConfig,
    expected_containers: &'a [String],
    runner: &'a R,
}

impl<'a, R: DockerRunner> StatusProbe<'a, R> {
    pub fn new(host: &'a HostConfig, expected_containers: &'a [String], runner: &'a R) -> Self {
        Self {
            host,
            expected_containers,
            runner,
        }
    }

    pub fn paths(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("install_root", self.host.install_root()),
            ("installer_script", self.host.installer_script_path()),
            ("data_dir", self.host.data_dir_path()),
            ("settings_file", self.host.settings_file_path()),
            ("completion_artifact", self.host.completion_artifact_path()),
        ]
    }

    /// Read-only inspection. Never fails: a fault is recorded on the
    /// observation and classifies as `Corrupted`.
    pub fn observe(&self) -> Observation {
        let mut obs = Observation::default();
        if let Err(ProbeFault(fault)) = self.fill(&mut obs) {
            warn!(fault = %fault, "host inspection failed");
            obs.fault = Some(fault);
        }
        obs
    }

    fn fill(&self, obs: &mut Observation) -> Result<(), ProbeFault> {
        obs.account_exists = account_in_passwd(
            Path::new(&self.host.passwd_file),
            &self.host.service_account,
        )?;
        obs.install_dir = inspect(&self.host.install_root(), true)?;
        if !obs.install_dir {
            return Ok(());
        }
        obs.installer_script = inspect(&self.host.installer_script_path(), false)?;
        if !obs.installer_script {
            return Ok(());
        }
        obs.data_dir = inspect(&self.host.data_dir_path(), true)?;
        if !obs.data_dir {
            return Ok(());
        }
        match running_containers(self.runner, &self.host.container_filter, &self.host.install_root()) {
            Ok(names) => {
                obs.workload_running = workload_running(&names, self.expected_containers);
                obs.running_containers = names;
            }
            Err(err) => {
                // Runtime unreachable: treat as stopped, the start step reports why.
                warn!(error = %err, "could not list workload containers");
            }
        }
        Ok(())
    }

    pub fn probe(&self) -> InstallState {
        let obs = self.observe();
        let state = classify(&obs);
        debug!(state = %state, observation = ?obs, "probed host");
        state
    }
}

/// With no expected names configured, any matching container counts.
pub fn workload_running(names: &[String], expected: &[String]) -> bool {
    if expected.is_empty() {
        return !names.is_empty();
    }
    expected.iter().all(|want| names.iter().any(|name| name == want))
}
