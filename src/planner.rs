use serde::Serialize;
use std::fmt;

use crate::probe::InstallState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    FreshInstall,
    StartExisting,
    ResumeInstall,
    OfferCleanReinstall,
    AlreadyRunning,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreshInstall => "fresh_install",
            Self::StartExisting => "start_existing",
            Self::ResumeInstall => "resume_install",
            Self::OfferCleanReinstall => "offer_clean_reinstall",
            Self::AlreadyRunning => "already_running",
        }
    }

    /// Whether the action runs the interactive installer and so needs answers.
    pub fn drives_installer(&self) -> bool {
        matches!(
            self,
            Self::FreshInstall | Self::ResumeInstall | Self::OfferCleanReinstall
        )
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::FreshInstall => "install from scratch",
            Self::StartExisting => "start the existing installation",
            Self::ResumeInstall => "resume the interrupted installer run",
            Self::OfferCleanReinstall => "remove the damaged installation and reinstall",
            Self::AlreadyRunning => "nothing to do, the workload is running",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn plan(state: InstallState) -> Action {
    match state {
        InstallState::NotInstalled => Action::FreshInstall,
        InstallState::InstalledRunning => Action::AlreadyRunning,
        InstallState::InstalledStopped => Action::StartExisting,
        InstallState::DataIncomplete => Action::ResumeInstall,
        InstallState::ScriptMissing | InstallState::Corrupted => Action::OfferCleanReinstall,
    }
}
