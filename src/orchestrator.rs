//! Probe → Plan → Execute → Configure → AwaitReadiness → Report.
//!
//! Every run starts from a fresh probe, so an interrupted run is resumed by
//! simply running again. Nothing is rolled back.

use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AnswerSource, Config, InstallationConfig};
use crate::docker::{discover_compose, ensure_socket_access, remove_containers, DockerRunner};
use crate::driver::{default_install_script, DriverSettings, InstallDriver, SessionCommand};
use crate::envfile::{self, ApplyReport};
use crate::error::ProvisionError;
use crate::host::{HostOps, RunLock};
use crate::planner::{plan, Action};
use crate::probe::{InstallState, StatusProbe};
use crate::readiness::{workload_check, ReadinessOutcome, ReadinessWaiter};

/// Yes/no decision for destructive steps.
pub trait ConfirmGate {
    fn confirm(&self, question: &str) -> Result<bool, ProvisionError>;
}

pub struct PromptGate;

impl ConfirmGate for PromptGate {
    fn confirm(&self, question: &str) -> Result<bool, ProvisionError> {
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(false)
            .interact()?)
    }
}

/// Fixed answer: `--yes` approves, `--non-interactive` declines.
pub struct FixedGate(pub bool);

impl ConfirmGate for FixedGate {
    fn confirm(&self, question: &str) -> Result<bool, ProvisionError> {
        info!(question, answer = self.0, "confirmation answered without prompting");
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub strict_readiness: bool,
    pub handle_signals: bool,
    pub use_lock: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub initial_state: InstallState,
    pub action: Action,
    pub final_state: Option<InstallState>,
    pub steps: Vec<String>,
    pub readiness: Option<ReadinessOutcome>,
    pub settings: Option<ApplyReport>,
    pub transcript: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(state: InstallState, action: Action) -> Self {
        Self {
            initial_state: state,
            action,
            final_state: None,
            steps: Vec::new(),
            readiness: None,
            settings: None,
            transcript: None,
            warnings: Vec::new(),
        }
    }

    pub fn log(&self) {
        info!(
            initial_state = %self.initial_state,
            action = %self.action,
            steps = %self.steps.join(" -> "),
            "provisioning finished"
        );
        if let Some(state) = self.final_state {
            info!(state = %state, "final host state");
        }
        match self.readiness {
            Some(ReadinessOutcome::Ready { attempts }) => info!(attempts, "workload is ready"),
            Some(ReadinessOutcome::Timeout { attempts }) => {
                warn!(attempts, "workload not confirmed ready; it may still be warming up")
            }
            _ => {}
        }
        if let Some(path) = &self.transcript {
            info!(path = %path.display(), "installer transcript");
        }
        for warning in &self.warnings {
            warn!("{warning}");
        }
    }
}

fn invoking_user() -> String {
    env::var("SUDO_USER")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "root".to_string())
}

pub struct Orchestrator<'a, R: DockerRunner, H: HostOps, A: AnswerSource, G: ConfirmGate + ?Sized> {
    cfg: &'a Config,
    runner: &'a R,
    host: &'a H,
    answers: &'a A,
    gate: &'a G,
    options: RunOptions,
    interrupted: Arc<AtomicBool>,
}

impl<'a, R, H, A, G> Orchestrator<'a, R, H, A, G>
where
    R: DockerRunner,
    H: HostOps,
    A: AnswerSource,
    G: ConfirmGate + ?Sized,
{
    pub fn new(
        cfg: &'a Config,
        runner: &'a R,
        host: &'a H,
        answers: &'a A,
        gate: &'a G,
        options: RunOptions,
    ) -> Self {
        Self {
            cfg,
            runner,
            host,
            answers,
            gate,
            options,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised by SIGINT/SIGTERM once mutation has begun.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn probe(&self) -> InstallState {
        StatusProbe::new(
            &self.cfg.host,
            &self.cfg.readiness.expected_containers,
            self.runner,
        )
        .probe()
    }

    fn register_signals(&self) -> Result<(), ProvisionError> {
        if !self.options.handle_signals {
            return Ok(());
        }
        flag::register(SIGINT, Arc::clone(&self.interrupted))?;
        flag::register(SIGTERM, Arc::clone(&self.interrupted))?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), ProvisionError> {
        if self.interrupted.load(Ordering::SeqCst) {
            warn!("interrupt received; stopping before the next step");
            return Err(ProvisionError::Interrupted);
        }
        Ok(())
    }

    fn step<T>(
        &self,
        report: &mut RunReport,
        name: &str,
        f: impl FnOnce() -> Result<T, ProvisionError>,
    ) -> Result<T, ProvisionError> {
        self.checkpoint()?;
        info!(step = name, "running step");
        let value = f().map_err(|err| {
            if self.interrupted.load(Ordering::SeqCst) {
                // Most likely a child reacting to the same signal.
                warn!(step = name, error = %err, "step failed after an interrupt");
                ProvisionError::Interrupted
            } else {
                err
            }
        })?;
        report.steps.push(name.to_string());
        Ok(value)
    }

    /// The lock is held from the first probe to the end of the run, so the
    /// plan always reflects the host this run acts on.
    pub fn run(&self) -> Result<RunReport, ProvisionError> {
        let _lock = if self.options.use_lock {
            Some(RunLock::acquire(&self.cfg.host.lock_file_path())?)
        } else {
            None
        };

        let state = self.probe();
        let action = plan(state);
        info!(state = %state, action = %action, "{}", action.describe());
        let mut report = RunReport::new(state, action);
        report.steps.push("probe".to_string());
        report.steps.push("plan".to_string());

        if action == Action::AlreadyRunning {
            report.final_state = Some(state);
            return Ok(report);
        }
        if action == Action::OfferCleanReinstall {
            self.confirm_reinstall(state)?;
        }

        let answers = if action.drives_installer() {
            Some(self.answers.collect()?)
        } else {
            None
        };

        self.register_signals()?;
        match (action, answers.as_ref()) {
            (Action::FreshInstall, Some(answers)) => self.fresh_install(&mut report, answers)?,
            (Action::ResumeInstall, Some(answers)) => self.resume_install(&mut report, answers)?,
            (Action::OfferCleanReinstall, Some(answers)) => {
                self.clean_reinstall(&mut report, answers)?
            }
            (Action::StartExisting, _) => self.start_existing(&mut report)?,
            _ => {
                return Err(ProvisionError::Config(format!(
                    "action {action} requires installation answers"
                )))
            }
        }

        report.final_state = Some(self.probe());
        Ok(report)
    }

    fn ensure_dependencies(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        let cwd = PathBuf::from("/");
        self.step(report, "dependencies", || {
            if self.host.find_program("docker").is_none() {
                warn!("container runtime not found; installing it");
                self.host.install_container_runtime()?;
                if self.host.find_program("docker").is_none() {
                    return Err(ProvisionError::MissingDependency {
                        name: "docker".to_string(),
                        hint: "Install the container runtime manually, then re-run.".to_string(),
                    });
                }
            }
            ensure_socket_access(self.runner, self.host, &invoking_user(), &cwd)?;
            let tool = discover_compose(self.runner, self.host, &cwd)?;
            info!(compose = tool.as_str(), "dependencies satisfied");
            Ok(())
        })
    }

    fn ensure_account(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        let account = &self.cfg.host.service_account;
        let root = self.cfg.host.install_root();
        self.step(report, "service_account", || {
            if self.host.ensure_service_account(account, &root)? {
                info!(account = %account, "service account created");
            } else {
                info!(account = %account, "service account already present");
            }
            Ok(())
        })
    }

    fn fresh_install(
        &self,
        report: &mut RunReport,
        answers: &InstallationConfig,
    ) -> Result<(), ProvisionError> {
        let host = &self.cfg.host;
        let root = host.install_root();
        self.ensure_dependencies(report)?;
        self.ensure_account(report)?;
        self.step(report, "install_root", || Ok(fs::create_dir_all(&root)?))?;
        self.step(report, "firewall", || self.host.configure_firewall())?;
        self.step(report, "fetch_installer", || {
            self.host
                .fetch_installer_script(&host.installer_url, &host.installer_script_path())
        })?;
        self.step(report, "ownership", || {
            self.host.set_owner(&root, &host.service_account)
        })?;
        self.install_and_start(report, answers)
    }

    fn resume_install(
        &self,
        report: &mut RunReport,
        answers: &InstallationConfig,
    ) -> Result<(), ProvisionError> {
        self.ensure_dependencies(report)?;
        self.ensure_account(report)?;
        self.install_and_start(report, answers)
    }

    fn confirm_reinstall(&self, state: InstallState) -> Result<(), ProvisionError> {
        let root = self.cfg.host.install_root();
        let question = format!(
            "The installation at {} is incomplete or damaged ({state}). Remove it and reinstall?",
            root.display()
        );
        if !self.gate.confirm(&question)? {
            return Err(ProvisionError::Declined(format!(
                "clean reinstall of {} was not approved",
                root.display()
            )));
        }
        Ok(())
    }

    fn clean_reinstall(
        &self,
        report: &mut RunReport,
        answers: &InstallationConfig,
    ) -> Result<(), ProvisionError> {
        let host = &self.cfg.host;
        let root = host.install_root();
        self.step(report, "remove_installation", || {
            match remove_containers(self.runner, &host.container_filter, &PathBuf::from("/")) {
                Ok(removed) => info!(removed, "removed workload containers"),
                Err(err) => warn!(error = %err, "could not remove workload containers"),
            }
            self.host.remove_installation(&root)
        })?;
        let state = self.probe();
        if state != InstallState::NotInstalled {
            return Err(ProvisionError::Corrupted(format!(
                "host still reads as {state} after removing {}",
                root.display()
            )));
        }
        self.fresh_install(report, answers)
    }

    fn start_existing(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        self.step(report, "socket_access", || {
            ensure_socket_access(self.runner, self.host, &invoking_user(), &PathBuf::from("/"))
        })?;
        self.start_and_wait(report)
    }

    fn install_and_start(
        &self,
        report: &mut RunReport,
        answers: &InstallationConfig,
    ) -> Result<(), ProvisionError> {
        report.transcript = self.step(report, "installer", || self.run_installer(answers))?;

        let state = self.probe();
        match state {
            InstallState::InstalledStopped | InstallState::InstalledRunning => {
                info!(state = %state, "installer left the host installed")
            }
            InstallState::Corrupted => {
                return Err(ProvisionError::Corrupted(
                    "host is corrupted after the installer finished".to_string(),
                ))
            }
            other => {
                return Err(ProvisionError::Process(format!(
                    "installer finished but the host reads as {other}; re-run to resume"
                )))
            }
        }

        if let Some(smtp) = &answers.smtp {
            let path = self.cfg.host.settings_file_path();
            let updates = envfile::smtp_updates(smtp, &answers.domain);
            let applied = self.step(report, "configure", || Ok(envfile::apply(&path, &updates)?))?;
            report.settings = Some(applied);
        }
        self.start_and_wait(report)
    }

    fn run_installer(&self, answers: &InstallationConfig) -> Result<Option<PathBuf>, ProvisionError> {
        let settings = DriverSettings::from_config(self.cfg)
            .map_err(|err| ProvisionError::Config(format!("invalid installer pattern: {err}")))?;
        let transcript = settings.transcript_path.clone();
        let script = default_install_script(Duration::from_secs(
            self.cfg.installer.prompt_timeout_sec,
        ))
        .map_err(|err| ProvisionError::Config(format!("invalid prompt rule: {err}")))?;
        let command = SessionCommand::installer(
            &self.cfg.host,
            &self.cfg.installer,
            &self.cfg.installer.subcommand,
        );
        let outcome = InstallDriver::new(settings).run(&command, &script, answers)?;
        info!(
            answered = outcome.answered.len(),
            flagged = outcome.flagged_lines.len(),
            success_marker = outcome.saw_success_marker,
            "installer finished"
        );
        Ok(transcript)
    }

    fn start_and_wait(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        self.step(report, "start", || {
            let command = SessionCommand::installer(&self.cfg.host, &self.cfg.installer, "start");
            self.host.run_installer_subcommand(&command)
        })?;
        self.await_readiness(report)
    }

    /// Polls until the workload answers. A timeout is a warning unless
    /// `strict_readiness` is set.
    pub fn await_readiness(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        self.checkpoint()?;
        let waiter = ReadinessWaiter::new(Some(self.interrupt_flag()));
        let outcome = waiter.wait(workload_check(
            self.runner,
            &self.cfg.host,
            &self.cfg.readiness,
        ));
        report.readiness = Some(outcome);
        report.steps.push("readiness".to_string());
        match outcome {
            ReadinessOutcome::Ready { .. } => Ok(()),
            ReadinessOutcome::Cancelled { .. } => Err(ProvisionError::Interrupted),
            ReadinessOutcome::Timeout { attempts } if self.options.strict_readiness => {
                Err(ProvisionError::ReadinessTimeout { attempts })
            }
            ReadinessOutcome::Timeout { attempts } => {
                report.warnings.push(format!(
                    "workload did not become ready after {attempts} attempts"
                ));
                Ok(())
            }
        }
    }
}
