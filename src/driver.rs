//! Scripted automation of the vendor's prompt-driven installer.
//!
//! The installer is spawned with piped stdio and fed answers according to an
//! ordered list of [`PromptResponseRule`]s. Output from stdout and stderr is
//! merged and matched in arrival order; each ordered rule has its own deadline.

use chrono::Utc;
use regex::Regex;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{Config, HostConfig, InstallationConfig, InstallerConfig, TlsMode};

const PENDING_LIMIT: usize = 64 * 1024;
const PENDING_KEEP: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no output matched prompt rule {rule_index} within its timeout")]
    PromptTimeout { rule_index: usize },
    #[error("installer did not report completion within {}s", .after.as_secs())]
    CompletionTimeout { after: Duration },
    #[error("installer exited ({status}) before finishing; next unanswered rule: {rule_index:?}")]
    UnexpectedExit {
        status: String,
        rule_index: Option<usize>,
    },
    #[error("installer i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("installer finished but completion artifact {} is missing", .path.display())]
    MissingArtifact { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Must be answered before the run can complete.
    Required,
    /// Answered if it shows up; skipped once a later ordered rule matches.
    Optional,
    /// Informational output, may match any number of times, never answered.
    Progress,
}

#[derive(Debug, Clone)]
pub struct PromptResponseRule {
    pub pattern: Regex,
    pub response: String,
    pub kind: RuleKind,
    pub timeout: Duration,
    pub sensitive: bool,
}

impl PromptResponseRule {
    fn new(pattern: &str, response: &str, kind: RuleKind, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            response: response.to_string(),
            kind,
            timeout,
            sensitive: false,
        })
    }

    pub fn required(pattern: &str, response: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Self::new(pattern, response, RuleKind::Required, timeout)
    }

    pub fn optional(pattern: &str, response: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Self::new(pattern, response, RuleKind::Optional, timeout)
    }

    pub fn progress(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, "", RuleKind::Progress, Duration::ZERO)
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallScript {
    pub rules: Vec<PromptResponseRule>,
}

impl InstallScript {
    pub fn new(rules: Vec<PromptResponseRule>) -> Self {
        Self { rules }
    }

    fn ordered(&self) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.kind != RuleKind::Progress)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn progress(&self) -> impl Iterator<Item = (usize, &PromptResponseRule)> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.kind == RuleKind::Progress)
    }
}

/// Prompt sequence of the vendor installer's `install` subcommand.
pub fn default_install_script(prompt_timeout: Duration) -> Result<InstallScript, regex::Error> {
    let t = prompt_timeout;
    Ok(InstallScript::new(vec![
        PromptResponseRule::required(r"(?i)enter the domain name", "{domain}", t)?,
        PromptResponseRule::required(r"(?i)use let'?s ?encrypt", "{lets_encrypt}", t)?,
        PromptResponseRule::optional(r"(?i)enter your email address", "{email}", t)?,
        PromptResponseRule::required(r"(?i)enter the database name", "{database_name}", t)?,
        PromptResponseRule::required(r"(?i)enter your installation id", "{installation_id}", t)?,
        PromptResponseRule::required(r"(?i)enter your installation key", "{installation_key}", t)?
            .sensitive(),
        PromptResponseRule::optional(r"(?i)enter your region", "{region}", t)?,
        PromptResponseRule::optional(r"(?i)(have|using your own) (an? )?ssl certificate", "n", t)?,
        PromptResponseRule::optional(r"(?i)generate a self-signed ssl certificate", "{self_signed}", t)?,
        PromptResponseRule::progress(
            r"(?im)^\s*(pulling|downloading|extracting|generating|building|creating|starting)\b.*$",
        )?,
    ]))
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "y"
    } else {
        "n"
    }
}

/// Substitutes `{field}` placeholders with values from the run's answers.
/// Unknown placeholders are left untouched.
pub fn render_response(template: &str, config: &InstallationConfig) -> String {
    let replacements = [
        ("{domain}", config.domain.as_str()),
        ("{email}", config.email.as_str()),
        ("{installation_id}", config.credentials.id.as_str()),
        ("{installation_key}", config.credentials.key.as_str()),
        ("{region}", config.region.as_str()),
        ("{database_name}", config.database_name.as_str()),
        ("{lets_encrypt}", yes_no(config.tls == TlsMode::LetsEncrypt)),
        ("{self_signed}", yes_no(config.tls == TlsMode::SelfSigned)),
    ];
    let mut out = template.to_string();
    for (placeholder, value) in replacements {
        out = out.replace(placeholder, value);
    }
    out
}

/// How to launch the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl SessionCommand {
    pub fn installer(host: &HostConfig, installer: &InstallerConfig, subcommand: &str) -> Self {
        let script = host.installer_script_path().to_string_lossy().to_string();
        let mut argv = Vec::new();
        if !installer.interpreter.trim().is_empty() {
            argv.push(installer.interpreter.trim().to_string());
        }
        argv.push(script);
        argv.push(subcommand.to_string());
        if installer.run_as_service_account {
            let mut args = vec!["-u".to_string(), host.service_account.clone()];
            args.extend(argv);
            return Self {
                program: PathBuf::from("sudo"),
                args,
                cwd: host.install_root(),
            };
        }
        let program = PathBuf::from(argv.remove(0));
        Self {
            program,
            args: argv,
            cwd: host.install_root(),
        }
    }

    pub fn render(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// The child runs in its own process group: a terminal Ctrl-C is
    /// handled between steps and never reaches the installer.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

enum Recv {
    Data(Vec<u8>),
    Timeout,
    Closed,
}

fn pump<R: Read>(mut reader: R, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// A spawned installer and its merged output stream. The child is reaped when
/// the session is dropped, whichever way the driver exits.
struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
}

impl ProcessSession {
    fn spawn(command: &SessionCommand) -> Result<Self, DriverError> {
        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: command.render(),
                source,
            })?;
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || pump(stdout, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || pump(stderr, tx));
        }
        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            output: rx,
        })
    }

    fn send(&mut self, line: &str) -> Result<(), DriverError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            DriverError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "installer stdin closed"))
        })?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Recv {
        match self.output.recv_timeout(timeout) {
            Ok(bytes) => Recv::Data(bytes),
            Err(RecvTimeoutError::Timeout) => Recv::Timeout,
            Err(RecvTimeoutError::Disconnected) => Recv::Closed,
        }
    }

    fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        self.stdin.take();
        self.child.wait()
    }

    /// Lets the installer wind down after reporting success, collecting any
    /// trailing output, then reaps it.
    fn close(&mut self, grace: Duration, transcript: &mut Transcript) {
        self.stdin.take();
        let deadline = Instant::now() + grace;
        loop {
            loop {
                match self.output.try_recv() {
                    Ok(bytes) => transcript.output(&String::from_utf8_lossy(&bytes)),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => break,
            }
        }
        warn!("installer still running after reporting completion; stopping it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.stdin.take();
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Incremental UTF-8 decoding across chunk boundaries.
#[derive(Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.carry.len(),
        };
        let rest = self.carry.split_off(valid);
        let text = String::from_utf8_lossy(&self.carry).to_string();
        self.carry = rest;
        text
    }
}

/// Full record of a session: installer output plus the (redacted) answers.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    fn new(command: &str) -> Self {
        Self {
            text: format!("=== {} {}\n", Utc::now().to_rfc3339(), command),
        }
    }

    fn output(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    fn response(&mut self, rule_index: usize, shown: &str) {
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(&format!(">>> [rule {rule_index}] {shown}\n"));
    }

    fn note(&mut self, line: &str) {
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(&format!("=== {line}\n"));
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn persist(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(self.text.as_bytes())?;
        if !self.text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Splits the output stream into complete lines for logging.
#[derive(Default)]
struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub success_pattern: Regex,
    pub error_signatures: Vec<Regex>,
    pub completion_timeout: Duration,
    pub completion_artifact: PathBuf,
    pub transcript_path: Option<PathBuf>,
    pub exit_grace: Duration,
}

impl DriverSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, regex::Error> {
        let error_signatures = cfg
            .installer
            .error_signatures
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            success_pattern: Regex::new(&cfg.installer.success_pattern)?,
            error_signatures,
            completion_timeout: Duration::from_secs(cfg.installer.completion_timeout_sec),
            completion_artifact: cfg.host.completion_artifact_path(),
            transcript_path: Some(cfg.host.log_file_path()),
            exit_grace: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DriverSuccess {
    /// Rule indices in the order they were answered.
    pub answered: Vec<usize>,
    /// Responses as sent, with sensitive ones redacted.
    pub responses: Vec<String>,
    pub flagged_lines: Vec<String>,
    pub saw_success_marker: bool,
    pub transcript: Transcript,
}

#[derive(Debug)]
enum Event {
    Prompt { position: usize, rule_index: usize },
    Success,
    Progress { rule_index: usize },
}

#[derive(Debug)]
struct Found {
    start: usize,
    end: usize,
    event: Event,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prompt { rule_index, .. } => write!(f, "prompt rule {rule_index}"),
            Self::Success => f.write_str("success marker"),
            Self::Progress { rule_index } => write!(f, "progress rule {rule_index}"),
        }
    }
}

pub struct InstallDriver {
    settings: DriverSettings,
}

impl InstallDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    /// Runs the installer to completion. The prompt sequence is only a
    /// heuristic: success additionally requires the completion artifact.
    pub fn run(
        &self,
        command: &SessionCommand,
        script: &InstallScript,
        config: &InstallationConfig,
    ) -> Result<DriverSuccess, DriverError> {
        info!(command = %command.render(), "starting interactive installer");
        let mut transcript = Transcript::new(&command.render());
        let result = self.drive(command, script, config, &mut transcript);

        let artifact = &self.settings.completion_artifact;
        let artifact_present = artifact.exists();
        let result = match result {
            Ok(_) if !artifact_present => {
                error!(artifact = %artifact.display(), "installer output looked successful but the completion artifact is missing");
                Err(DriverError::MissingArtifact {
                    path: artifact.clone(),
                })
            }
            Err(err) => {
                if artifact_present {
                    warn!(artifact = %artifact.display(), "installer failed although the completion artifact exists");
                }
                Err(err)
            }
            ok => ok,
        };

        match &result {
            Ok(_) => transcript.note("outcome: success"),
            Err(err) => transcript.note(&format!("outcome: {err}")),
        }
        if let Some(path) = &self.settings.transcript_path {
            match transcript.persist(path) {
                Ok(()) => info!(path = %path.display(), "installer transcript saved"),
                Err(err) => warn!(path = %path.display(), error = %err, "could not save installer transcript"),
            }
        }
        result.map(|mut success| {
            success.transcript = transcript;
            success
        })
    }

    fn next_event(&self, pending: &str, script: &InstallScript, ordered: &[usize], cursor: usize) -> Option<Found> {
        let mut found: Vec<Found> = Vec::new();
        for (position, &rule_index) in ordered.iter().enumerate().skip(cursor) {
            let rule = &script.rules[rule_index];
            if let Some(m) = rule.pattern.find(pending) {
                found.push(Found {
                    start: m.start(),
                    end: m.end(),
                    event: Event::Prompt { position, rule_index },
                });
            }
            if rule.kind == RuleKind::Required {
                break;
            }
        }
        if let Some(m) = self.settings.success_pattern.find(pending) {
            found.push(Found {
                start: m.start(),
                end: m.end(),
                event: Event::Success,
            });
        }
        for (rule_index, rule) in script.progress() {
            if let Some(m) = rule.pattern.find(pending) {
                found.push(Found {
                    start: m.start(),
                    end: m.end(),
                    event: Event::Progress { rule_index },
                });
            }
        }
        found.into_iter().min_by_key(|f| f.start)
    }

    fn first_required(script: &InstallScript, ordered: &[usize], cursor: usize) -> Option<usize> {
        ordered
            .iter()
            .skip(cursor)
            .copied()
            .find(|&idx| script.rules[idx].kind == RuleKind::Required)
    }

    /// Shortest timeout among the rules that could match next: the optional
    /// rules ahead of the first pending required rule, and that rule itself.
    fn window_timeout(script: &InstallScript, ordered: &[usize], cursor: usize) -> Option<Duration> {
        let mut shortest: Option<Duration> = None;
        for &idx in ordered.iter().skip(cursor) {
            let rule = &script.rules[idx];
            shortest = Some(shortest.map_or(rule.timeout, |t| t.min(rule.timeout)));
            if rule.kind == RuleKind::Required {
                return shortest;
            }
        }
        None
    }

    fn drive(
        &self,
        command: &SessionCommand,
        script: &InstallScript,
        config: &InstallationConfig,
        transcript: &mut Transcript,
    ) -> Result<DriverSuccess, DriverError> {
        let mut session = ProcessSession::spawn(command)?;
        let ordered = script.ordered();
        let mut cursor = 0usize;
        let mut pending = String::new();
        let mut decoder = Utf8Decoder::default();
        let mut lines = LineAssembler::default();
        let mut success = DriverSuccess {
            answered: Vec::new(),
            responses: Vec::new(),
            flagged_lines: Vec::new(),
            saw_success_marker: false,
            transcript: Transcript::default(),
        };
        let mut stage_started = Instant::now();

        loop {
            while let Some(found) = self.next_event(&pending, script, &ordered, cursor) {
                debug!(event = %found.event, "matched installer output");
                match found.event {
                    Event::Success => {
                        if let Some(idx) = Self::first_required(script, &ordered, cursor) {
                            warn!(rule_index = idx, "success marker seen before all required prompts were answered");
                        }
                        info!("installer reported completion");
                        success.saw_success_marker = true;
                        session.close(self.settings.exit_grace, transcript);
                        return Ok(success);
                    }
                    Event::Prompt { position, rule_index } => {
                        let rule = &script.rules[rule_index];
                        let response = render_response(&rule.response, config);
                        let shown = if rule.sensitive {
                            "<redacted>".to_string()
                        } else {
                            response.clone()
                        };
                        for skipped in &ordered[cursor..position] {
                            debug!(rule_index = skipped, "optional prompt did not appear");
                        }
                        info!(rule_index, response = %shown, "answering installer prompt");
                        session.send(&response)?;
                        transcript.response(rule_index, &shown);
                        success.answered.push(rule_index);
                        success.responses.push(shown);
                        cursor = position + 1;
                        stage_started = Instant::now();
                    }
                    Event::Progress { .. } => {
                        info!(progress = %pending[found.start..found.end].trim(), "installer progress");
                    }
                }
                pending.drain(..found.end);
            }
            if pending.len() > PENDING_LIMIT {
                let mut cut = pending.len() - PENDING_KEEP;
                while !pending.is_char_boundary(cut) {
                    cut += 1;
                }
                pending.drain(..cut);
            }

            let waiting_for = Self::first_required(script, &ordered, cursor);
            let budget = Self::window_timeout(script, &ordered, cursor)
                .unwrap_or(self.settings.completion_timeout);
            let remaining = budget.saturating_sub(stage_started.elapsed());
            let timed_out = || match waiting_for {
                Some(rule_index) => DriverError::PromptTimeout { rule_index },
                None => DriverError::CompletionTimeout { after: budget },
            };
            if remaining.is_zero() {
                return Err(timed_out());
            }

            match session.recv(remaining) {
                Recv::Data(bytes) => {
                    let text = decoder.push(&bytes);
                    transcript.output(&text);
                    for line in lines.push(&text) {
                        self.inspect_line(&line, &mut success);
                    }
                    pending.push_str(&text);
                }
                Recv::Timeout => {
                    let err = timed_out();
                    error!(error = %err, "installer stalled");
                    return Err(err);
                }
                Recv::Closed => {
                    if let Some(line) = lines.flush() {
                        self.inspect_line(&line, &mut success);
                    }
                    let status = session.wait()?;
                    if let Some(rule_index) = waiting_for {
                        return Err(DriverError::UnexpectedExit {
                            status: status.to_string(),
                            rule_index: Some(rule_index),
                        });
                    }
                    if status.success() {
                        warn!("installer exited cleanly without printing the success marker");
                        return Ok(success);
                    }
                    return Err(DriverError::UnexpectedExit {
                        status: status.to_string(),
                        rule_index: None,
                    });
                }
            }
        }
    }

    /// Error-shaped lines are reported but never abort the session.
    fn inspect_line(&self, line: &str, success: &mut DriverSuccess) {
        if self
            .settings
            .error_signatures
            .iter()
            .any(|sig| sig.is_match(line))
        {
            error!(line = %line, "installer reported an error");
            success.flagged_lines.push(line.to_string());
        } else {
            debug!(line = %line, "installer output");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{InstallAnswers, Region};
    use tempfile::{tempdir, TempDir};

    fn answers() -> InstallationConfig {
        InstallationConfig::from_answers(&InstallAnswers {
            domain: "vault.example.com".to_string(),
            email: "ops@example.com".to_string(),
            installation_id: "11111111-2222".to_string(),
            installation_key: "s3cr3t".to_string(),
            region: Region::Us,
            ..InstallAnswers::default()
        })
        .expect("answers")
    }

    struct Fixture {
        dir: TempDir,
        responses: PathBuf,
        artifact: PathBuf,
        log: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let responses = dir.path().join("responses.txt");
            let artifact = dir.path().join("bwdata/config.yml");
            let log = dir.path().join("logs/install.log");
            Self {
                dir,
                responses,
                artifact,
                log,
            }
        }

        /// `{resp}` and `{artifact}` are substituted into `body`.
        fn command(&self, body: &str) -> SessionCommand {
            let script = self.dir.path().join("installer.sh");
            let body = body
                .replace("{resp}", &self.responses.to_string_lossy())
                .replace("{artifact}", &self.artifact.to_string_lossy());
            fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
            SessionCommand {
                program: PathBuf::from("sh"),
                args: vec![script.to_string_lossy().to_string(), "install".to_string()],
                cwd: self.dir.path().to_path_buf(),
            }
        }

        fn driver(&self) -> InstallDriver {
            self.driver_with(Duration::from_secs(10), Duration::from_secs(5))
        }

        fn driver_with(&self, completion_timeout: Duration, exit_grace: Duration) -> InstallDriver {
            InstallDriver::new(DriverSettings {
                success_pattern: Regex::new("(?i)installation complete").unwrap(),
                error_signatures: vec![Regex::new(r"(?i)\berror\b").unwrap()],
                completion_timeout,
                completion_artifact: self.artifact.clone(),
                transcript_path: Some(self.log.clone()),
                exit_grace,
            })
        }
    }

    const FULL_INSTALLER: &str = r#"
echo "Pulling images..."
printf 'Enter the domain name for your instance (ex. vault.example.com): '
read a; echo "domain=$a" >> {resp}
printf 'Do you want to use Lets Encrypt to generate a free SSL certificate? (y/n): '
read a; echo "le=$a" >> {resp}
printf 'Enter your email address: '
read a; echo "email=$a" >> {resp}
printf 'Enter the database name for your instance (ex. vault): '
read a; echo "db=$a" >> {resp}
echo "ERROR: transient registry hiccup, retrying"
printf 'Enter your installation id: '
read a; echo "id=$a" >> {resp}
printf 'Enter your installation key: '
read a; echo "key=$a" >> {resp}
printf 'Enter your region (US/EU): '
read a; echo "region=$a" >> {resp}
mkdir -p "$(dirname {artifact})"; touch {artifact}
echo "Generating config..."
echo "Installation complete"
"#;

    #[test]
    fn answers_prompts_in_order_and_succeeds() {
        let fx = Fixture::new();
        let script = default_install_script(Duration::from_secs(10)).unwrap();
        let result = fx
            .driver()
            .run(&fx.command(FULL_INSTALLER), &script, &answers())
            .expect("installer should succeed");

        let recorded = fs::read_to_string(&fx.responses).unwrap();
        assert_eq!(
            recorded,
            "domain=vault.example.com\nle=y\nemail=ops@example.com\ndb=vault\nid=11111111-2222\nkey=s3cr3t\nregion=US\n"
        );
        assert_eq!(result.answered, vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(result.saw_success_marker);
        assert_eq!(result.flagged_lines.len(), 1);
        assert!(result.responses.contains(&"<redacted>".to_string()));
        assert!(!result.responses.contains(&"s3cr3t".to_string()));
    }

    #[test]
    fn transcript_is_persisted_with_secrets_redacted() {
        let fx = Fixture::new();
        let script = default_install_script(Duration::from_secs(10)).unwrap();
        fx.driver()
            .run(&fx.command(FULL_INSTALLER), &script, &answers())
            .unwrap();
        let log = fs::read_to_string(&fx.log).unwrap();
        assert!(log.contains("Enter the domain name"));
        assert!(log.contains(">>> [rule 5] <redacted>"));
        assert!(!log.contains("s3cr3t"));
        assert!(log.contains("outcome: success"));
    }

    #[test]
    fn withheld_installation_id_prompt_times_out_on_that_rule() {
        let fx = Fixture::new();
        let body = r#"
printf 'Enter the domain name: '
read a
printf 'Do you want to use Lets Encrypt? (y/n): '
read a
printf 'Enter the database name: '
read a
read never
"#;
        let script = default_install_script(Duration::from_millis(800)).unwrap();
        let started = Instant::now();
        let err = fx
            .driver()
            .run(&fx.command(body), &script, &answers())
            .expect_err("must time out");
        assert!(
            matches!(err, DriverError::PromptTimeout { rule_index: 4 }),
            "got {err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(8));
        let log = fs::read_to_string(&fx.log).unwrap();
        assert!(log.contains("outcome:"));
    }

    #[test]
    fn silent_installer_hits_the_completion_timeout() {
        let fx = Fixture::new();
        let started = Instant::now();
        let err = fx
            .driver_with(Duration::from_millis(500), Duration::from_secs(5))
            .run(&fx.command("exec sleep 30\n"), &InstallScript::default(), &answers())
            .expect_err("must time out");
        assert!(
            matches!(err, DriverError::CompletionTimeout { after } if after == Duration::from_millis(500)),
            "got {err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        let log = fs::read_to_string(&fx.log).unwrap();
        assert!(log.contains("outcome: installer did not report completion"));
    }

    #[test]
    fn success_marker_ends_the_session_while_installer_keeps_printing() {
        let fx = Fixture::new();
        let body = r#"
mkdir -p "$(dirname {artifact})"; touch {artifact}
echo "Installation complete"
while true; do echo "still tidying up"; sleep 0.2; done
"#;
        let started = Instant::now();
        let result = fx
            .driver_with(Duration::from_secs(10), Duration::from_millis(500))
            .run(&fx.command(body), &InstallScript::default(), &answers())
            .expect("marker plus artifact is success");
        assert!(result.saw_success_marker);
        assert!(started.elapsed() < Duration::from_secs(8));
        let log = fs::read_to_string(&fx.log).unwrap();
        assert!(log.contains("still tidying up"));
        assert!(log.contains("outcome: success"));
    }

    #[test]
    fn optional_rule_timeout_bounds_the_wait() {
        let fx = Fixture::new();
        let script = InstallScript::new(vec![
            PromptResponseRule::optional(r"(?i)enter your email", "{email}", Duration::from_millis(400))
                .unwrap(),
            PromptResponseRule::required(r"(?i)enter the database", "{database_name}", Duration::from_secs(30))
                .unwrap(),
        ]);
        let started = Instant::now();
        let err = fx
            .driver()
            .run(&fx.command("read never\n"), &script, &answers())
            .expect_err("must time out");
        assert!(
            matches!(err, DriverError::PromptTimeout { rule_index: 1 }),
            "got {err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn premature_exit_is_unexpected() {
        let fx = Fixture::new();
        let body = "printf 'Enter the domain name: '\nread a\nexit 3\n";
        let script = default_install_script(Duration::from_secs(10)).unwrap();
        let err = fx
            .driver()
            .run(&fx.command(body), &script, &answers())
            .expect_err("must fail");
        assert!(
            matches!(err, DriverError::UnexpectedExit { rule_index: Some(1), .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn success_marker_without_artifact_fails() {
        let fx = Fixture::new();
        let body = "echo 'Installation complete'\n";
        let script = InstallScript::default();
        let err = fx
            .driver()
            .run(&fx.command(body), &script, &answers())
            .expect_err("artifact missing");
        assert!(matches!(err, DriverError::MissingArtifact { .. }));
    }

    #[test]
    fn optional_prompts_are_skipped_when_absent() {
        let fx = Fixture::new();
        let body = r#"
printf 'Enter the domain name: '
read a; echo "domain=$a" >> {resp}
printf 'use Lets Encrypt (y/n): '
read a; echo "le=$a" >> {resp}
printf 'Enter the database name: '
read a; echo "db=$a" >> {resp}
printf 'Enter your installation id: '
read a
printf 'Enter your installation key: '
read a
printf 'Do you have a SSL certificate to use? (y/n): '
read a; echo "own=$a" >> {resp}
printf 'Do you want to generate a self-signed SSL certificate? (y/n): '
read a; echo "self=$a" >> {resp}
mkdir -p "$(dirname {artifact})"; touch {artifact}
echo "Installation complete"
"#;
        let mut answers = answers();
        answers.tls = TlsMode::SelfSigned;
        let script = default_install_script(Duration::from_secs(10)).unwrap();
        let result = fx
            .driver()
            .run(&fx.command(body), &script, &answers)
            .expect("success");
        assert_eq!(result.answered, vec![0, 1, 3, 4, 5, 7, 8]);
        let recorded = fs::read_to_string(&fx.responses).unwrap();
        assert_eq!(
            recorded,
            "domain=vault.example.com\nle=n\ndb=vault\nown=n\nself=y\n"
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let fx = Fixture::new();
        let cmd = SessionCommand {
            program: fx.dir.path().join("does-not-exist"),
            args: Vec::new(),
            cwd: fx.dir.path().to_path_buf(),
        };
        let err = fx
            .driver()
            .run(&cmd, &InstallScript::default(), &answers())
            .expect_err("spawn");
        assert!(matches!(err, DriverError::Spawn { .. }));
    }

    #[test]
    fn render_fills_placeholders() {
        let cfg = answers();
        assert_eq!(render_response("{domain}", &cfg), "vault.example.com");
        assert_eq!(render_response("{lets_encrypt}/{self_signed}", &cfg), "y/n");
        assert_eq!(render_response("{region}", &cfg), "US");
        assert_eq!(render_response("{unknown}", &cfg), "{unknown}");
    }

    #[test]
    fn installer_command_wraps_with_sudo() {
        let host = HostConfig::default();
        let mut installer = InstallerConfig::default();
        let cmd = SessionCommand::installer(&host, &installer, "install");
        assert_eq!(cmd.render(), "sudo -u bitwarden /opt/bitwarden/bitwarden.sh install");
        installer.run_as_service_account = false;
        let cmd = SessionCommand::installer(&host, &installer, "start");
        assert_eq!(cmd.render(), "/opt/bitwarden/bitwarden.sh start");
        installer.interpreter = "bash".to_string();
        let cmd = SessionCommand::installer(&host, &installer, "start");
        assert_eq!(cmd.program, PathBuf::from("bash"));
        assert_eq!(cmd.render(), "bash /opt/bitwarden/bitwarden.sh start");
    }

    #[test]
    fn decoder_handles_split_multibyte_chars() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();
        let first = decoder.push(&bytes[..2]);
        let second = decoder.push(&bytes[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
    }
}
