use std::io;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::host::HostOps;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Seam over the container runtime CLI.
pub trait DockerRunner {
    fn run(&self, args: &[String], cwd: &Path) -> Result<CommandOutput, io::Error>;
}

pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String], cwd: &Path) -> Result<CommandOutput, io::Error> {
        let cwd = if cwd.is_dir() { cwd } else { Path::new("/") };
        let output = Command::new("docker").args(args).current_dir(cwd).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerFailure {
    DaemonUnreachable,
    SocketPermissionDenied,
    ComposeUnavailable,
    Other,
}

pub fn classify_docker_failure(stderr: &str) -> DockerFailure {
    let lower = stderr.to_lowercase();

    if lower.contains("permission denied") && lower.contains("docker.sock")
        || lower.contains("permission denied while trying to connect")
    {
        return DockerFailure::SocketPermissionDenied;
    }

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
        || lower.contains("unknown shorthand flag: 'f' in -f")
    {
        return DockerFailure::ComposeUnavailable;
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return DockerFailure::DaemonUnreachable;
    }

    DockerFailure::Other
}

fn render_docker_command(args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("docker".to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

pub fn execute_docker<R: DockerRunner>(
    runner: &R,
    args: &[String],
    cwd: &Path,
) -> Result<CommandOutput, ProvisionError> {
    let command = render_docker_command(args);
    debug!(command = %command, "running container runtime command");
    let output = runner.run(args, cwd).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ProvisionError::MissingDependency {
                name: "docker".to_string(),
                hint: "Install the container runtime and ensure `docker` is on PATH.".to_string(),
            }
        } else {
            ProvisionError::Process(format!("failed to run `{command}`: {err}"))
        }
    })?;
    if output.success() {
        return Ok(output);
    }
    let stderr = output.stderr_text();
    match classify_docker_failure(&stderr) {
        DockerFailure::SocketPermissionDenied => Err(ProvisionError::Permission {
            message: format!("`{command}` was denied access to the runtime socket: {stderr}"),
            hint: "Add the invoking user to the `docker` group or run as root, then re-run."
                .to_string(),
        }),
        DockerFailure::DaemonUnreachable => Err(ProvisionError::MissingDependency {
            name: "docker daemon".to_string(),
            hint: "Start the container runtime service (e.g. `systemctl start docker`) and re-run."
                .to_string(),
        }),
        DockerFailure::ComposeUnavailable => Err(ProvisionError::MissingDependency {
            name: "docker compose".to_string(),
            hint: "Install the compose plugin or the standalone docker-compose binary."
                .to_string(),
        }),
        DockerFailure::Other => Err(ProvisionError::Process(format!(
            "command failed with status {} while running `{command}`: {stderr}",
            output.status_code
        ))),
    }
}

/// Names of running containers whose name matches `filter`.
pub fn running_containers<R: DockerRunner>(
    runner: &R,
    filter: &str,
    cwd: &Path,
) -> Result<Vec<String>, ProvisionError> {
    let args = vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("name={filter}"),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ];
    let output = execute_docker(runner, &args, cwd)?;
    Ok(output
        .stdout_text()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Force-removes every container (running or not) matching `filter`.
pub fn remove_containers<R: DockerRunner>(
    runner: &R,
    filter: &str,
    cwd: &Path,
) -> Result<usize, ProvisionError> {
    let list = vec![
        "ps".to_string(),
        "-a".to_string(),
        "-q".to_string(),
        "--filter".to_string(),
        format!("name={filter}"),
    ];
    let output = execute_docker(runner, &list, cwd)?;
    let ids: Vec<String> = output
        .stdout_text()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let mut rm = vec!["rm".to_string(), "-f".to_string()];
    rm.extend(ids.iter().cloned());
    execute_docker(runner, &rm, cwd)?;
    Ok(ids.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeTool {
    Plugin,
    Standalone,
}

impl ComposeTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plugin => "docker compose",
            Self::Standalone => "docker-compose",
        }
    }
}

/// Read-only compose lookup: the plugin first, then the standalone binary.
pub fn detect_compose<R: DockerRunner, H: HostOps>(runner: &R, host: &H, cwd: &Path) -> Option<ComposeTool> {
    let args = vec!["compose".to_string(), "version".to_string()];
    if let Ok(output) = runner.run(&args, cwd) {
        if output.success() {
            return Some(ComposeTool::Plugin);
        }
    }
    host.find_program("docker-compose")
        .map(|_| ComposeTool::Standalone)
}

/// Finds compose tooling, allowing exactly one automated install attempt.
pub fn discover_compose<R: DockerRunner, H: HostOps>(
    runner: &R,
    host: &H,
    cwd: &Path,
) -> Result<ComposeTool, ProvisionError> {
    if let Some(tool) = detect_compose(runner, host, cwd) {
        info!(tool = tool.as_str(), "compose tooling found");
        return Ok(tool);
    }
    warn!("compose tooling not found; attempting one automated install");
    if let Err(err) = host.install_compose_tooling() {
        warn!(error = %err, "compose tooling install failed");
    }
    detect_compose(runner, host, cwd).ok_or_else(|| ProvisionError::MissingDependency {
        name: "docker compose".to_string(),
        hint: "Install the compose plugin (docker-compose-plugin) manually, then re-run."
            .to_string(),
    })
}

/// Confirms the runtime socket is usable, allowing exactly one automated
/// permission repair for `account`.
pub fn ensure_socket_access<R: DockerRunner, H: HostOps>(
    runner: &R,
    host: &H,
    account: &str,
    cwd: &Path,
) -> Result<(), ProvisionError> {
    let args = vec![
        "info".to_string(),
        "--format".to_string(),
        "{{.ServerVersion}}".to_string(),
    ];
    match execute_docker(runner, &args, cwd) {
        Ok(_) => return Ok(()),
        Err(ProvisionError::Permission { .. }) => {
            warn!(account, "runtime socket permission denied; attempting one repair");
        }
        Err(err) => return Err(err),
    }
    host.grant_socket_access(account)?;
    execute_docker(runner, &args, cwd).map(|_| ())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Answers `ps` calls from a queue (falling back to `ps_default`) and
    /// everything else from `outputs` (falling back to success).
    #[derive(Default)]
    pub struct MockDockerRunner {
        pub calls: RefCell<Vec<Vec<String>>>,
        pub ps_outputs: RefCell<VecDeque<String>>,
        pub ps_default: RefCell<String>,
        pub outputs: RefCell<VecDeque<CommandOutput>>,
    }

    impl MockDockerRunner {
        pub fn push_ps(&self, names: &str) {
            self.ps_outputs.borrow_mut().push_back(names.to_string());
        }

        pub fn set_ps_default(&self, names: &str) {
            *self.ps_default.borrow_mut() = names.to_string();
        }

        pub fn push_output(&self, output: CommandOutput) {
            self.outputs.borrow_mut().push_back(output);
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.borrow().clone()
        }

        pub fn count(&self, verb: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|args| args.first().map(String::as_str) == Some(verb))
                .count()
        }
    }

    pub fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn failed_output(stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    impl DockerRunner for MockDockerRunner {
        fn run(&self, args: &[String], _cwd: &Path) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(args.to_vec());
            let is_running_ps =
                args.first().map(String::as_str) == Some("ps") && !args.iter().any(|a| a == "-a");
            if is_running_ps {
                let names = self
                    .ps_outputs
                    .borrow_mut()
                    .pop_front()
                    .unwrap_or_else(|| self.ps_default.borrow().clone());
                return Ok(ok_output(&names));
            }
            Ok(self
                .outputs
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| ok_output("")))
        }
    }

    #[test]
    fn classifies_socket_permission() {
        let stderr = "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock";
        assert_eq!(
            classify_docker_failure(stderr),
            DockerFailure::SocketPermissionDenied
        );
        assert_eq!(
            classify_docker_failure("Cannot connect to the Docker daemon. Is the docker daemon running?"),
            DockerFailure::DaemonUnreachable
        );
        assert_eq!(
            classify_docker_failure("docker: 'compose' is not a docker command."),
            DockerFailure::ComposeUnavailable
        );
        assert_eq!(classify_docker_failure("boom"), DockerFailure::Other);
    }

    #[test]
    fn running_containers_parses_names() {
        let runner = MockDockerRunner::default();
        runner.push_ps("bitwarden-web\n\n bitwarden-api \n");
        let names = running_containers(&runner, "bitwarden", Path::new("/")).unwrap();
        assert_eq!(names, vec!["bitwarden-web", "bitwarden-api"]);
        let calls = runner.calls();
        assert!(calls[0].iter().any(|a| a == "name=bitwarden"));
    }

    #[test]
    fn remove_containers_skips_rm_when_none_match() {
        let runner = MockDockerRunner::default();
        runner.push_output(ok_output(""));
        assert_eq!(remove_containers(&runner, "bitwarden", Path::new("/")).unwrap(), 0);
        assert_eq!(runner.count("rm"), 0);

        runner.push_output(ok_output("abc\ndef\n"));
        assert_eq!(remove_containers(&runner, "bitwarden", Path::new("/")).unwrap(), 2);
        let rm = runner.calls().into_iter().find(|c| c[0] == "rm").unwrap();
        assert_eq!(rm, vec!["rm", "-f", "abc", "def"]);
    }

    #[test]
    fn execute_docker_maps_permission_failure() {
        let runner = MockDockerRunner::default();
        runner.push_output(failed_output(
            "Got permission denied while trying to connect to the Docker daemon socket",
        ));
        let err = execute_docker(&runner, &["info".to_string()], Path::new("/"))
            .expect_err("permission failure");
        assert!(matches!(err, ProvisionError::Permission { .. }));
    }
}
