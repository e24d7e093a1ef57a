mod config;
mod docker;
mod driver;
mod envfile;
mod error;
mod host;
mod orchestrator;
mod planner;
mod probe;
mod readiness;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{
    read_config, resolve_config_path, validate_smtp, AnswerOverrides, Config, PromptingAnswers,
    Region, TlsMode, DEFAULT_CONFIG_YAML,
};
use crate::docker::{detect_compose, execute_docker, DockerRunner, RealDockerRunner};
use crate::driver::SessionCommand;
use crate::error::{ExitStatus, ProvisionError};
use crate::host::{HostOps, RealHostOps, RunLock};
use crate::orchestrator::{ConfirmGate, FixedGate, Orchestrator, PromptGate, RunOptions};
use crate::planner::plan;
use crate::probe::{classify, InstallState, StatusProbe};
use crate::readiness::{workload_check, ReadinessOutcome, ReadinessWaiter};

#[derive(Parser, Debug)]
#[command(
    name = "vaultwright",
    version,
    about = "Provision and recover a self-hosted vault stack"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Log filter, e.g. `info` or `vaultwright=debug`.
    #[arg(long, global = true, env = "VAULTWRIGHT_LOG")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the host and install, resume, repair or start the workload.
    Install {
        /// Approve a clean reinstall without asking.
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long, default_value_t = false)]
        non_interactive: bool,
        /// Fail when the workload does not become ready in time.
        #[arg(long, default_value_t = false)]
        strict_readiness: bool,
        #[command(flatten)]
        answers: AnswerArgs,
    },
    /// Show the detected state and the action `install` would take.
    Status,
    Doctor {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Apply mail and admin settings to an existing installation and restart it.
    Configure {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, env = "VAULTWRIGHT_SMTP_PASSWORD", hide_env_values = true)]
        smtp_password: Option<String>,
        #[arg(long, default_value_t = false)]
        no_restart: bool,
        #[arg(long, default_value_t = false)]
        strict_readiness: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Args, Debug, Default)]
struct AnswerArgs {
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, value_enum)]
    tls: Option<TlsMode>,
    #[arg(long, value_enum)]
    region: Option<Region>,
    #[arg(long)]
    installation_id: Option<String>,
    #[arg(long, env = "VAULTWRIGHT_INSTALLATION_KEY", hide_env_values = true)]
    installation_key: Option<String>,
    #[arg(long, env = "VAULTWRIGHT_SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,
}

impl AnswerArgs {
    fn overrides(&self) -> AnswerOverrides {
        AnswerOverrides {
            domain: self.domain.clone(),
            email: self.email.clone(),
            tls: self.tls,
            region: self.region,
            installation_id: self.installation_id.clone(),
            installation_key: self.installation_key.clone(),
            smtp_password: self.smtp_password.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    exit_code: i32,
}

struct Context {
    config_path: PathBuf,
    json: bool,
}

fn init_tracing(level: Option<&str>, json: bool) {
    let (filter, rejected) = match level.map(EnvFilter::try_new) {
        Some(Ok(filter)) => (filter, None),
        Some(Err(err)) => (EnvFilter::new("info"), Some(err)),
        None => (EnvFilter::new("info"), None),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.with_writer(io::stderr).init();
    } else {
        builder.init();
    }
    if let Some(err) = rejected {
        warn!(filter = level.unwrap_or_default(), error = %err, "invalid log filter; using info");
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.json);
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };
    let runner = RealDockerRunner;
    let host = RealHostOps;

    let result = match cli.command {
        Commands::Install {
            yes,
            non_interactive,
            strict_readiness,
            answers,
        } => handle_install(
            &ctx,
            &runner,
            &host,
            yes,
            non_interactive,
            strict_readiness,
            &answers,
        ),
        Commands::Status => handle_status(&ctx, &runner),
        Commands::Doctor { strict } => handle_doctor(&ctx, &runner, &host, strict),
        Commands::Configure {
            domain,
            smtp_password,
            no_restart,
            strict_readiness,
        } => handle_configure(
            &ctx,
            &runner,
            &host,
            domain,
            smtp_password,
            no_restart,
            strict_readiness,
        ),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    let status = match result {
        Ok(status) => status,
        Err(err) => {
            let status = err.exit_status();
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    exit_code: status.code(),
                };
                if let Err(print_err) = print_json(&payload) {
                    eprintln!("{print_err}");
                }
            } else {
                eprintln!("{err}");
            }
            status
        }
    };
    std::process::exit(status.code());
}

fn handle_install<R: DockerRunner, H: HostOps>(
    ctx: &Context,
    runner: &R,
    host: &H,
    yes: bool,
    non_interactive: bool,
    strict_readiness: bool,
    answer_args: &AnswerArgs,
) -> Result<ExitStatus, ProvisionError> {
    let cfg = read_config(&ctx.config_path)?;
    let interactive = !non_interactive && io::stdin().is_terminal();
    let draft = cfg.install.clone().with_overrides(&answer_args.overrides());
    let answers = PromptingAnswers::new(draft, interactive);
    let gate: Box<dyn ConfirmGate> = if yes {
        Box::new(FixedGate(true))
    } else if interactive {
        Box::new(PromptGate)
    } else {
        Box::new(FixedGate(false))
    };
    let options = RunOptions {
        strict_readiness,
        handle_signals: true,
        use_lock: true,
    };
    let report = Orchestrator::new(&cfg, runner, host, &answers, gate.as_ref(), options).run()?;
    if ctx.json {
        output(ctx, serde_json::to_value(&report)?, ExitStatus::Success)
    } else {
        report.log();
        Ok(ExitStatus::Success)
    }
}

fn handle_status<R: DockerRunner>(ctx: &Context, runner: &R) -> Result<ExitStatus, ProvisionError> {
    let cfg = read_config(&ctx.config_path)?;
    let probe = StatusProbe::new(&cfg.host, &cfg.readiness.expected_containers, runner);
    let observation = probe.observe();
    let state = classify(&observation);
    let action = plan(state);
    let exit = if state == InstallState::Corrupted {
        ExitStatus::CorruptedState
    } else {
        ExitStatus::Success
    };

    let paths: Vec<serde_json::Value> = probe
        .paths()
        .into_iter()
        .map(|(name, path)| json!({"name": name, "path": path, "exists": path.exists()}))
        .collect();

    if ctx.json {
        return output(
            ctx,
            json!({
                "state": state,
                "action": action,
                "description": action.describe(),
                "observation": observation,
                "paths": paths,
            }),
            exit,
        );
    }

    println!("state: {state}");
    println!("next action: {action} ({})", action.describe());
    println!(
        "service account '{}': {}",
        cfg.host.service_account,
        if observation.account_exists { "present" } else { "absent" }
    );
    for (name, path) in probe.paths() {
        let marker = if path.exists() { "present" } else { "absent" };
        println!("{name}: {} ({marker})", path.display());
    }
    if !observation.running_containers.is_empty() {
        println!("running: {}", observation.running_containers.join(", "));
    }
    if let Some(fault) = &observation.fault {
        println!("fault: {fault}");
    }
    Ok(exit)
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    strict_fail: bool,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn collect_doctor_checks<R: DockerRunner, H: HostOps>(
    cfg: &Config,
    runner: &R,
    host: &H,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let cwd = Path::new("/");

    let docker = host.find_program("docker");
    checks.push(doctor_check(
        "runtime_binary",
        docker.is_some(),
        "error",
        true,
        match &docker {
            Some(path) => format!("docker found at {}", path.display()),
            None => "docker is not on PATH".to_string(),
        },
        "Install the container runtime (`vaultwright install` does this automatically).",
    ));

    if docker.is_some() {
        let info = vec![
            "info".to_string(),
            "--format".to_string(),
            "{{.ServerVersion}}".to_string(),
        ];
        let (daemon_ok, socket_ok, message) = match execute_docker(runner, &info, cwd) {
            Ok(output) => (
                true,
                true,
                format!("daemon reachable (server {})", output.stdout_text().trim()),
            ),
            Err(err @ ProvisionError::Permission { .. }) => (true, false, err.to_string()),
            Err(err) => (false, false, err.to_string()),
        };
        checks.push(doctor_check(
            "runtime_daemon",
            daemon_ok,
            "error",
            true,
            if daemon_ok { "daemon reachable".to_string() } else { message.clone() },
            "Start the runtime service, e.g. `systemctl start docker`.",
        ));
        checks.push(doctor_check(
            "runtime_socket",
            socket_ok,
            "warning",
            true,
            message,
            "Add the invoking user to the `docker` group or run as root.",
        ));

        let compose = detect_compose(runner, host, cwd);
        checks.push(doctor_check(
            "compose",
            compose.is_some(),
            "warning",
            true,
            match compose {
                Some(tool) => format!("{} available", tool.as_str()),
                None => "neither `docker compose` nor `docker-compose` found".to_string(),
            },
            "Install docker-compose-plugin (install will try once automatically).",
        ));
    }

    if cfg.installer.run_as_service_account {
        let sudo = host.find_program("sudo");
        checks.push(doctor_check(
            "sudo",
            sudo.is_some(),
            "error",
            true,
            if sudo.is_some() { "sudo available" } else { "sudo is not on PATH" },
            "Install sudo or set installer.run_as_service_account to false.",
        ));
    }

    let script = cfg.host.installer_script_path();
    checks.push(doctor_check(
        "installer_script",
        script.is_file(),
        "warning",
        false,
        format!(
            "{} {}",
            script.display(),
            if script.is_file() { "present" } else { "not downloaded yet" }
        ),
        "Run `vaultwright install` to download it.",
    ));

    checks
}

fn handle_doctor<R: DockerRunner, H: HostOps>(
    ctx: &Context,
    runner: &R,
    host: &H,
    strict: bool,
) -> Result<ExitStatus, ProvisionError> {
    let cfg = read_config(&ctx.config_path)?;
    let checks = collect_doctor_checks(&cfg, runner, host);
    let has_error = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let has_strict_warning = checks.iter().any(|check| !check.ok && check.strict_fail);
    let ok = !has_error && (!strict || !has_strict_warning);
    let exit = if ok {
        ExitStatus::Success
    } else {
        ExitStatus::DependencyMissing
    };
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .or_else(|| checks.iter().find(|check| !check.ok && strict && check.strict_fail))
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: if ok { None } else { primary_error },
            exit_code: exit.code(),
        };
        print_json(&payload)?;
        return Ok(exit);
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if let Some(message) = primary_error.filter(|_| !ok) {
        eprintln!("{message}");
    }
    Ok(exit)
}

fn handle_configure<R: DockerRunner, H: HostOps>(
    ctx: &Context,
    runner: &R,
    host: &H,
    domain: Option<String>,
    smtp_password: Option<String>,
    no_restart: bool,
    strict_readiness: bool,
) -> Result<ExitStatus, ProvisionError> {
    let cfg = read_config(&ctx.config_path)?;
    let _lock = RunLock::acquire(&cfg.host.lock_file_path())?;
    let state = StatusProbe::new(&cfg.host, &cfg.readiness.expected_containers, runner).probe();
    match state {
        InstallState::InstalledStopped | InstallState::InstalledRunning => {}
        InstallState::Corrupted => {
            return Err(ProvisionError::Corrupted(format!(
                "{} cannot be inspected",
                cfg.host.install_root().display()
            )))
        }
        other => {
            return Err(ProvisionError::Config(format!(
                "no completed installation ({other}); run `vaultwright install` first"
            )))
        }
    }

    let answers = cfg.install.clone().with_overrides(&AnswerOverrides {
        domain,
        smtp_password,
        ..AnswerOverrides::default()
    });
    let Some(smtp) = answers.smtp.as_ref() else {
        return Err(ProvisionError::Config(
            "install.smtp is not set in the config file".to_string(),
        ));
    };
    validate_smtp(smtp)?;
    let domain = if answers.domain.trim().is_empty() {
        "localhost"
    } else {
        answers.domain.trim()
    };

    let updates = envfile::smtp_updates(smtp, domain);
    let applied = envfile::apply(&cfg.host.settings_file_path(), &updates)?;

    let mut readiness = None;
    let restart = applied.changed && !no_restart;
    if restart {
        let command = SessionCommand::installer(&cfg.host, &cfg.installer, "restart");
        host.run_installer_subcommand(&command)?;
        let outcome =
            ReadinessWaiter::default().wait(workload_check(runner, &cfg.host, &cfg.readiness));
        if let ReadinessOutcome::Timeout { attempts } = outcome {
            if strict_readiness {
                return Err(ProvisionError::ReadinessTimeout { attempts });
            }
            warn!(attempts, "workload did not become ready after restart");
        }
        readiness = Some(outcome);
    } else if !applied.changed {
        info!("settings unchanged; restart skipped");
    }

    output(
        ctx,
        json!({
            "settings": applied,
            "restarted": restart,
            "readiness": readiness,
        }),
        ExitStatus::Success,
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<ExitStatus, ProvisionError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(
                    ctx,
                    json!({"path": ctx.config_path, "created": false}),
                    ExitStatus::Success,
                );
            }
            if let Some(parent) = ctx.config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "created": true}),
                ExitStatus::Success,
            )
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true}),
                ExitStatus::Success,
            )
        }
    }
}

fn output(
    ctx: &Context,
    payload: serde_json::Value,
    status: ExitStatus,
) -> Result<ExitStatus, ProvisionError> {
    if ctx.json {
        let ok = status == ExitStatus::Success;
        let wrapper = JsonResult {
            ok,
            result: Some(payload),
            error: (!ok).then(|| status.as_str().to_string()),
            exit_code: status.code(),
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(status)
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ProvisionError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
