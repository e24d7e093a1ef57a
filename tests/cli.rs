use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("vaultwright");
    let mut cmd = Command::new(path);
    cmd.env_remove("VAULTWRIGHT_INSTALLATION_KEY")
        .env_remove("VAULTWRIGHT_SMTP_PASSWORD")
        .env_remove("VAULTWRIGHT_LOG");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

/// Config pointing every host path into `root`.
fn write_host_config(root: &Path) -> PathBuf {
    let config_path = root.join("config.yaml");
    fs::write(
        &config_path,
        format!(
            "version: 1\nhost:\n  install_root: {}\n  passwd_file: {}\n  log_file: {}\n  lock_file: {}\nreadiness:\n  http_url: \"\"\n",
            root.join("opt/bitwarden").display(),
            root.join("passwd").display(),
            root.join("log/install.log").display(),
            root.join("run/vaultwright.lock").display(),
        ),
    )
    .unwrap();
    config_path
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("VAULTWRIGHT_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["created"], true);
    let path = config_dir.join("config.yaml");
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("service_account: bitwarden"));

    fs::write(&path, "version: 1\n").unwrap();
    let output = bin()
        .env("VAULTWRIGHT_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(parse_json(&output.stdout)["result"]["created"], false);
    assert_eq!(fs::read_to_string(&path).unwrap(), "version: 1\n");
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nhost:\n  instal_root: /opt/x\n").unwrap();

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .code(1)
        .stderr(contains("instal_root"));
}

#[test]
fn config_validate_accepts_shipped_default() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::copy("config/default.yaml", &config_path).unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(parse_json(&output.stdout)["result"]["valid"], true);
}

#[test]
fn status_on_empty_host_reports_not_installed() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["result"]["state"], "not_installed");
    assert_eq!(json["result"]["action"], "fresh_install");
    assert!(json["result"]["paths"].as_array().unwrap().len() >= 3);
    assert!(!dir.path().join("opt/bitwarden").exists());
}

#[test]
fn status_on_damaged_host_exits_with_corrupted_code() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());
    fs::create_dir_all(dir.path().join("opt")).unwrap();
    fs::write(dir.path().join("opt/bitwarden"), "not a directory").unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(13));
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert_eq!(json["exit_code"], 13);
    assert_eq!(json["result"]["state"], "corrupted");
    assert_eq!(json["result"]["action"], "offer_clean_reinstall");
}

#[test]
fn non_interactive_install_without_answers_fails_before_mutating() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("install")
        .arg("--non-interactive")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("missing installation answers"));
    assert!(!dir.path().join("opt/bitwarden").exists());
}

#[test]
fn non_interactive_install_declines_clean_reinstall_before_asking_for_answers() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());
    let install_root = dir.path().join("opt/bitwarden");
    fs::create_dir_all(&install_root).unwrap();

    let output = bin()
        .env("VAULTWRIGHT_INSTALLATION_KEY", "s3cr3t")
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("install")
        .arg("--non-interactive")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(10));
    let json = parse_json(&output.stdout);
    assert_eq!(json["exit_code"], 10);
    assert!(json["error"].as_str().unwrap().contains("declined"));
    assert!(install_root.exists());
    assert!(!String::from_utf8_lossy(&output.stderr).contains("s3cr3t"));
}

#[test]
fn configure_requires_a_completed_installation() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("configure")
        .assert()
        .code(1)
        .stderr(contains("vaultwright install"));
}

#[test]
fn invalid_log_filter_is_reported() {
    let dir = tempdir().unwrap();
    let config_path = write_host_config(dir.path());

    let output = bin()
        .arg("--json")
        .arg("--log-level")
        .arg("vaultwright=loudest")
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid log filter"), "stderr: {stderr}");
    assert_eq!(parse_json(&output.stdout)["result"]["state"], "not_installed");
}

#[test]
fn help_lists_subcommands() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("install"))
        .stdout(contains("status"))
        .stdout(contains("doctor"));
}
