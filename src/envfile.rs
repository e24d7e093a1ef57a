//! In-place `key=value` rewriting of the workload's settings file.

use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SmtpSettings;

#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error("settings file {} does not exist", .path.display())]
    NotFound { path: PathBuf },
    #[error("settings file {} is not writable: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings key '{key}'")]
    InvalidKey { key: String },
    #[error("value for '{key}' must be a single line")]
    InvalidValue { key: String },
    #[error("failed to back up {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub path: PathBuf,
    pub changed: bool,
    pub replaced: Vec<String>,
    pub appended: Vec<String>,
    pub duplicates_removed: usize,
    pub backup: Option<PathBuf>,
}

fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    trimmed.split_once('=').map(|(key, _)| key.trim_end())
}

fn validate_updates(updates: &BTreeMap<String, String>) -> Result<(), ConfigWriteError> {
    for (key, value) in updates {
        if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
            return Err(ConfigWriteError::InvalidKey { key: key.clone() });
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(ConfigWriteError::InvalidValue { key: key.clone() });
        }
    }
    Ok(())
}

/// Pure rewrite: the last `key=` line of each updated key is replaced in
/// place, earlier duplicates are dropped, missing keys are appended in key
/// order. CRLF files stay CRLF.
pub fn rewrite(content: &str, updates: &BTreeMap<String, String>) -> (String, ApplyReport) {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = content.lines().collect();
    let mut last_index: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(key) = line_key(line) {
            if updates.contains_key(key) {
                last_index.insert(key, idx);
            }
        }
    }

    let mut report = ApplyReport::default();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + updates.len());
    for (idx, line) in lines.iter().enumerate() {
        match line_key(line).and_then(|key| updates.get_key_value(key)) {
            Some((key, value)) if last_index.get(key.as_str()) == Some(&idx) => {
                out.push(format!("{key}={value}"));
                report.replaced.push(key.clone());
            }
            Some(_) => report.duplicates_removed += 1,
            None => out.push((*line).to_string()),
        }
    }
    for (key, value) in updates {
        if !last_index.contains_key(key.as_str()) {
            out.push(format!("{key}={value}"));
            report.appended.push(key.clone());
        }
    }

    let mut rendered = out.join(newline);
    if !rendered.is_empty() {
        rendered.push_str(newline);
    }
    report.changed = rendered != content;
    (rendered, report)
}

fn check_target(path: &Path) -> Result<(), ConfigWriteError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            return Err(ConfigWriteError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigWriteError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(ConfigWriteError::NotWritable {
                path: path.to_path_buf(),
                source: err,
            })
        }
    }
    OpenOptions::new()
        .append(true)
        .open(path)
        .map(|_| ())
        .map_err(|source| ConfigWriteError::NotWritable {
            path: path.to_path_buf(),
            source,
        })
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "settings".to_string());
    let base = path.with_file_name(format!("{name}.bak.{stamp}"));
    if !base.exists() {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{name}.bak.{stamp}.{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn write_atomic_preserving_attrs(path: &Path, content: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "settings".to_string()),
        std::process::id(),
        ts
    ));
    let original = fs::metadata(path)?;
    fs::write(&tmp_path, content)?;
    let replaced = copy_ownership(&original, &tmp_path)
        .and_then(|()| fs::set_permissions(&tmp_path, original.permissions()))
        .and_then(|()| fs::rename(&tmp_path, path));
    if replaced.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    replaced
}

/// Gives the temp file the original's owner and group.
#[cfg(unix)]
fn copy_ownership(original: &fs::Metadata, tmp_path: &Path) -> io::Result<()> {
    use std::os::unix::fs::{chown, MetadataExt};
    let current = fs::metadata(tmp_path)?;
    if (current.uid(), current.gid()) == (original.uid(), original.gid()) {
        return Ok(());
    }
    chown(tmp_path, Some(original.uid()), Some(original.gid()))
}

#[cfg(not(unix))]
fn copy_ownership(_original: &fs::Metadata, _tmp_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Applies `updates` to the settings file at `path`. Nothing is touched unless
/// the file exists and is writable; an unchanged result writes nothing and
/// takes no backup.
pub fn apply(path: &Path, updates: &BTreeMap<String, String>) -> Result<ApplyReport, ConfigWriteError> {
    validate_updates(updates)?;
    check_target(path)?;
    let content = fs::read_to_string(path).map_err(|source| ConfigWriteError::NotWritable {
        path: path.to_path_buf(),
        source,
    })?;
    let (rendered, mut report) = rewrite(&content, updates);
    report.path = path.to_path_buf();
    if !report.changed {
        debug!(path = %path.display(), "settings already up to date");
        return Ok(report);
    }

    let backup = backup_path(path);
    fs::copy(path, &backup).map_err(|source| ConfigWriteError::Backup {
        path: backup.clone(),
        source,
    })?;
    write_atomic_preserving_attrs(path, &rendered).map_err(|source| ConfigWriteError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        path = %path.display(),
        backup = %backup.display(),
        replaced = report.replaced.len(),
        appended = report.appended.len(),
        "settings file updated"
    );
    report.backup = Some(backup);
    Ok(report)
}

/// Settings keys the workload reads for outbound mail and the admin portal.
pub fn smtp_updates(smtp: &SmtpSettings, domain: &str) -> BTreeMap<String, String> {
    let mut updates = BTreeMap::new();
    let reply_to = if smtp.username.contains('@') {
        smtp.username.clone()
    } else {
        format!("no-reply@{domain}")
    };
    updates.insert("globalSettings__mail__replyToEmail".to_string(), reply_to);
    updates.insert("globalSettings__mail__smtp__host".to_string(), smtp.host.clone());
    updates.insert("globalSettings__mail__smtp__port".to_string(), smtp.port.to_string());
    updates.insert("globalSettings__mail__smtp__ssl".to_string(), smtp.ssl.to_string());
    updates.insert("globalSettings__mail__smtp__username".to_string(), smtp.username.clone());
    updates.insert("globalSettings__mail__smtp__password".to_string(), smtp.password.clone());
    updates.insert("adminSettings__admins".to_string(), smtp.admin_email.clone());
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn backups(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(".bak."))
            .collect()
    }

    #[test]
    fn replaces_in_place_and_appends_missing() {
        let content = "# mail\nglobalSettings__mail__smtp__host=old\nOTHER=1\n";
        let (out, report) = rewrite(
            content,
            &updates(&[("globalSettings__mail__smtp__host", "smtp.example.com"), ("NEW", "x")]),
        );
        assert_eq!(
            out,
            "# mail\nglobalSettings__mail__smtp__host=smtp.example.com\nOTHER=1\nNEW=x\n"
        );
        assert_eq!(report.replaced, vec!["globalSettings__mail__smtp__host"]);
        assert_eq!(report.appended, vec!["NEW"]);
    }

    #[test]
    fn last_duplicate_wins_and_earlier_ones_are_dropped() {
        let content = "A=1\nB=keep\nA=2\n#A=commented\nA=3\n";
        let (out, report) = rewrite(content, &updates(&[("A", "9")]));
        assert_eq!(out, "B=keep\n#A=commented\nA=9\n");
        assert_eq!(report.duplicates_removed, 2);
    }

    #[test]
    fn missing_file_fails_without_creating_anything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        let err = apply(&path, &updates(&[("A", "1")])).expect_err("missing file");
        assert!(matches!(err, ConfigWriteError::NotFound { .. }));
        assert!(!path.exists());
        assert!(backups(dir.path()).is_empty());
    }

    #[test]
    fn multiline_value_rejected_before_touching_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        fs::write(&path, "A=1\n").unwrap();
        let err = apply(&path, &updates(&[("A", "1\nB=2")])).expect_err("multiline");
        assert!(matches!(err, ConfigWriteError::InvalidValue { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\n");
    }

    #[test]
    fn second_apply_converges_without_new_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        fs::write(&path, "A=old\nA=older\nB=2\n").unwrap();
        let wanted = updates(&[("A", "new"), ("C", "3")]);

        let first = apply(&path, &wanted).unwrap();
        assert!(first.changed);
        let backup = first.backup.clone().expect("backup on first mutation");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "A=old\nA=older\nB=2\n");

        let second = apply(&path, &wanted).unwrap();
        assert!(!second.changed);
        assert!(second.backup.is_none());
        assert_eq!(backups(dir.path()).len(), 1);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "A=new\nB=2\nC=3\n");
        assert_eq!(text.matches("A=").count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_preserves_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        fs::write(&path, "A=1\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        apply(&path, &updates(&[("A", "2")])).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_keeps_owner_and_group() {
        use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        fs::write(&path, "A=1\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        // Handing the file to another account needs root; otherwise it keeps ours.
        let owner = if chown(&path, Some(1234), Some(1234)).is_ok() {
            (1234, 1234)
        } else {
            let meta = fs::metadata(&path).unwrap();
            (meta.uid(), meta.gid())
        };

        let report = apply(&path, &updates(&[("A", "2")])).unwrap();
        assert!(report.changed);
        let meta = fs::metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), owner);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=2\n");
    }

    #[test]
    fn crlf_file_keeps_its_line_endings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.override.env");
        fs::write(&path, "A=1\r\nB=2\r\n").unwrap();

        let same = apply(&path, &updates(&[("A", "1")])).unwrap();
        assert!(!same.changed);
        assert!(backups(dir.path()).is_empty());

        let changed = apply(&path, &updates(&[("A", "3"), ("C", "4")])).unwrap();
        assert!(changed.changed);
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=3\r\nB=2\r\nC=4\r\n");
        assert!(!apply(&path, &updates(&[("A", "3"), ("C", "4")])).unwrap().changed);
    }

    #[test]
    fn smtp_keys_cover_mail_and_admins() {
        let smtp = SmtpSettings {
            host: "smtp.example.com".to_string(),
            username: "mailer".to_string(),
            password: "pw".to_string(),
            admin_email: "admin@example.com".to_string(),
            ..SmtpSettings::default()
        };
        let keys = smtp_updates(&smtp, "vault.example.com");
        assert_eq!(keys["globalSettings__mail__smtp__port"], "587");
        assert_eq!(keys["globalSettings__mail__replyToEmail"], "no-reply@vault.example.com");
        assert_eq!(keys["adminSettings__admins"], "admin@example.com");
        assert_eq!(keys.len(), 7);
    }
}
