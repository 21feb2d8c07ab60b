//! Read-only diagnostics snapshot for `GET /alexa/health`.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use codelexa_common::Clock;
use serde::Serialize;

use crate::config::{NotificationCredentials, WorkerConfig};
use crate::status_store::{StatusEntry, StatusStore};

const RECENT_WINDOW: usize = 5;

pub const ISSUE_RUNNER_MISSING: &str = "runner_missing";
pub const ISSUE_RUNNER_NOT_EXECUTABLE: &str = "runner_not_executable";
pub const ISSUE_NOTIFICATIONS_UNCONFIGURED: &str = "notifications_unconfigured";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub issues: Vec<&'static str>,
    pub checked_at: DateTime<Utc>,
    pub version: &'static str,
    pub build_id: &'static str,
    pub runner: RunnerSection,
    pub notifications: NotificationSection,
    pub history: HistorySection,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSection {
    pub path: PathBuf,
    pub interpreter: Option<String>,
    pub exists: bool,
    pub executable: bool,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationSection {
    pub configured: bool,
    pub missing: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySection {
    pub path: PathBuf,
    pub count: usize,
    pub last_update_age_secs: Option<i64>,
    pub recent: Vec<RecentTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentTask {
    pub timestamp: DateTime<Utc>,
    pub task: String,
    pub status: String,
    pub summary: String,
    pub intent: String,
    pub recipient_count: usize,
}

impl From<&StatusEntry> for RecentTask {
    fn from(entry: &StatusEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            task: entry.task.clone(),
            status: entry.status.clone(),
            summary: entry.summary.clone(),
            intent: entry.intent.clone(),
            recipient_count: entry.recipients.len(),
        }
    }
}

pub struct HealthReporter {
    worker: WorkerConfig,
    credentials: NotificationCredentials,
    store: StatusStore,
    clock: Arc<dyn Clock>,
}

impl HealthReporter {
    pub fn new(
        worker: WorkerConfig,
        credentials: NotificationCredentials,
        store: StatusStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker,
            credentials,
            store,
            clock,
        }
    }

    /// Gather a snapshot. Configuration gaps become issue tags; only
    /// unexpected I/O failures are returned as errors.
    pub fn report(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let runner = self.inspect_runner()?;
        let notifications = NotificationSection {
            configured: self.credentials.is_configured(),
            missing: self.credentials.missing().to_vec(),
        };

        let entries = self.store.entries();
        let history = HistorySection {
            path: self.store.path().to_path_buf(),
            count: entries.len(),
            last_update_age_secs: entries
                .first()
                .map(|latest| (now - latest.timestamp).num_seconds().max(0)),
            recent: entries.iter().take(RECENT_WINDOW).map(RecentTask::from).collect(),
        };

        let mut issues = Vec::new();
        let runner_usable = if !runner.exists {
            issues.push(ISSUE_RUNNER_MISSING);
            false
        } else if !runner.executable && runner.interpreter.is_none() {
            issues.push(ISSUE_RUNNER_NOT_EXECUTABLE);
            false
        } else {
            true
        };
        if !notifications.configured {
            issues.push(ISSUE_NOTIFICATIONS_UNCONFIGURED);
        }

        let status = match (runner_usable, notifications.configured) {
            _ if issues.is_empty() => OverallStatus::Ok,
            (false, false) => OverallStatus::Error,
            _ => OverallStatus::Degraded,
        };

        Ok(HealthReport {
            status,
            issues,
            checked_at: now,
            version: env!("CARGO_PKG_VERSION"),
            build_id: codelexa_build_info::build_id(),
            runner,
            notifications,
            history,
        })
    }

    fn inspect_runner(&self) -> Result<RunnerSection> {
        let path = self.worker.runner.clone();
        let mut section = RunnerSection {
            path,
            interpreter: self.worker.interpreter.clone(),
            exists: false,
            executable: false,
            size_bytes: None,
            modified_at: None,
        };

        let metadata = match fs::metadata(&section.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(section),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to inspect runner {}", section.path.display()))
            }
        };

        section.exists = metadata.is_file();
        section.executable = section.exists && is_executable(&metadata);
        section.size_bytes = Some(metadata.len());
        section.modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(section)
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelexa_common::ManualClock;
    use tempfile::tempdir;

    fn configured() -> NotificationCredentials {
        NotificationCredentials::from_parts(
            Some("client".into()),
            Some("secret".into()),
            Some("amzn1.ask.skill.1".into()),
        )
    }

    fn unconfigured() -> NotificationCredentials {
        NotificationCredentials::from_parts(None, None, None)
    }

    fn worker(runner: PathBuf, interpreter: Option<&str>) -> WorkerConfig {
        WorkerConfig {
            runner,
            interpreter: interpreter.map(str::to_string),
            args: vec![],
            max_concurrent: None,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::<Utc>::from_timestamp(1_700_000_600, 0).unwrap(),
        ))
    }

    fn entry(n: i64, recipients: usize) -> StatusEntry {
        StatusEntry {
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + n, 0).unwrap(),
            task: format!("task {n}"),
            status: "success".into(),
            summary: format!("summary {n}"),
            session: None,
            recipients: (0..recipients).map(|i| format!("r{i}@example.com")).collect(),
            intent: "RunTaskIntent".into(),
        }
    }

    #[test]
    fn missing_runner_and_credentials_is_error() {
        let dir = tempdir().unwrap();
        let reporter = HealthReporter::new(
            worker(dir.path().join("absent.py"), Some("python3")),
            unconfigured(),
            StatusStore::new(dir.path().join("status.json")),
            clock(),
        );

        let report = reporter.report().unwrap();

        assert_eq!(report.status, OverallStatus::Error);
        assert!(report.issues.contains(&ISSUE_RUNNER_MISSING));
        assert!(report.issues.contains(&ISSUE_NOTIFICATIONS_UNCONFIGURED));
        assert_eq!(report.notifications.missing.len(), 3);
        assert_eq!(report.history.count, 0);
        assert!(report.history.last_update_age_secs.is_none());
    }

    #[test]
    fn runner_with_interpreter_and_credentials_is_ok() {
        let dir = tempdir().unwrap();
        let runner = dir.path().join("runner.py");
        fs::write(&runner, "print('hi')\n").unwrap();
        let reporter = HealthReporter::new(
            worker(runner, Some("python3")),
            configured(),
            StatusStore::new(dir.path().join("status.json")),
            clock(),
        );

        let report = reporter.report().unwrap();

        assert_eq!(report.status, OverallStatus::Ok);
        assert!(report.issues.is_empty());
        assert!(report.runner.exists);
        assert_eq!(report.runner.size_bytes, Some(12));
        assert!(report.runner.modified_at.is_some());
    }

    #[test]
    fn missing_credentials_alone_degrades() {
        let dir = tempdir().unwrap();
        let runner = dir.path().join("runner.py");
        fs::write(&runner, "").unwrap();
        let reporter = HealthReporter::new(
            worker(runner, Some("python3")),
            NotificationCredentials::from_parts(Some("client".into()), Some(" ".into()), None),
            StatusStore::new(dir.path().join("status.json")),
            clock(),
        );

        let report = reporter.report().unwrap();

        assert_eq!(report.status, OverallStatus::Degraded);
        assert_eq!(report.issues, vec![ISSUE_NOTIFICATIONS_UNCONFIGURED]);
        assert_eq!(report.notifications.missing.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_runner_without_interpreter_is_flagged() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let runner = dir.path().join("runner");
        fs::write(&runner, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&runner, fs::Permissions::from_mode(0o644)).unwrap();
        let reporter = HealthReporter::new(
            worker(runner.clone(), None),
            configured(),
            StatusStore::new(dir.path().join("status.json")),
            clock(),
        );

        let report = reporter.report().unwrap();
        assert_eq!(report.status, OverallStatus::Degraded);
        assert_eq!(report.issues, vec![ISSUE_RUNNER_NOT_EXECUTABLE]);

        fs::set_permissions(&runner, fs::Permissions::from_mode(0o755)).unwrap();
        let report = reporter.report().unwrap();
        assert_eq!(report.status, OverallStatus::Ok);
        assert!(report.runner.executable);
    }

    #[test]
    fn history_window_reduces_recent_entries() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        for n in 1..=8 {
            store.record(entry(n * 10, n as usize % 3)).unwrap();
        }
        let reporter = HealthReporter::new(
            worker(dir.path().join("absent"), None),
            configured(),
            store,
            clock(),
        );

        let report = reporter.report().unwrap();

        assert_eq!(report.history.count, 8);
        assert_eq!(report.history.recent.len(), RECENT_WINDOW);
        assert_eq!(report.history.recent[0].task, "task 80");
        assert_eq!(report.history.recent[0].recipient_count, 2);
        assert_eq!(report.history.last_update_age_secs, Some(520));
    }

    #[test]
    fn report_serializes_lowercase_status() {
        let dir = tempdir().unwrap();
        let reporter = HealthReporter::new(
            worker(dir.path().join("absent"), None),
            unconfigured(),
            StatusStore::new(dir.path().join("status.json")),
            clock(),
        );

        let json = serde_json::to_value(reporter.report().unwrap()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["issues"][0], "runner_missing");
        assert!(json["checked_at"].is_string());
    }
}
