// Fail-open quality gate.
//
// A recompute run either passes its invariant checks, and its constants
// version becomes the last known-good one, or fails, and the live system
// keeps serving a pinned version. The pinned version is an explicit override
// (environment) or the tail `Healthy` entry of an append-only version log.
//
// Writers must be serialized: only the batch job calls
// `record_successful_execution` / `handle_quality_failure`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::QualityConfig;

const QUALITY_STATUS_FILE: &str = "quality_status.json";
const VERSION_LOG_FILE: &str = "version_log.jsonl";
const PUBLIC_STATUS_FILE: &str = "quality.json";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize quality record for {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Outcome of one batch of invariant checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub coverage_pct: f64,
}

impl TestResults {
    /// Passed share of all checks in percent. Zero checks report 0.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64 * 100.0
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Which constants version a run was evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantsInfo {
    pub baseline_version: String,
    pub last_update: String,
}

/// Full record of the last successful run (`quality_status.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVersion {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "testResults")]
    pub test_results: TestResults,
    pub constants: ConstantsInfo,
}

/// Public status read by monitoring (`public/status/quality.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PublicStatus {
    Healthy {
        last_success: DateTime<Utc>,
        version: String,
        tests: TestResults,
        pinned: bool,
    },
    Degraded {
        last_failure: DateTime<Utc>,
        failure_reason: String,
        pinned_version: Option<String>,
        tests: TestResults,
        pinned: bool,
    },
    Unknown {
        message: String,
    },
}

impl PublicStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PublicStatus::Healthy { .. } => "healthy",
            PublicStatus::Degraded { .. } => "degraded",
            PublicStatus::Unknown { .. } => "unknown",
        }
    }
}

/// One transition of the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum VersionEvent {
    Healthy {
        version: String,
    },
    Degraded {
        reason: String,
        pinned: Option<String>,
    },
}

/// A line of the version log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: VersionEvent,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns the live-version pointer and the status files.
#[derive(Debug, Clone)]
pub struct FailOpenController {
    reports_dir: PathBuf,
    public_status_dir: PathBuf,
    pin: Option<String>,
    degraded_window: Duration,
}

impl FailOpenController {
    pub fn new(reports_dir: impl Into<PathBuf>, public_status_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            public_status_dir: public_status_dir.into(),
            pin: None,
            degraded_window: Duration::hours(24),
        }
    }

    /// Build from config, resolving paths against `base_dir` and reading the
    /// pin from the configured environment variable. An empty value is no pin.
    pub fn from_config(base_dir: &Path, quality: &QualityConfig) -> Self {
        let pin = std::env::var(&quality.pin_env)
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self::new(
            base_dir.join(&quality.reports_dir),
            base_dir.join(&quality.public_status_dir),
        )
        .with_pin(pin)
        .with_degraded_window(Duration::hours(i64::from(quality.degraded_window_hours)))
    }

    pub fn with_pin(mut self, pin: Option<String>) -> Self {
        self.pin = pin;
        self
    }

    pub fn with_degraded_window(mut self, window: Duration) -> Self {
        self.degraded_window = window;
        self
    }

    pub fn quality_status_path(&self) -> PathBuf {
        self.reports_dir.join(QUALITY_STATUS_FILE)
    }

    pub fn version_log_path(&self) -> PathBuf {
        self.reports_dir.join(VERSION_LOG_FILE)
    }

    pub fn public_status_path(&self) -> PathBuf {
        self.public_status_dir.join(PUBLIC_STATUS_FILE)
    }

    // -----------------------------------------------------------------------
    // Version log
    // -----------------------------------------------------------------------

    /// Every readable entry of the version log, oldest first. Malformed lines
    /// are skipped.
    pub fn version_log(&self) -> Result<Vec<VersionLogEntry>, QualityError> {
        let path = self.version_log_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QualityError::Io { path, source: e }),
        };

        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<VersionLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping malformed version log line {}: {e}", i + 1),
            }
        }
        Ok(entries)
    }

    /// Version of the newest `Healthy` entry.
    pub fn last_good_version(&self) -> Result<Option<String>, QualityError> {
        Ok(self
            .version_log()?
            .into_iter()
            .rev()
            .find_map(|entry| match entry.event {
                VersionEvent::Healthy { version } => Some(version),
                VersionEvent::Degraded { .. } => None,
            }))
    }

    fn append_event(&self, event: VersionEvent, now: DateTime<Utc>) -> Result<(), QualityError> {
        ensure_dir(&self.reports_dir)?;
        let path = self.version_log_path();
        let entry = VersionLogEntry {
            timestamp: now,
            event,
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| QualityError::Json {
            path: path.clone(),
            source: e,
        })?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| QualityError::Io {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| QualityError::Io { path, source: e })
    }

    // -----------------------------------------------------------------------
    // Gate operations
    // -----------------------------------------------------------------------

    /// The version to serve when a run fails: the explicit pin if set,
    /// otherwise the last known-good version, otherwise `None`.
    pub fn get_pinned_version(&self) -> Option<String> {
        if let Some(pin) = &self.pin {
            warn!("using pinned constants version from environment: {pin}");
            return Some(pin.clone());
        }

        match self.last_good_version() {
            Ok(Some(version)) => {
                info!("last good version available: {version}");
                Some(version)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read version log: {e}");
                None
            }
        }
    }

    pub fn record_successful_execution(
        &self,
        version: &str,
        test_results: TestResults,
        constants: ConstantsInfo,
    ) -> Result<(), QualityError> {
        self.record_successful_execution_at(version, test_results, constants, Utc::now())
    }

    /// Publish a healthy status and mark `version` as last known-good.
    ///
    /// The version log is appended last, so a failed status write leaves the
    /// last-good pointer where it was.
    pub fn record_successful_execution_at(
        &self,
        version: &str,
        test_results: TestResults,
        constants: ConstantsInfo,
        now: DateTime<Utc>,
    ) -> Result<(), QualityError> {
        let record = QualityVersion {
            version: version.to_string(),
            timestamp: now,
            test_results,
            constants,
        };
        write_json(&self.reports_dir, &self.quality_status_path(), &record)?;

        let status = PublicStatus::Healthy {
            last_success: now,
            version: version.to_string(),
            tests: test_results,
            pinned: self.pin.is_some(),
        };
        write_json(&self.public_status_dir, &self.public_status_path(), &status)?;

        self.append_event(
            VersionEvent::Healthy {
                version: version.to_string(),
            },
            now,
        )?;

        info!("quality gate success recorded: {version}");
        Ok(())
    }

    pub fn handle_quality_failure(&self, reason: &str, test_results: TestResults) -> Option<String> {
        self.handle_quality_failure_at(reason, test_results, Utc::now())
    }

    /// Publish a degraded status and return the version to keep serving.
    ///
    /// `None` means there is no fallback at all; the caller must not update
    /// live constants. Status write failures are logged, never returned.
    pub fn handle_quality_failure_at(
        &self,
        reason: &str,
        test_results: TestResults,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let pinned = self.get_pinned_version();

        let status = PublicStatus::Degraded {
            last_failure: now,
            failure_reason: reason.to_string(),
            pinned_version: pinned.clone(),
            tests: test_results,
            pinned: true,
        };
        if let Err(e) = write_json(&self.public_status_dir, &self.public_status_path(), &status) {
            error!("failed to write degraded status: {e}");
        }

        let event = VersionEvent::Degraded {
            reason: reason.to_string(),
            pinned: pinned.clone(),
        };
        if let Err(e) = self.append_event(event, now) {
            error!("failed to append to version log: {e}");
        }

        match &pinned {
            Some(version) => {
                warn!("quality gate failed: {reason}");
                warn!("failing open with pinned version: {version}");
            }
            None => {
                error!("quality gate failed and no fallback version available");
                error!("failure reason: {reason}");
            }
        }
        pinned
    }

    pub fn is_fail_open_mode(&self) -> bool {
        self.is_fail_open_mode_at(Utc::now())
    }

    /// True when a pin is set, or the public status is degraded and the
    /// failure is younger than the degraded window.
    pub fn is_fail_open_mode_at(&self, now: DateTime<Utc>) -> bool {
        self.pin.is_some() || self.has_recent_failure(now)
    }

    fn has_recent_failure(&self, now: DateTime<Utc>) -> bool {
        match self.read_public_status() {
            Some(PublicStatus::Degraded { last_failure, .. }) => {
                now.signed_duration_since(last_failure) < self.degraded_window
            }
            _ => false,
        }
    }

    fn read_public_status(&self) -> Option<PublicStatus> {
        let path = self.public_status_path();
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("failed to read quality status {}: {e}", path.display());
                None
            }
        }
    }

    /// Current public status, or `unknown` when none has been written.
    pub fn get_quality_status(&self) -> PublicStatus {
        self.read_public_status().unwrap_or_else(|| PublicStatus::Unknown {
            message: "Quality status not available".to_string(),
        })
    }

    /// Last successful run record, if any.
    pub fn last_quality_version(&self) -> Option<QualityVersion> {
        let text = std::fs::read_to_string(self.quality_status_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn generate_quality_report(
        &self,
        test_results: &TestResults,
        constants: &ConstantsInfo,
    ) -> String {
        self.generate_quality_report_at(test_results, constants, Utc::now())
    }

    /// Markdown summary of the gate for CI output.
    pub fn generate_quality_report_at(
        &self,
        test_results: &TestResults,
        constants: &ConstantsInfo,
        now: DateTime<Utc>,
    ) -> String {
        let pinned = self.is_fail_open_mode_at(now);
        let pinned_version = self.get_pinned_version();
        let version = pinned_version
            .clone()
            .unwrap_or_else(|| constants.baseline_version.clone());

        let mut report = format!(
            "## Quality Gate Report\n\n\
             **Generated**: {}\n\
             **Status**: {}\n\
             **Version**: {}\n\n\
             ### Test Results\n\
             - **Total Tests**: {}\n\
             - **Passed**: {}\n\
             - **Failed**: {}\n\
             - **Success Rate**: {:.1}%\n\
             - **Coverage**: {:.1}%\n\n\
             ### Configuration\n\
             - **Constants Version**: {}\n\
             - **Last Update**: {}\n\
             - **Pinned Mode**: {}",
            now.to_rfc3339(),
            if pinned { "FAIL-OPEN (Pinned)" } else { "HEALTHY" },
            version,
            test_results.total,
            test_results.passed,
            test_results.failed,
            test_results.success_rate(),
            test_results.coverage_pct,
            constants.baseline_version,
            constants.last_update,
            if pinned { "Yes" } else { "No" },
        );

        if pinned {
            report.push_str(&format!(
                "\n\n### Fail-Open Mode Active\n\
                 Service is running with pinned version `{}` due to quality gate issues.\n\
                 Check CI logs and resolve underlying issues to restore normal operation.",
                pinned_version.as_deref().unwrap_or("none")
            ));
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_dir(dir: &Path) -> Result<(), QualityError> {
    std::fs::create_dir_all(dir).map_err(|e| QualityError::Io {
        path: dir.to_path_buf(),
        source: e,
    })
}

fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), QualityError> {
    ensure_dir(dir)?;
    let json = serde_json::to_string_pretty(value).map_err(|e| QualityError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(path, json).map_err(|e| QualityError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
