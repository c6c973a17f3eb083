//! Schema-validating notification archive
//!
//! Every decoded notification is written once as a canonical JSON document
//! under `{root}/{owner_app}/`, then the persisted file is validated against
//! the notification schema. Failures are collected in the `ArchiveReport`;
//! nothing escapes `archive()`.

use crate::notification::Notification;
use chrono::DateTime;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

/// Attempts at finding a free filename before giving up
const MAX_NAME_ATTEMPTS: usize = 16;

/// Outcome of archiving one notification
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArchiveReport {
    pub persisted: bool,
    pub valid: bool,
    /// Every problem met, in the order encountered
    pub errors: Vec<String>,
    pub path: Option<PathBuf>,
}

pub struct Archiver {
    root: PathBuf,
    schema_path: PathBuf,
    clock: MonotonicStamp,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>, schema_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            schema_path: schema_path.into(),
            clock: MonotonicStamp::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the documents of `owner_app`
    pub fn namespace_dir(&self, owner_app: &str) -> PathBuf {
        self.root.join(namespace_component(owner_app))
    }

    /// Persist and validate; blocking filesystem I/O
    pub fn archive(&self, notification: &Notification, owner_app: &str) -> ArchiveReport {
        let mut report = ArchiveReport::default();

        let document = match serde_json::to_string_pretty(notification) {
            Ok(doc) => doc,
            Err(e) => {
                report.errors.push(format!("cannot render document: {e}"));
                return report;
            }
        };

        let dir = self.namespace_dir(owner_app);
        if let Err(e) = fs::create_dir_all(&dir) {
            report
                .errors
                .push(format!("cannot create namespace {}: {e}", dir.display()));
            report.errors.push("validation skipped: document not persisted".to_string());
            return report;
        }

        match self.persist(&dir, &document) {
            Ok(path) => {
                info!("Notification {} archived at {}", notification.label(), path.display());
                report.persisted = true;
                report.path = Some(path);
            }
            Err(e) => {
                report.errors.push(e);
                report.errors.push("validation skipped: document not persisted".to_string());
                return report;
            }
        }

        if let Some(path) = &report.path {
            let violations = self.validate_file(path);
            report.valid = violations.is_empty();
            if !report.valid {
                warn!(
                    "Notification {} failed schema validation: {}",
                    notification.label(),
                    violations.join("; ")
                );
            }
            report.errors.extend(violations);
        }

        report
    }

    /// Write-once under a fresh timestamped name
    fn persist(&self, dir: &Path, document: &str) -> Result<PathBuf, String> {
        self.persist_with(dir, document, |file, bytes| file.write_all(bytes))
    }

    /// A failed write removes the partial file
    fn persist_with<W>(&self, dir: &Path, document: &str, mut write: W) -> Result<PathBuf, String>
    where
        W: FnMut(&mut File, &[u8]) -> io::Result<()>,
    {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(document_file_name(self.clock.next()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = write(&mut file, document.as_bytes()) {
                        drop(file);
                        if let Err(cleanup) = fs::remove_file(&path) {
                            warn!("Cannot remove partial document {}: {}", path.display(), cleanup);
                        }
                        return Err(format!("cannot write {}: {e}", path.display()));
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Archive name {} taken, retrying", path.display());
                }
                Err(e) => return Err(format!("cannot create {}: {e}", path.display())),
            }
        }
        Err(format!("no free document name in {}", dir.display()))
    }

    /// All schema violations of a persisted document; empty means valid
    pub fn validate_file(&self, document_path: &Path) -> Vec<String> {
        let schema = match self.load_schema() {
            Ok(schema) => schema,
            Err(e) => return vec![e],
        };

        let validator = match jsonschema::validator_for(&schema) {
            Ok(validator) => validator,
            Err(e) => return vec![format!("schema {} is invalid: {e}", self.schema_path.display())],
        };

        let instance: Value = match fs::read_to_string(document_path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(instance) => instance,
            Err(e) => return vec![format!("cannot read {}: {e}", document_path.display())],
        };

        validator.iter_errors(&instance).map(|e| e.to_string()).collect()
    }

    fn load_schema(&self) -> Result<Value, String> {
        if !self.schema_path.exists() {
            return Err(format!("schema not found: {}", self.schema_path.display()));
        }
        let text = fs::read_to_string(&self.schema_path)
            .map_err(|e| format!("cannot read schema {}: {e}", self.schema_path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("schema {} is not valid JSON: {e}", self.schema_path.display()))
    }
}

/// `notification_2024-01-01_00-00-00-123456789.json`
fn document_file_name(nanos: i64) -> String {
    let at = DateTime::from_timestamp_nanos(nanos);
    format!("notification_{}.json", at.format("%Y-%m-%d_%H-%M-%S-%9f"))
}

/// Application names become a single safe path component
fn namespace_component(owner_app: &str) -> String {
    let cleaned: String = owner_app
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Nanosecond timestamps, strictly increasing across calls
#[derive(Debug, Default)]
struct MonotonicStamp {
    last: AtomicI64,
}

impl MonotonicStamp {
    fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
