//! Append-only recognition history.

use crate::store::StoredPerson;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::{Identity, RecognitionEvent};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("failed to write audit log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// UTF-8 text file with one recognition per line.
///
/// Lines name known persons "Last First"; anyone else by the event label.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    names: HashMap<Identity, String>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            names: HashMap::new(),
        }
    }

    pub fn with_persons(mut self, persons: &[StoredPerson]) -> Self {
        self.names.extend(
            persons
                .iter()
                .map(|p| (p.identity.clone(), p.fields.record_name())),
        );
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, event: &RecognitionEvent) -> String {
        let name = self
            .names
            .get(&event.identity)
            .map_or(event.label.as_str(), String::as_str);
        format_line(event, name)
    }

    /// Append one event, creating the file and its directory on first use.
    pub fn append(&self, event: &RecognitionEvent) -> Result<(), AuditError> {
        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", self.line(event)).map_err(io_err)
    }
}

/// `YYYY-MM-DD HH:MM:SS - <name> (id: <identity>)`
pub fn format_line(event: &RecognitionEvent, name: &str) -> String {
    format!(
        "{} - {} (id: {})",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        name,
        event.identity
    )
}
