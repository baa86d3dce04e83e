//! Rotating append-only failure log: one JSON object per line, one file per
//! configured `failLogFile`. Shaped like `storage/journal.rs`'s append-only
//! writer, but backed by a plain file instead of SQLite, since spec §4.5
//! only asks for a durable record a human or another tool can tail.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

/// A file grows past this before it's rotated aside.
const ROTATE_AT_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FailureLogError {
    #[error("opening failure log '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing failure log '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing failure record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One recorded replay failure: the rule matched the request, and at least
/// one of its targets errored (spec §3, §4.5 step 5). Field names match the
/// wire format spec §6 literally (`Time`/`Keys`/`Errors`).
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Keys")]
    pub keys: std::collections::BTreeMap<String, String>,
    #[serde(rename = "Errors")]
    pub errors: Vec<String>,
}

impl FailureRecord {
    /// Build a record stamped with the current local time at millisecond
    /// precision (`YYYY-MM-DD HH:MM:SS.mmm`, spec §6).
    pub fn now(keys: std::collections::BTreeMap<String, String>, errors: Vec<String>) -> Self {
        FailureRecord {
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            keys,
            errors,
        }
    }
}

/// Append-only JSON-lines writer for one `failLogFile`, serializing
/// concurrent writers from sibling flow workers behind a mutex.
pub struct FailureLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FailureLog {
    pub fn open(path: &Path) -> Result<Self, FailureLogError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| FailureLogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(FailureLog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &FailureRecord) -> Result<(), FailureLogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().expect("failure log mutex poisoned");
        self.rotate_if_needed(&mut file)?;
        file.write_all(&line).map_err(|source| FailureLogError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    fn rotate_if_needed(&self, file: &mut std::fs::File) -> Result<(), FailureLogError> {
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < ROTATE_AT_BYTES {
            return Ok(());
        }
        let rotated = self
            .path
            .with_extension(format!("{}.1", chrono::Utc::now().timestamp()));
        let _ = std::fs::rename(&self.path, rotated);
        *file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| FailureLogError::Open {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.log");
        let log = FailureLog::open(&path).unwrap();

        let mut keys = std::collections::BTreeMap::new();
        keys.insert("id".to_owned(), "abc".to_owned());
        let record = FailureRecord::now(
            keys,
            vec!["write http://127.0.0.1:9/api/v1/x fail:connection refused".to_owned()],
        );
        log.append(&record).unwrap();
        log.append(&record).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let first = contents.lines().next().unwrap();
        assert!(first.contains("\"Keys\":{\"id\":\"abc\"}"));
        assert!(first.contains("\"Errors\":[\"write http://127.0.0.1:9/api/v1/x fail:connection refused\"]"));
    }
}
