//! Per-test run state shared with background work.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Keyval file name inside the debug directory.
pub const KEYVAL_FILENAME: &str = "keyval";

/// One execution of a test case.
///
/// Holds the directories artifacts are written to, the iteration number used
/// in artifact names, recorded keyvals, and the queue of errors raised by
/// background work that the harness inspects after the test body.
#[derive(Debug)]
pub struct TestRun {
    bindir: PathBuf,
    debugdir: PathBuf,
    iteration: u32,
    keyvals: Mutex<BTreeMap<String, String>>,
    background_errors: Mutex<Vec<Error>>,
}

impl TestRun {
    /// Create a test run rooted at the given directories.
    pub fn new(bindir: impl Into<PathBuf>, debugdir: impl Into<PathBuf>, iteration: u32) -> Self {
        Self {
            bindir: bindir.into(),
            debugdir: debugdir.into(),
            iteration,
            keyvals: Mutex::new(BTreeMap::new()),
            background_errors: Mutex::new(Vec::new()),
        }
    }

    /// Directory of the test sources; hook commands run here.
    pub fn bindir(&self) -> &Path {
        &self.bindir
    }

    /// Directory for debug artifacts.
    pub fn debugdir(&self) -> &Path {
        &self.debugdir
    }

    /// Iteration number.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Record a keyval and append it to the keyval file.
    pub fn write_keyval(&self, key: &str, value: &str) -> Result<()> {
        self.keyvals.lock().insert(key.to_string(), value.to_string());

        std::fs::create_dir_all(&self.debugdir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.debugdir.join(KEYVAL_FILENAME))?;
        writeln!(file, "{}={}", key, value)?;
        Ok(())
    }

    /// Get a recorded keyval.
    pub fn keyval(&self, key: &str) -> Option<String> {
        self.keyvals.lock().get(key).cloned()
    }

    /// Queue an error raised outside the test body.
    pub fn push_background_error(&self, err: Error) {
        self.background_errors.lock().push(err);
    }

    /// Drain queued background errors.
    pub fn take_background_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.background_errors.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyvals_are_recorded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let run = TestRun::new(dir.path(), dir.path().join("debug"), 1);

        run.write_keyval("kvm_version", "6.8.0").unwrap();
        run.write_keyval("kvm_userspace_version", "8.2.0").unwrap();

        assert_eq!(run.keyval("kvm_version").as_deref(), Some("6.8.0"));
        let text = std::fs::read_to_string(dir.path().join("debug").join(KEYVAL_FILENAME)).unwrap();
        assert_eq!(text, "kvm_version=6.8.0\nkvm_userspace_version=8.2.0\n");
    }

    #[test]
    fn test_background_errors_drain_once() {
        let run = TestRun::new("/tmp", "/tmp", 1);
        run.push_background_error(Error::host("late"));
        assert_eq!(run.take_background_errors().len(), 1);
        assert!(run.take_background_errors().is_empty());
    }
}
