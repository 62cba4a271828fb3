use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-command failure injection and invocation counters
#[derive(Debug, Default)]
pub struct FailPoints {
    armed: Mutex<HashMap<String, u32>>,
    counts: Mutex<HashMap<String, u64>>,
}

impl FailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` invocations of `command` fail
    pub fn arm(&self, command: &str, times: u32) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if times == 0 {
            armed.remove(command);
        } else {
            armed.insert(command.to_string(), times);
        }
    }

    /// Make the next `times` invocations of `command` against `target` fail.
    /// Other targets of the same command are unaffected.
    pub fn arm_on(&self, command: &str, target: &str, times: u32) {
        self.arm(&scoped_key(command, target), times);
    }

    /// Record an invocation of `command`, failing it when a fail point is armed
    pub fn check(&self, command: &str) -> Result<()> {
        *self.counts.lock()?.entry(command.to_string()).or_insert(0) += 1;

        let mut armed = self.armed.lock()?;
        if take_one(&mut armed, command) {
            return Err(DbError::remote(command, "failpoint triggered"));
        }
        Ok(())
    }

    /// Like `check`, also honoring fail points armed for `target`
    pub fn check_on(&self, command: &str, target: &str) -> Result<()> {
        *self.counts.lock()?.entry(command.to_string()).or_insert(0) += 1;

        let mut armed = self.armed.lock()?;
        if take_one(&mut armed, &scoped_key(command, target)) || take_one(&mut armed, command) {
            return Err(DbError::remote(command, "failpoint triggered"));
        }
        Ok(())
    }

    pub fn count(&self, command: &str) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(command).copied().unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn scoped_key(command: &str, target: &str) -> String {
    format!("{}@{}", command, target)
}

fn take_one(armed: &mut HashMap<String, u32>, key: &str) -> bool {
    let Some(remaining) = armed.get_mut(key) else {
        return false;
    };
    *remaining -= 1;
    if *remaining == 0 {
        armed.remove(key);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_point_fires_n_times() {
        let fp = FailPoints::new();
        fp.arm("getMore", 2);

        assert!(fp.check("getMore").is_err());
        assert!(fp.check("find").is_ok());
        assert!(fp.check("getMore").is_err());
        assert!(fp.check("getMore").is_ok());

        assert_eq!(fp.count("getMore"), 3);
        assert_eq!(fp.count("find"), 1);
    }

    #[test]
    fn test_disarm() {
        let fp = FailPoints::new();
        fp.arm("insert", 5);
        fp.arm("insert", 0);
        assert!(fp.check("insert").is_ok());
    }

    #[test]
    fn test_scoped_fail_point() {
        let fp = FailPoints::new();
        fp.arm_on("insert", "media.fs.files", 1);

        assert!(fp.check_on("insert", "media.fs.chunks").is_ok());
        assert!(fp.check("insert").is_ok());
        assert!(fp.check_on("insert", "media.fs.files").is_err());
        assert!(fp.check_on("insert", "media.fs.files").is_ok());
        assert_eq!(fp.count("insert"), 4);
    }
}
