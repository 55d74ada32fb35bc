// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Pid file management
//!
//! One decimal PID, one line, overwritten on start. Removal on graceful
//! exit is conditional: the configuration must opt in, and the file must
//! still hold our own PID - a restarted instance that already overwrote it
//! keeps its file.

use std::path::Path;

/// Write the current process id to `path`, truncating any prior contents.
pub fn write_pidfile(path: &Path) -> bool {
    let pid = std::process::id();
    match std::fs::write(path, format!("{pid}\n")) {
        Ok(()) => true,
        Err(err) => {
            eprintln!("open and write pid file {} failed: {err}", path.display());
            tracing::error!("open and write pid file {} failed: {err}", path.display());
            false
        }
    }
}

/// Remove `path` iff it still contains the current process id.
pub fn cleanup_pidfile(path: &Path) -> bool {
    let contents = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("try to remove pid file {} failed: {err}", path.display());
            return false;
        }
    };

    let recorded: u32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            eprintln!(
                "skip remove pid file {}. it does not hold a pid",
                path.display()
            );
            return false;
        }
    };

    let ours = std::process::id();
    if recorded != ours {
        eprintln!(
            "skip remove pid file {}. because it has pid {recorded}, but our pid is {ours}",
            path.display()
        );
        return false;
    }

    std::fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_pidfile(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("atapp-pid-{tag}-{}", std::process::id()))
    }

    #[test]
    fn write_then_cleanup() {
        let path = temp_pidfile("roundtrip");
        assert!(write_pidfile(&path));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(std::process::id().to_string(), written.trim());
        assert!(cleanup_pidfile(&path));
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_skips_foreign_pid() {
        let path = temp_pidfile("foreign");
        std::fs::write(&path, "1\n").unwrap();
        assert!(!cleanup_pidfile(&path));
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cleanup_of_missing_file_fails_gracefully() {
        let path = temp_pidfile("missing");
        assert!(!cleanup_pidfile(&path));
    }
}
