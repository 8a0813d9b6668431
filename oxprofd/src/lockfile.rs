use std::io;
use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockfileError {
    #[error("a daemon is already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("cannot write lockfile: {0}")]
    Io(#[from] io::Error),
}

/// Create the pid lockfile. A stale file whose owner is gone is silently
/// replaced; a live owner is fatal.
pub fn write_lockfile(path: &Path) -> Result<(), LockfileError> {
    if let Ok(contents) = std::fs::read_to_string(path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            // Probe with a null signal: success or EPERM means alive.
            let alive = match kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => true,
                Err(nix::errno::Errno::EPERM) => true,
                Err(_) => false,
            };
            if alive {
                return Err(LockfileError::AlreadyRunning(pid));
            }
        }
        std::fs::remove_file(path)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

pub fn remove_lockfile(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lockfiles_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        // A pid that cannot exist.
        std::fs::write(&path, "4194305\n").unwrap();
        write_lockfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn live_owner_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        match write_lockfile(&path) {
            Err(LockfileError::AlreadyRunning(pid)) => assert_eq!(pid, std::process::id()),
            other => panic!("{other:?}"),
        }
    }
}
