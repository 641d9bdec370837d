// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! PID file handling and the signals used to retire a previous relay instance.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Debug, Error)]
pub enum ProcessControlError {
    #[error("PID file {0} unavailable: {1}")]
    PidFileUnavailable(PathBuf, std::io::Error),
    #[error("PID file {0} does not hold a usable PID: {1:?}")]
    InvalidPid(PathBuf, String),
    #[error("PID file {0} is locked by another instance")]
    PidFileLocked(PathBuf),
    #[error("Refusing to signal our own process ({0})")]
    OwnProcess(i32),
    #[error("Unable to signal process {pid}: {source}")]
    SignalFailed {
        pid: i32,
        source: std::io::Error,
    },
}

/// Read the PID recorded by a running instance. Missing files and non-positive values are errors:
/// signalling an unknown process is never safe.
pub fn read_pid(path: &Path) -> Result<i32, ProcessControlError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ProcessControlError::PidFileUnavailable(path.into(), e))?;
    let trimmed = contents.trim();
    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ProcessControlError::InvalidPid(
            path.into(),
            trimmed.to_string(),
        )),
    }
}

/// The PID file of the running instance. Holds an exclusive advisory lock for as long as it lives
/// and removes the file when dropped.
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, ProcessControlError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ProcessControlError::PidFileUnavailable(path.into(), e))?;
        if file.try_lock_exclusive().is_err() {
            return Err(ProcessControlError::PidFileLocked(path.into()));
        }
        let pid = std::process::id();
        file.set_len(0)
            .and_then(|_| writeln!(file, "{pid}"))
            .and_then(|_| file.sync_all())
            .map_err(|e| ProcessControlError::PidFileUnavailable(path.into(), e))?;
        info!(?path, pid, "Wrote PID file");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Unable to remove PID file");
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            trace!(path = ?self.path, error = %e, "Unable to unlock PID file");
        }
    }
}

/// The out-of-band controls the supervisor has over another relay process.
pub trait ProcessControl {
    /// Ask the process to shut down (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<(), ProcessControlError>;

    /// Force the process down (SIGKILL).
    fn kill(&self, pid: i32) -> Result<(), ProcessControlError>;

    /// Whether the process still exists.
    fn is_alive(&self, pid: i32) -> bool;
}

/// Process control through POSIX signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProcessControl;

impl SignalProcessControl {
    fn send(pid: i32, signal: libc::c_int) -> Result<(), ProcessControlError> {
        if pid <= 0 {
            return Err(ProcessControlError::SignalFailed {
                pid,
                source: std::io::Error::from_raw_os_error(libc::ESRCH),
            });
        }
        if pid as u32 == std::process::id() {
            return Err(ProcessControlError::OwnProcess(pid));
        }
        // SAFETY: kill(2) has no memory-safety preconditions; pid was checked to be positive so
        // it cannot address a process group.
        let result = unsafe { libc::kill(pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            Err(ProcessControlError::SignalFailed {
                pid,
                source: std::io::Error::last_os_error(),
            })
        }
    }
}

impl ProcessControl for SignalProcessControl {
    fn terminate(&self, pid: i32) -> Result<(), ProcessControlError> {
        Self::send(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: i32) -> Result<(), ProcessControlError> {
        Self::send(pid, libc::SIGKILL)
    }

    fn is_alive(&self, pid: i32) -> bool {
        match Self::send(pid, 0) {
            Ok(()) => true,
            // EPERM: it exists, we just may not signal it.
            Err(ProcessControlError::SignalFailed { source, .. }) => {
                source.raw_os_error() == Some(libc::EPERM)
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn pid_file_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        {
            let pid_file = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(pid_file.path()).unwrap(), std::process::id() as i32);
        }
        assert!(!path.exists());
    }

    #[test]
    fn missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_pid(&dir.path().join("absent.pid")),
            Err(ProcessControlError::PidFileUnavailable(..))
        ));
    }

    #[test]
    fn non_positive_and_garbage_pids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        for contents in ["0\n", "-12\n", "abc", ""] {
            std::fs::write(&path, contents).unwrap();
            assert!(
                matches!(read_pid(&path), Err(ProcessControlError::InvalidPid(..))),
                "accepted {contents:?}"
            );
        }
    }

    #[test]
    fn refuses_to_signal_self() {
        let own = std::process::id() as i32;
        assert!(matches!(
            SignalProcessControl.terminate(own),
            Err(ProcessControlError::OwnProcess(_))
        ));
    }

    #[test]
    fn terminates_a_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(SignalProcessControl.is_alive(pid));

        SignalProcessControl.terminate(pid).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert!(!SignalProcessControl.is_alive(pid));
    }
}
