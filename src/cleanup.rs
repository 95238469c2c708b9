/// Enforced cleanup section: a guarded block whose cleanup logic runs exactly
/// once even if the owning process is killed with an unmaskable signal.
///
/// Arming the section acquires an exclusive file lock. A forked watchdog
/// child then blocks on that same lock (through its own descriptor). If the
/// parent finishes normally it runs the cleanup itself, writes a sentinel
/// byte through the descriptor, and releases the lock; the watchdog sees the
/// sentinel and exits. If the parent dies holding the lock, the kernel
/// releases it and the watchdog acquires it; finding no sentinel, the
/// watchdog runs the cleanup in the parent's stead. Memory dies with a killed
/// process, so the handshake lives in the kernel and the filesystem instead.
use std::io::{self, Write};
use std::path::Path;
use std::process;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::lock::{LockError, ProcessLock};

/// Byte written through the lock descriptor when the parent completes the
/// section normally.
const CLEAN_EXIT_SENTINEL: u8 = b'!';

/// Exit code of a watchdog that hit an unrecoverable error while guarding.
/// Such a watchdog can assert nothing about whether cleanup ran, so it gets
/// out of the way loudly instead of guessing.
const WATCHDOG_FATAL_EXIT: i32 = 86;

/// Errors raised while arming or closing a cleanup section.
#[derive(Debug)]
pub enum CleanupError {
    /// The initial lock could not be created or acquired; the section was
    /// never armed and no watchdog exists.
    Lock { source: LockError },
    /// The private lock file could not be created.
    LockFile { source: io::Error },
    /// Forking the watchdog failed.
    Fork { source: io::Error },
    /// Reaping the watchdog on the clean path failed.
    Reap { source: io::Error },
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupError::Lock { source } => {
                write!(f, "failed to arm cleanup section: {}", source)
            }
            CleanupError::LockFile { source } => {
                write!(f, "failed to create cleanup lock file: {}", source)
            }
            CleanupError::Fork { source } => {
                write!(f, "failed to fork cleanup watchdog: {}", source)
            }
            CleanupError::Reap { source } => {
                write!(f, "failed to reap cleanup watchdog: {}", source)
            }
        }
    }
}

impl std::error::Error for CleanupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CleanupError::Lock { source } => Some(source),
            CleanupError::LockFile { source } => Some(source),
            CleanupError::Fork { source } => Some(source),
            CleanupError::Reap { source } => Some(source),
        }
    }
}

/// A scoped cleanup guarantee.
///
/// ```no_run
/// use stepforge::cleanup::EnforcedCleanupSection;
///
/// let mut section = EnforcedCleanupSection::arm(|| {
///     // teardown that must not be skipped
/// })?;
/// section.fork_watchdog()?;
/// // ... protected work ...
/// section.finish()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EnforcedCleanupSection<C: FnOnce() + Send> {
    lock: ProcessLock,
    // Owns the lock file's lifetime; deleted when the section drops cleanly.
    lock_file: NamedTempFile,
    cleanup: Option<C>,
    watchdog: Option<Pid>,
    finished: bool,
}

impl<C: FnOnce() + Send> EnforcedCleanupSection<C> {
    /// Arm the section: create a private lock file and take the exclusive
    /// lock in the calling process. Lock failure here is an ordinary error;
    /// nothing has been forked and nothing needs undoing.
    pub fn arm(cleanup: C) -> Result<Self, CleanupError> {
        let lock_file = NamedTempFile::new().map_err(|e| CleanupError::LockFile { source: e })?;
        let lock = ProcessLock::open(lock_file.path())
            .map_err(|e| CleanupError::Lock { source: e })?;
        lock.lock().map_err(|e| CleanupError::Lock { source: e })?;

        debug!(lock = %lock_file.path().display(), "cleanup section armed");
        Ok(Self {
            lock,
            lock_file,
            cleanup: Some(cleanup),
            watchdog: None,
            finished: false,
        })
    }

    /// Fork the watchdog child. May be called at most once per section.
    ///
    /// # Panics
    ///
    /// Panics if called a second time; two watchdogs guarding one section is
    /// a programming error the section cannot reason about.
    pub fn fork_watchdog(&mut self) -> Result<(), CleanupError> {
        assert!(
            self.watchdog.is_none(),
            "fork_watchdog called twice on the same cleanup section"
        );

        // Don't let buffered bytes cross the fork and get written twice.
        io::stdout().flush().ok();
        io::stderr().flush().ok();

        match unsafe { fork() }.map_err(|e| CleanupError::Fork {
            source: io::Error::from(e),
        })? {
            ForkResult::Child => {
                let cleanup = self.cleanup.take();
                watchdog_main(self.lock_file.path(), cleanup)
            }
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), "cleanup watchdog forked");
                self.watchdog = Some(child);
                Ok(())
            }
        }
    }

    /// Close the section on the clean path: run the cleanup in the calling
    /// process, write the sentinel, release the lock, and reap the watchdog.
    pub fn finish(mut self) -> Result<(), CleanupError> {
        self.complete()
    }

    fn complete(&mut self) -> Result<(), CleanupError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }

        // Sentinel first, then release: the watchdog only ever reads the byte
        // after winning the lock, so it either sees the sentinel or the
        // parent truly died before this point.
        self.lock
            .write_byte(CLEAN_EXIT_SENTINEL)
            .map_err(|e| CleanupError::Lock { source: e })?;
        self.lock
            .unlock()
            .map_err(|e| CleanupError::Lock { source: e })?;

        if let Some(pid) = self.watchdog.take() {
            waitpid(pid, None).map_err(|e| CleanupError::Reap {
                source: io::Error::from(e),
            })?;
        }
        debug!("cleanup section closed cleanly");
        Ok(())
    }
}

impl<C: FnOnce() + Send> Drop for EnforcedCleanupSection<C> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.complete() {
                warn!(%err, "cleanup section teardown failed");
            }
        }
    }
}

/// Body of the watchdog child. Never returns to caller code.
fn watchdog_main<C: FnOnce()>(lock_path: &Path, cleanup: Option<C>) -> ! {
    // The watchdog must not be casually interruptible while guarding; a ^C
    // aimed at the build kills the parent, not the guarantee.
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }.ok();

    // A fresh descriptor on the lock file: the inherited one shares the
    // parent's open file description and with it the parent's lock.
    let lock = match ProcessLock::open(lock_path) {
        Ok(lock) => lock,
        Err(err) => {
            error!(%err, "watchdog could not open the section lock");
            process::exit(WATCHDOG_FATAL_EXIT);
        }
    };
    if let Err(err) = lock.lock() {
        error!(%err, "watchdog failed waiting for the section lock");
        process::exit(WATCHDOG_FATAL_EXIT);
    }

    match lock.read_byte() {
        Ok(Some(CLEAN_EXIT_SENTINEL)) => {
            debug!("parent exited cleanly, watchdog standing down");
            process::exit(0);
        }
        Ok(_) => {
            // No sentinel (or garbage): the parent died inside the section.
            warn!("parent died inside cleanup section, watchdog running cleanup");
            if let Some(cleanup) = cleanup {
                cleanup();
            }
            process::exit(0);
        }
        Err(err) => {
            error!(%err, "watchdog could not read the handshake byte");
            process::exit(WATCHDOG_FATAL_EXIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::sys::wait::WaitStatus;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn init_test_logging() {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    }

    fn marker_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cleanup-marker");
        (dir, path)
    }

    fn append_marker(path: &Path) {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(b"cleaned\n").unwrap();
    }

    fn marker_lines(path: &Path) -> usize {
        fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
    }

    /// Poll until the marker file has at least one line or the deadline hits.
    fn wait_for_marker(path: &Path, deadline: Duration) {
        let start = Instant::now();
        while marker_lines(path) == 0 && start.elapsed() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn clean_exit_runs_cleanup_exactly_once_in_parent() {
        init_test_logging();
        let (_dir, marker) = marker_path();
        let marker_for_cleanup = marker.clone();

        let mut section =
            EnforcedCleanupSection::arm(move || append_marker(&marker_for_cleanup)).unwrap();
        section.fork_watchdog().unwrap();

        // Protected work.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(marker_lines(&marker), 0, "cleanup ran early");

        section.finish().unwrap();

        // finish() reaps the watchdog, so by now both paths have settled;
        // give the filesystem a moment anyway before the final count.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(marker_lines(&marker), 1);
    }

    #[test]
    fn dropping_section_behaves_like_finish() {
        init_test_logging();
        let (_dir, marker) = marker_path();
        let marker_for_cleanup = marker.clone();

        {
            let mut section =
                EnforcedCleanupSection::arm(move || append_marker(&marker_for_cleanup)).unwrap();
            section.fork_watchdog().unwrap();
        }

        thread::sleep(Duration::from_millis(100));
        assert_eq!(marker_lines(&marker), 1);
    }

    #[test]
    fn killed_parent_hands_cleanup_to_watchdog() {
        init_test_logging();
        let (_dir, marker) = marker_path();

        // Play the doomed parent in a forked child so the test process
        // survives the SIGKILL.
        io::stdout().flush().ok();
        io::stderr().flush().ok();
        match unsafe { fork() }.expect("failed to fork test parent") {
            ForkResult::Child => {
                let marker_for_cleanup = marker.clone();
                let mut section =
                    EnforcedCleanupSection::arm(move || append_marker(&marker_for_cleanup))
                        .unwrap();
                section.fork_watchdog().unwrap();
                // Die mid-section, before the sentinel is written.
                kill(nix::unistd::getpid(), Signal::SIGKILL).unwrap();
                unreachable!("SIGKILL did not kill the test parent");
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(
                    matches!(status, WaitStatus::Signaled(_, Signal::SIGKILL, _)),
                    "expected SIGKILL death, got {:?}",
                    status
                );

                // The watchdog is now an orphan; it acquires the dropped lock
                // and, finding no sentinel, runs the cleanup.
                wait_for_marker(&marker, Duration::from_secs(10));
                assert_eq!(marker_lines(&marker), 1);

                // No second run sneaks in afterwards.
                thread::sleep(Duration::from_millis(200));
                assert_eq!(marker_lines(&marker), 1);
            }
        }
    }

    #[test]
    #[should_panic(expected = "fork_watchdog called twice")]
    fn double_fork_watchdog_panics() {
        let mut section = EnforcedCleanupSection::arm(|| ()).unwrap();
        section.fork_watchdog().unwrap();
        let _ = section.fork_watchdog();
    }
}
