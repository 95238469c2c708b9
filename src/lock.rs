/// Cooperating-process mutex backed by an advisory file lock.
///
/// The lock file doubles as a one-byte mailbox: `write_byte`/`read_byte` move
/// a single handshake byte through the descriptor with positional raw I/O
/// (`pwrite`/`pread`), so the exchange works even when one side has been
/// killed and buffered streams are unusable.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use std::os::unix::fs::FileExt as _;

/// Errors raised by [`ProcessLock`] operations.
#[derive(Debug)]
pub enum LockError {
    /// Failed to open or create the lock file.
    Open {
        path: PathBuf,
        source: io::Error,
    },
    /// Failed to acquire the exclusive lock.
    Acquire { source: io::Error },
    /// Failed to release the lock.
    Release { source: io::Error },
    /// Raw read/write of the handshake byte failed.
    Handshake { source: io::Error },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::Acquire { source } => {
                write!(f, "failed to acquire exclusive lock: {}", source)
            }
            LockError::Release { source } => {
                write!(f, "failed to release lock: {}", source)
            }
            LockError::Handshake { source } => {
                write!(f, "lock handshake I/O failed: {}", source)
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Acquire { source } => Some(source),
            LockError::Release { source } => Some(source),
            LockError::Handshake { source } => Some(source),
        }
    }
}

/// A file-backed advisory lock shared between cooperating processes.
///
/// Contention semantics follow `flock(2)`: locks belong to the open file
/// description, so a process that wants to contend with its parent after a
/// `fork` must open its own descriptor on the same path rather than reuse an
/// inherited one. The kernel drops the lock when the holder's descriptors
/// close, including on SIGKILL.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: File,
}

impl ProcessLock {
    /// Open (creating if missing) the lock file at `path`. No lock is taken.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LockError::Open {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    /// Path of the lock file, for handing to another process.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the exclusive lock is acquired.
    pub fn lock(&self) -> Result<(), LockError> {
        self.file
            .lock_exclusive()
            .map_err(|e| LockError::Acquire { source: e })
    }

    /// Attempt the exclusive lock without blocking.
    /// Returns `Ok(false)` when another descriptor holds it.
    pub fn try_lock(&self) -> Result<bool, LockError> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(LockError::Acquire { source: e }),
        }
    }

    /// Release the lock.
    pub fn unlock(&self) -> Result<(), LockError> {
        fs2::FileExt::unlock(&self.file).map_err(|e| LockError::Release { source: e })
    }

    /// Write the handshake byte at the start of the lock file.
    ///
    /// Uses `pwrite` directly on the descriptor; never touches buffered I/O,
    /// so a watchdog can trust the byte even if the writer dies right after.
    pub fn write_byte(&self, byte: u8) -> Result<(), LockError> {
        self.file
            .write_at(&[byte], 0)
            .map_err(|e| LockError::Handshake { source: e })?;
        self.file
            .sync_data()
            .map_err(|e| LockError::Handshake { source: e })
    }

    /// Read the handshake byte, if any has been written.
    pub fn read_byte(&self) -> Result<Option<u8>, LockError> {
        let mut buf = [0u8; 1];
        let n = self
            .file
            .read_at(&mut buf, 0)
            .map_err(|e| LockError::Handshake { source: e })?;
        Ok(if n == 0 { None } else { Some(buf[0]) })
    }
}
