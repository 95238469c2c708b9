/// Process-safe multi-producer/multi-consumer FIFO for handing work items to
/// forked background workers.
///
/// Built from the primitives the OS already gives us: an anonymous pipe
/// carrying length-prefixed JSON frames, plus one advisory lock per side so
/// concurrent puts and gets are never torn. EOF on the pipe is the closing
/// signal; there is no in-band sentinel frame.
use std::fs::File;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

use crate::lock::{LockError, ProcessLock};

/// Errors raised by [`WorkQueue`] and [`QueueConsumer`].
#[derive(Debug)]
pub enum QueueError {
    /// Failed to create the pipe or the lock files.
    Create { source: io::Error },
    /// Reading from or writing to the pipe failed.
    Pipe { source: io::Error },
    /// Serializing an item failed.
    Encode { source: serde_json::Error },
    /// Deserializing an item failed.
    Decode { source: serde_json::Error },
    /// The pipe closed in the middle of a frame.
    Truncated,
    /// A side lock could not be taken or released.
    Lock { source: LockError },
    /// `put` was called after `close`.
    Closed,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Create { source } => write!(f, "failed to create work queue: {}", source),
            QueueError::Pipe { source } => write!(f, "work queue pipe I/O failed: {}", source),
            QueueError::Encode { source } => write!(f, "failed to encode work item: {}", source),
            QueueError::Decode { source } => write!(f, "failed to decode work item: {}", source),
            QueueError::Truncated => write!(f, "work queue closed mid-frame"),
            QueueError::Lock { source } => write!(f, "work queue lock failed: {}", source),
            QueueError::Closed => write!(f, "work queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Create { source } => Some(source),
            QueueError::Pipe { source } => Some(source),
            QueueError::Encode { source } => Some(source),
            QueueError::Decode { source } => Some(source),
            QueueError::Lock { source } => Some(source),
            QueueError::Truncated | QueueError::Closed => None,
        }
    }
}

/// The producer half plus the factory for consumer handles.
#[derive(Debug)]
pub struct WorkQueue<T> {
    write: Option<File>,
    read: File,
    put_lock: ProcessLock,
    get_lock_path: PathBuf,
    // Owns the lock files for the queue's lifetime.
    _lock_dir: TempDir,
    _marker: PhantomData<fn(T)>,
}

impl<T> WorkQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Result<Self, QueueError> {
        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| QueueError::Create {
                source: io::Error::from(e),
            })?;
        let lock_dir = TempDir::new().map_err(|e| QueueError::Create { source: e })?;
        let put_lock_path = lock_dir.path().join("put.lock");
        let get_lock_path = lock_dir.path().join("get.lock");
        let put_lock =
            ProcessLock::open(&put_lock_path).map_err(|e| QueueError::Lock { source: e })?;
        // Create the get-side lock file eagerly so consumers in other
        // processes never race its creation.
        ProcessLock::open(&get_lock_path).map_err(|e| QueueError::Lock { source: e })?;

        Ok(Self {
            write: Some(File::from(write_fd)),
            read: File::from(read_fd),
            put_lock,
            get_lock_path,
            _lock_dir: lock_dir,
            _marker: PhantomData,
        })
    }

    /// Enqueue one item.
    pub fn put(&self, item: &T) -> Result<(), QueueError>
    where
        T: Serialize,
    {
        let file = self.write.as_ref().ok_or(QueueError::Closed)?;
        let payload = serde_json::to_vec(item).map_err(|e| QueueError::Encode { source: e })?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.put_lock.lock().map_err(|e| QueueError::Lock { source: e })?;
        let written = (&*file).write_all(&frame);
        let released = self.put_lock.unlock();
        written.map_err(|e| QueueError::Pipe { source: e })?;
        released.map_err(|e| QueueError::Lock { source: e })?;
        Ok(())
    }

    /// Drop the write end. Consumers see EOF once the buffered frames are
    /// drained and every forked worker has closed its inherited copy.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.write.take().is_some() {
            debug!("work queue closed");
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.write.is_none()
    }

    /// A consumer handle on this queue.
    ///
    /// The handle shares the pipe's read end (a `dup`, so all consumers drain
    /// one FIFO) but opens its own descriptor on the get-side lock, which is
    /// what makes the lock contend across a later `fork`.
    pub fn consumer(&self) -> Result<QueueConsumer<T>, QueueError> {
        Ok(QueueConsumer {
            read: self
                .read
                .try_clone()
                .map_err(|e| QueueError::Create { source: e })?,
            lock_path: self.get_lock_path.clone(),
            lock: None,
            inherited_write: self.write.as_ref().map(|f| f.as_raw_fd()),
            _marker: PhantomData,
        })
    }
}

/// One consumer's handle on a [`WorkQueue`].
#[derive(Debug)]
pub struct QueueConsumer<T> {
    read: File,
    lock_path: PathBuf,
    lock: Option<ProcessLock>,
    inherited_write: Option<RawFd>,
    _marker: PhantomData<fn(T)>,
}

impl<T> QueueConsumer<T> {
    /// Prepare the handle inside a forked worker.
    ///
    /// Closes the worker's inherited copy of the queue's write end; without
    /// this, EOF never propagates after the parent closes the queue. Must not
    /// be called in the producer's own process.
    pub fn worker_init(&mut self) {
        if let Some(fd) = self.inherited_write.take() {
            nix::unistd::close(fd).ok();
        }
    }

    fn ensure_lock(&mut self) -> Result<(), QueueError> {
        if self.lock.is_none() {
            // Opened on first use so a handle created before a fork still
            // gets a descriptor (and thus a contending lock) of its own.
            self.lock = Some(
                ProcessLock::open(&self.lock_path).map_err(|e| QueueError::Lock { source: e })?,
            );
        }
        Ok(())
    }

    /// Dequeue one item, blocking while the queue is empty but open.
    /// Returns `Ok(None)` once the queue is closed and drained.
    pub fn get(&mut self) -> Result<Option<T>, QueueError>
    where
        T: DeserializeOwned,
    {
        self.ensure_lock()?;
        let lock = match self.lock.as_ref() {
            Some(lock) => lock,
            // ensure_lock just populated it.
            None => unreachable!("consumer lock missing after ensure_lock"),
        };
        lock.lock().map_err(|e| QueueError::Lock { source: e })?;
        let item = read_frame(&self.read);
        let released = lock.unlock();
        let item = item?;
        released.map_err(|e| QueueError::Lock { source: e })?;

        match item {
            None => Ok(None),
            Some(payload) => {
                let item = serde_json::from_slice(&payload)
                    .map_err(|e| QueueError::Decode { source: e })?;
                Ok(Some(item))
            }
        }
    }
}

/// Read one length-prefixed frame; `Ok(None)` on clean EOF at a frame
/// boundary.
fn read_frame(mut reader: &File) -> Result<Option<Vec<u8>>, QueueError> {
    let mut header = [0u8; 4];
    let mut got = 0;
    while got < header.len() {
        let n = reader
            .read(&mut header[got..])
            .map_err(|e| QueueError::Pipe { source: e })?;
        if n == 0 {
            return if got == 0 {
                Ok(None)
            } else {
                Err(QueueError::Truncated)
            };
        }
        got += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            QueueError::Truncated
        } else {
            QueueError::Pipe { source: e }
        }
    })?;
    Ok(Some(payload))
}
