/// Per-worker capture of stdout/stderr into a private temp-file sink.
///
/// The worker side of the pair is a forked child whose descriptors 1 and 2
/// are `dup2`ed onto the sink. The supervisor side polls the sink with
/// positional reads and forwards anything past the last-echoed offset to the
/// real output stream. Positional reads matter: parent and child share the
/// open file description after the fork, so an ordinary `seek`+`read` in the
/// supervisor would move the worker's write position underneath it.
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt as _;
use std::path::Path;

use nix::libc::{STDERR_FILENO, STDOUT_FILENO};
use nix::unistd::dup2;
use tempfile::NamedTempFile;

/// A worker's private output sink plus the supervisor's drain cursor.
#[derive(Debug)]
pub struct OutputCapture {
    sink: NamedTempFile,
    echoed: u64,
}

impl OutputCapture {
    /// Create a fresh, empty sink.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sink: NamedTempFile::new()?,
            echoed: 0,
        })
    }

    /// Path of the sink file, for diagnostics.
    pub fn path(&self) -> &Path {
        self.sink.path()
    }

    /// Bytes forwarded to the output stream so far.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// Point the calling process's stdout and stderr at the sink.
    ///
    /// Call this in the forked worker, before running any work. Everything the
    /// worker writes from here on, including a nested supervisor's merged
    /// stream, lands in the sink.
    pub fn redirect_child(&self) -> io::Result<()> {
        let fd = self.sink.as_file().as_raw_fd();
        dup2(fd, STDOUT_FILENO).map_err(io::Error::from)?;
        dup2(fd, STDERR_FILENO).map_err(io::Error::from)?;
        Ok(())
    }

    /// An independent write handle on the sink, positioned at the start.
    ///
    /// The supervisor never writes through this; it exists so in-process
    /// callers (tests, mostly) can play the worker role.
    pub fn writer(&self) -> io::Result<File> {
        self.sink.reopen()
    }

    /// Forward newly written sink bytes to `out`, advancing the cursor.
    ///
    /// Echoes exactly the range between the last-echoed offset and the sink's
    /// current length. A sink that is now shorter than the cursor has been
    /// rewritten by the worker; current content is then authoritative and the
    /// cursor restarts from zero, so stale bytes are never echoed twice and a
    /// rewrite is never mistaken for an error. Returns the byte count echoed.
    pub fn drain_into<W: Write + ?Sized>(&mut self, out: &mut W) -> io::Result<usize> {
        let len = self.sink.as_file().metadata()?.len();
        if len < self.echoed {
            self.echoed = 0;
        }
        if len == self.echoed {
            return Ok(0);
        }

        let mut buf = vec![0u8; (len - self.echoed) as usize];
        let n = self.sink.as_file().read_at(&mut buf, self.echoed)?;
        buf.truncate(n);
        out.write_all(&buf)?;
        self.echoed += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn drains_only_new_bytes() {
        let mut capture = OutputCapture::new().unwrap();
        let mut writer = capture.writer().unwrap();
        let mut merged = Vec::new();

        writer.write_all(b"one").unwrap();
        assert_eq!(capture.drain_into(&mut merged).unwrap(), 3);

        writer.write_all(b"two").unwrap();
        assert_eq!(capture.drain_into(&mut merged).unwrap(), 3);

        assert_eq!(merged, b"onetwo");
        assert_eq!(capture.echoed(), 6);
    }

    #[test]
    fn empty_sink_drains_nothing() {
        let mut capture = OutputCapture::new().unwrap();
        let mut merged = Vec::new();
        assert_eq!(capture.drain_into(&mut merged).unwrap(), 0);
        assert!(merged.is_empty());
    }

    #[test]
    fn rewind_and_overwrite_is_not_echoed_twice() {
        // The double-echo scenario: worker writes "hello", it gets drained,
        // then the worker rewinds to the start and writes "hello world".
        let mut capture = OutputCapture::new().unwrap();
        let mut writer = capture.writer().unwrap();
        let mut merged = Vec::new();

        writer.write_all(b"hello").unwrap();
        capture.drain_into(&mut merged).unwrap();
        assert_eq!(merged, b"hello");

        writer.seek(SeekFrom::Start(0)).unwrap();
        writer.write_all(b"hello world").unwrap();
        capture.drain_into(&mut merged).unwrap();

        assert_eq!(merged, b"hello world");
    }

    #[test]
    fn truncated_sink_restarts_from_zero() {
        let mut capture = OutputCapture::new().unwrap();
        let mut writer = capture.writer().unwrap();
        let mut merged = Vec::new();

        writer.write_all(b"a long first payload").unwrap();
        capture.drain_into(&mut merged).unwrap();

        // Worker truncates and rewrites something shorter than what was
        // already echoed; current content becomes authoritative.
        writer.set_len(0).unwrap();
        writer.seek(SeekFrom::Start(0)).unwrap();
        writer.write_all(b"short").unwrap();
        capture.drain_into(&mut merged).unwrap();

        assert_eq!(merged, b"a long first payloadshort");
        assert_eq!(capture.echoed(), 5);
    }

    #[test]
    fn drain_after_quiet_period_is_noop() {
        let mut capture = OutputCapture::new().unwrap();
        let mut writer = capture.writer().unwrap();
        let mut merged = Vec::new();

        writer.write_all(b"done").unwrap();
        capture.drain_into(&mut merged).unwrap();
        assert_eq!(capture.drain_into(&mut merged).unwrap(), 0);
        assert_eq!(capture.drain_into(&mut merged).unwrap(), 0);
        assert_eq!(merged, b"done");
    }
}
