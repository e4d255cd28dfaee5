// crates/clipbatch-io/src/sleepable.rs
//
// A stream abstraction with an explicit open/close lifecycle, so that
// thousands of videos can sit "asleep" — no file descriptor, no OS buffer —
// between uses. This is what makes it feasible for the loader to hold tens
// of thousands of Video handles live at once: each one costs a path string
// and a handful of bookkeeping integers while asleep.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use clipbatch_core::ClipBatchError;

use crate::stream::ReadSeek;

/// Distinguishes the three `seek` reference points plus a size query that
/// never actually moves the stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    /// Not a real seek — returns `file_size` without touching `last_pos`.
    Size,
}

enum Handle {
    Asleep,
    Awake(File),
    /// Transient binding to a stream the caller owns (used while opening a
    /// video straight out of a tar archive's shared stream). `sleep()`
    /// always clears this — waking from it can only reopen `path` itself,
    /// never resurrect the borrowed stream.
    External(Box<dyn ReadSeek>),
}

/// Range-bounded, sleep/wake-able view over a host file or a tar sub-region.
///
/// Reads never return a byte outside `[start_pos, start_pos + file_size)`
/// regardless of the underlying handle's actual extent.
pub struct SleepableIo {
    path: PathBuf,
    start_pos: u64,
    file_size: u64,
    /// Offset within `[0, file_size]`, valid whether awake or asleep.
    last_pos: u64,
    handle: Handle,
}

impl SleepableIo {
    /// Open `path` awake, bounded to `[start_pos, start_pos + file_size)`.
    /// `file_size = None` means "rest of the file from `start_pos`."
    pub fn open(path: impl Into<PathBuf>, start_pos: u64, file_size: Option<u64>) -> Result<Self, ClipBatchError> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|e| ClipBatchError::io(e, path.clone()))?;
        let metadata = file
            .metadata()
            .map_err(|e| ClipBatchError::io(e, path.clone()))?;
        // `File::open`/`metadata`/`seek` all succeed on a directory on Linux —
        // only the first `read()` fails with EISDIR, and by then that read is
        // happening deep inside the demuxer's probe, which can't tell an
        // I/O-layer failure from a genuinely malformed container. Check here
        // so a directory path surfaces as `ClipBatchError::Io` with EISDIR
        // instead of an opaque media error (SPEC_FULL.md §8 scenario 1).
        if metadata.is_dir() {
            return Err(ClipBatchError::io(
                io::Error::from_raw_os_error(21),
                path,
            ));
        }
        let total_len = metadata.len();
        let file_size = file_size.unwrap_or(total_len.saturating_sub(start_pos));
        file.seek(SeekFrom::Start(start_pos))
            .map_err(|e| ClipBatchError::io(e, path.clone()))?;
        Ok(Self {
            path,
            start_pos,
            file_size,
            last_pos: 0,
            handle: Handle::Awake(file),
        })
    }

    /// Construct asleep — the path is recorded but nothing is opened until
    /// the first `wake()`. Useful for the tar-batch opener, which indexes
    /// entries before deciding which ones to materialize.
    pub fn new_asleep(path: impl Into<PathBuf>, start_pos: u64, file_size: u64) -> Self {
        Self {
            path: path.into(),
            start_pos,
            file_size,
            last_pos: 0,
            handle: Handle::Asleep,
        }
    }

    /// Bind to a caller-provided stream instead of opening `path` directly.
    /// Valid only until the first `sleep()` (or the first `get_batch`,
    /// which sleeps afterward) — see SPEC_FULL.md §9.
    pub fn from_external(
        path: impl Into<PathBuf>,
        start_pos: u64,
        file_size: u64,
        external: Box<dyn ReadSeek>,
    ) -> Self {
        Self {
            path: path.into(),
            start_pos,
            file_size,
            last_pos: 0,
            handle: Handle::External(external),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self.handle, Handle::Asleep)
    }

    /// Close the handle and remember the in-range offset. Idempotent:
    /// calling `sleep()` while already asleep is a no-op. Always clears an
    /// externally-bound stream first.
    pub fn sleep(&mut self) {
        let was_asleep = matches!(self.handle, Handle::Asleep);
        // Drops whatever File/external stream was held, releasing the fd.
        self.handle = Handle::Asleep;
        if !was_asleep {
            tracing::debug!(path = %self.path.display(), last_pos = self.last_pos, "sleep");
        }
    }

    /// Reopen the handle and restore position. Idempotent: calling `wake()`
    /// while already awake is a no-op.
    pub fn wake(&mut self) -> Result<(), ClipBatchError> {
        if !matches!(self.handle, Handle::Asleep) {
            return Ok(());
        }
        let mut file = File::open(&self.path).map_err(|e| ClipBatchError::io(e, self.path.clone()))?;
        file.seek(SeekFrom::Start(self.start_pos + self.last_pos))
            .map_err(|e| ClipBatchError::io(e, self.path.clone()))?;
        tracing::debug!(path = %self.path.display(), last_pos = self.last_pos, "wake");
        self.handle = Handle::Awake(file);
        Ok(())
    }

    /// Seek within the bounded range. `Whence::Size` is a query: it returns
    /// `file_size` without moving the position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> io::Result<u64> {
        if whence == Whence::Size {
            return Ok(self.file_size);
        }
        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => self.last_pos as i64,
            Whence::End => self.file_size as i64,
            Whence::Size => unreachable!(),
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek overflow"))?;
        let clipped = target.clamp(0, self.file_size as i64) as u64;
        self.last_pos = clipped;
        match &mut self.handle {
            Handle::Awake(file) => {
                file.seek(SeekFrom::Start(self.start_pos + self.last_pos))?;
            }
            Handle::External(stream) => {
                stream.seek(SeekFrom::Start(self.start_pos + self.last_pos))?;
            }
            Handle::Asleep => {}
        }
        Ok(self.last_pos)
    }

    /// Read into `buf`, clipped so no byte outside the bounded range is ever
    /// returned. Returns `Ok(0)` at range end (the documented EOF marker).
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.file_size.saturating_sub(self.last_pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = match &mut self.handle {
            Handle::Awake(file) => file.read(&mut buf[..want])?,
            Handle::External(stream) => stream.read(&mut buf[..want])?,
            Handle::Asleep => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "read on a sleeping SleepableIo — call wake() first",
                ))
            }
        };
        self.last_pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_are_clipped_to_sub_range() {
        let (_dir, path) = fixture(b"0123456789");
        let mut io = SleepableIo::open(&path, 2, Some(4)).unwrap(); // "2345"
        let mut buf = [0u8; 16];
        let n = io.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"2345");
        assert_eq!(io.read(&mut buf).unwrap(), 0); // EOF marker
    }

    #[test]
    fn sleep_wake_preserves_position() {
        let (_dir, path) = fixture(b"abcdefghij");
        let mut io = SleepableIo::open(&path, 0, None).unwrap();
        let mut buf = [0u8; 3];
        io.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(!io.is_sleeping());
        io.sleep();
        assert!(io.is_sleeping());
        io.sleep(); // idempotent
        assert!(io.is_sleeping());
        io.wake().unwrap();
        io.wake().unwrap(); // idempotent
        let mut buf2 = [0u8; 3];
        io.read(&mut buf2).unwrap();
        assert_eq!(&buf2, b"def");
    }

    #[test]
    fn size_query_whence_does_not_move_position() {
        let (_dir, path) = fixture(b"0123456789");
        let mut io = SleepableIo::open(&path, 0, Some(7)).unwrap();
        io.seek(3, Whence::Start).unwrap();
        assert_eq!(io.seek(0, Whence::Size).unwrap(), 7);
        let mut buf = [0u8; 1];
        io.read(&mut buf).unwrap();
        assert_eq!(&buf, b"3"); // unaffected by the size query
    }

    #[test]
    fn seek_clamps_within_range() {
        let (_dir, path) = fixture(b"0123456789");
        let mut io = SleepableIo::open(&path, 2, Some(4)).unwrap();
        let pos = io.seek(1000, Whence::Start).unwrap();
        assert_eq!(pos, 4); // clamped to file_size
        let pos = io.seek(-1000, Whence::Current).unwrap();
        assert_eq!(pos, 0);
    }
}
