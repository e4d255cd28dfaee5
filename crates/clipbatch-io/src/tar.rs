// crates/clipbatch-io/src/tar.rs
//
// Hand-rolled forward-only GNU-tar reader. The `tar` crate on crates.io is
// deliberately not used here: it unpacks to the filesystem or exposes
// entries as `Read`-only views glued to its own internal cursor, and never
// hands back the raw `(content_start_pos, file_size)` pair this loader
// needs to open an independent sub-range view per worker thread (see
// `begin_read_content` and the multi-threaded tar-batch opener in
// `clipbatch-loader::tar_opener`). Parsing the 512-byte header block by hand
// is the only way to get that.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use clipbatch_core::ClipBatchError;

use crate::stream::ReadSeek;

const BLOCK_SIZE: usize = 512;
const GNU_MAGIC: &[u8; 8] = b"ustar  \0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

/// One archive member. `begin_read_content` is the only way to read its
/// bytes — see the module doc comment for why this isn't just a `Read` impl
/// sitting on the entry itself.
pub struct TarEntry {
    pub path: PathBuf,
    pub entry_type: EntryType,
    pub content_start_pos: u64,
    pub file_size: u64,
    shared: Arc<Mutex<Box<dyn ReadSeek>>>,
}

impl TarEntry {
    /// Seek the iterator's shared stream to this entry's content and return
    /// a guard that reads exactly `file_size` bytes from it.
    ///
    /// Only one entry's content may be read at a time this way — the guard
    /// holds the shared stream's lock for its lifetime. Callers that want to
    /// read several entries' content concurrently must open their own
    /// stream per reader (see `clipbatch-loader::tar_opener`'s multi-threaded
    /// form, which does exactly that).
    pub fn begin_read_content(&self) -> std::io::Result<TarContentGuard<'_>> {
        let mut guard = self.shared.lock().unwrap();
        guard.seek(SeekFrom::Start(self.content_start_pos))?;
        Ok(TarContentGuard {
            guard,
            remaining: self.file_size,
        })
    }
}

pub struct TarContentGuard<'a> {
    guard: MutexGuard<'a, Box<dyn ReadSeek>>,
    remaining: u64,
}

impl Read for TarContentGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.guard.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Forward-only iterator over a GNU-tar byte stream.
pub struct TarIterator {
    shared: Arc<Mutex<Box<dyn ReadSeek>>>,
    cursor: u64,
    finished: bool,
    #[cfg(unix)]
    raw_fd: Option<std::os::unix::io::RawFd>,
}

impl TarIterator {
    /// Open a tar file directly, hinting the OS for sequential access.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ClipBatchError> {
        let path = path.into();
        let file = std::fs::File::open(&path).map_err(|e| ClipBatchError::io(e, path))?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = file.as_raw_fd();
            hint_sequential(fd);
            Ok(Self::wrap(Box::new(file), Some(fd)))
        }
        #[cfg(not(unix))]
        {
            Ok(Self::wrap(Box::new(file), None))
        }
    }

    /// Wrap an already-open stream (e.g. shared with another subsystem).
    /// No OS hints are applied since ownership of the underlying fd, if
    /// any, isn't implied here.
    pub fn from_stream(stream: Box<dyn ReadSeek>) -> Self {
        Self::wrap(stream, None)
    }

    #[cfg(unix)]
    fn wrap(stream: Box<dyn ReadSeek>, raw_fd: Option<std::os::unix::io::RawFd>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(stream)),
            cursor: 0,
            finished: false,
            raw_fd,
        }
    }

    #[cfg(not(unix))]
    fn wrap(stream: Box<dyn ReadSeek>, _raw_fd: Option<()>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(stream)),
            cursor: 0,
            finished: false,
        }
    }

    /// Clone of the shared stream handle, for a multi-threaded opener that
    /// wants a *different* private stream per worker rather than this one —
    /// exposed so callers can reopen their own handle to the same path
    /// instead of contending on this iterator's single shared position.
    pub fn shared_handle(&self) -> Arc<Mutex<Box<dyn ReadSeek>>> {
        Arc::clone(&self.shared)
    }

    fn read_exact_at_cursor(&mut self, buf: &mut [u8]) -> Result<bool, ClipBatchError> {
        let mut guard = self.shared.lock().unwrap();
        guard
            .seek(SeekFrom::Start(self.cursor))
            .map_err(|e| ClipBatchError::format(format!("tar seek failed: {e}")))?;
        let mut read = 0;
        while read < buf.len() {
            let n = guard
                .read(&mut buf[read..])
                .map_err(|e| ClipBatchError::format(format!("tar read failed: {e}")))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        self.cursor += read as u64;
        Ok(read == buf.len())
    }

    fn next_entry(&mut self) -> Result<Option<TarEntry>, ClipBatchError> {
        let mut pending_long_name: Option<String> = None;

        loop {
            let mut header = [0u8; BLOCK_SIZE];
            let complete = self.read_exact_at_cursor(&mut header)?;
            if !complete {
                if pending_long_name.is_some() {
                    return Err(ClipBatchError::format("Unexpected EOF"));
                }
                return Err(ClipBatchError::format("Unexpected EOF"));
            }

            if header.iter().all(|&b| b == 0) {
                let mut second = [0u8; BLOCK_SIZE];
                let complete2 = self.read_exact_at_cursor(&mut second)?;
                if complete2 && second.iter().all(|&b| b == 0) {
                    self.finished = true;
                    return Ok(None);
                }
                return Err(ClipBatchError::format("Unexpected EOF"));
            }

            verify_magic(&header)?;
            verify_checksum(&header)?;

            let typeflag = header[156];
            let size = parse_size(&header[124..136])?;
            let content_start = self.cursor;
            let padded = pad_to_block(size);

            match typeflag {
                b'L' => {
                    // GNU long-pathname extension: its "content" IS the real
                    // path of the *next* header, not file data.
                    let mut name_buf = vec![0u8; size as usize];
                    if size > 0 {
                        let mut guard = self.shared.lock().unwrap();
                        guard
                            .seek(SeekFrom::Start(content_start))
                            .map_err(|e| ClipBatchError::format(format!("tar seek failed: {e}")))?;
                        guard
                            .read_exact(&mut name_buf)
                            .map_err(|_| ClipBatchError::format("Unexpected EOF"))?;
                    }
                    self.cursor = content_start + padded as u64;
                    let name = String::from_utf8_lossy(&name_buf)
                        .trim_end_matches('\0')
                        .to_string();
                    pending_long_name = Some(name);
                    continue;
                }
                b'0' | 0 => {
                    let name = pending_long_name
                        .take()
                        .unwrap_or_else(|| parse_short_name(&header));
                    self.cursor = content_start + padded as u64;
                    #[cfg(unix)]
                    if let Some(fd) = self.raw_fd {
                        hint_willneed(fd, content_start, size);
                    }
                    return Ok(Some(TarEntry {
                        path: PathBuf::from(name),
                        entry_type: EntryType::File,
                        content_start_pos: content_start,
                        file_size: size,
                        shared: Arc::clone(&self.shared),
                    }));
                }
                b'5' => {
                    let name = pending_long_name
                        .take()
                        .unwrap_or_else(|| parse_short_name(&header));
                    self.cursor = content_start + padded as u64;
                    return Ok(Some(TarEntry {
                        path: PathBuf::from(name),
                        entry_type: EntryType::Directory,
                        content_start_pos: content_start,
                        file_size: 0,
                        shared: Arc::clone(&self.shared),
                    }));
                }
                other => {
                    return Err(ClipBatchError::format(format!(
                        "unsupported tar entry type {:#04x}",
                        other
                    )));
                }
            }
        }
    }
}

impl Iterator for TarIterator {
    type Item = Result<TarEntry, ClipBatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn parse_short_name(header: &[u8; BLOCK_SIZE]) -> String {
    let raw = &header[0..100];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn pad_to_block(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;
    if rem == 0 {
        size
    } else {
        size + (BLOCK_SIZE as u64 - rem)
    }
}

fn verify_magic(header: &[u8; BLOCK_SIZE]) -> Result<(), ClipBatchError> {
    let magic = &header[257..265];
    if magic != GNU_MAGIC {
        return Err(ClipBatchError::format("Magic not match"));
    }
    Ok(())
}

fn verify_checksum(header: &[u8; BLOCK_SIZE]) -> Result<(), ClipBatchError> {
    let recorded_field = &header[148..156];
    let recorded = parse_octal_field(recorded_field)
        .ok_or_else(|| ClipBatchError::format("invalid tar checksum field"))?;

    let mut unsigned_sum: u64 = 0;
    let mut signed_sum: i64 = 0;
    for (i, &b) in header.iter().enumerate() {
        let byte = if (148..156).contains(&i) { b' ' } else { b };
        unsigned_sum += byte as u64;
        signed_sum += (byte as i8) as i64;
    }

    // Historical tar implementations summed header bytes as signed chars;
    // GNU/POSIX tar sums them unsigned. Accept either to stay compatible
    // with archives produced by older writers.
    if unsigned_sum == recorded || (signed_sum as u64 & 0xffff_ffff) == recorded {
        Ok(())
    } else {
        Err(ClipBatchError::format("tar header checksum mismatch"))
    }
}

fn parse_octal_field(field: &[u8]) -> Option<u64> {
    let end = field
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(field.len());
    let s = std::str::from_utf8(&field[..end]).ok()?.trim();
    if s.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(s, 8).ok()
}

/// Parses the 12-byte tar size field, supporting both plain octal ASCII and
/// GNU's base-256 binary form (high bit of the first byte set).
fn parse_size(field: &[u8]) -> Result<u64, ClipBatchError> {
    debug_assert_eq!(field.len(), 12);
    if field[0] & 0x80 != 0 {
        let mut value: u128 = (field[0] & 0x7f) as u128;
        for &b in &field[1..] {
            value = (value << 8) | b as u128;
        }
        if value >= (1u128 << 63) {
            return Err(ClipBatchError::format("size too large"));
        }
        Ok(value as u64)
    } else {
        parse_octal_field(field).ok_or_else(|| ClipBatchError::format("invalid tar size field"))
    }
}

#[cfg(unix)]
fn hint_sequential(fd: std::os::unix::io::RawFd) {
    // SAFETY: `fd` is a valid, open file descriptor owned by the caller for
    // the duration of this call; posix_fadvise never takes ownership of it.
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(unix)]
fn hint_willneed(fd: std::os::unix::io::RawFd, offset: u64, len: u64) {
    // Best-effort: a failure here changes nothing but readahead behavior.
    // SAFETY: same as `hint_sequential`.
    unsafe {
        libc::posix_fadvise(
            fd,
            offset as libc::off_t,
            len as libc::off_t,
            libc::POSIX_FADV_WILLNEED,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn octal_field(value: u64, width: usize) -> Vec<u8> {
        let s = format!("{:0>width$o}\0", value, width = width - 1);
        s.into_bytes()
    }

    fn build_header(name: &str, typeflag: u8, size: u64) -> Vec<u8> {
        let mut h = vec![0u8; BLOCK_SIZE];
        let name_bytes = name.as_bytes();
        h[0..name_bytes.len().min(100)].copy_from_slice(&name_bytes[..name_bytes.len().min(100)]);
        h[100..108].copy_from_slice(&octal_field(0o644, 8));
        h[108..116].copy_from_slice(&octal_field(0, 8));
        h[116..124].copy_from_slice(&octal_field(0, 8));
        let size_field = octal_field(size, 12);
        h[124..124 + size_field.len()].copy_from_slice(&size_field);
        h[136..148].copy_from_slice(&octal_field(0, 12));
        h[148..156].copy_from_slice(&[b' '; 8]); // blanked for checksum calc
        h[156] = typeflag;
        h[257..265].copy_from_slice(GNU_MAGIC);

        let mut sum: u64 = 0;
        for &b in &h {
            sum += b as u64;
        }
        let chk = format!("{:06o}\0 ", sum);
        h[148..156].copy_from_slice(chk.as_bytes());
        h
    }

    fn build_archive(entries: &[(&str, u8, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, typeflag, content) in entries {
            out.extend(build_header(name, *typeflag, content.len() as u64));
            out.extend_from_slice(content);
            let pad = pad_to_block(content.len() as u64) as usize - content.len();
            out.extend(std::iter::repeat(0u8).take(pad));
        }
        out.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2)); // terminator
        out
    }

    #[test]
    fn enumerates_files_and_directories() {
        let archive = build_archive(&[
            ("a.txt", b'0', b"hello"),
            ("dir/", b'5', b""),
            ("dir/b.txt", b'0', b""),
        ]);
        let it = TarIterator::from_stream(Box::new(std::io::Cursor::new(archive)));
        let entries: Vec<_> = it.map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("a.txt"));
        assert_eq!(entries[0].file_size, 5);
        assert_eq!(entries[1].entry_type, EntryType::Directory);
        assert_eq!(entries[2].file_size, 0);
    }

    #[test]
    fn begin_read_content_reads_exact_bytes() {
        let archive = build_archive(&[("a.txt", b'0', b"hello world")]);
        let it = TarIterator::from_stream(Box::new(std::io::Cursor::new(archive)));
        let entries: Vec<_> = it.map(|r| r.unwrap()).collect();
        let mut buf = Vec::new();
        entries[0].begin_read_content().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn long_pathname_recovered_verbatim() {
        let long_name = "a/".repeat(60) + "file.bin"; // > 100 bytes
        let mut archive = Vec::new();
        let mut long_header = build_header("", b'L', long_name.len() as u64);
        long_header[0..11].copy_from_slice(b"././@LongLi"); // GNU convention, cosmetic only
        archive.extend(long_header);
        archive.extend(long_name.as_bytes());
        let pad = pad_to_block(long_name.len() as u64) as usize - long_name.len();
        archive.extend(std::iter::repeat(0u8).take(pad));
        archive.extend(build_header("", b'0', 0)); // name field ignored, long name wins
        archive.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));

        let it = TarIterator::from_stream(Box::new(std::io::Cursor::new(archive)));
        let entries: Vec<_> = it.map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from(&long_name));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut archive = build_header("a", b'0', 0);
        archive[257..265].copy_from_slice(b"ustar\x0000"); // POSIX/PAX-style magic, not GNU
        archive.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));
        let it = TarIterator::from_stream(Box::new(std::io::Cursor::new(archive)));
        let err = it.map(|r| r).next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "tar format error: Magic not match");
    }

    #[test]
    fn truncated_archive_is_unexpected_eof() {
        let mut archive = build_header("a", b'0', 100);
        archive.truncate(BLOCK_SIZE - 10); // chop the header itself short
        let it = TarIterator::from_stream(Box::new(std::io::Cursor::new(archive)));
        let err = it.map(|r| r).next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "tar format error: Unexpected EOF");
    }

    #[test]
    fn base256_size_roundtrips() {
        let mut h = build_header("big.bin", b'0', 5); // placeholder checksum base
        let mut field = [0u8; 12];
        field[0] = 0x80;
        let value: u64 = 1 << 40;
        let bytes = value.to_be_bytes();
        field[12 - 8..].copy_from_slice(&bytes);
        h[124..136].copy_from_slice(&field);
        // recompute checksum after overwriting the size field
        for b in h[148..156].iter_mut() {
            *b = b' ';
        }
        let sum: u64 = h.iter().map(|&b| b as u64).sum();
        let chk = format!("{:06o}\0 ", sum);
        h[148..156].copy_from_slice(chk.as_bytes());

        let mut archive = h;
        archive.extend(std::iter::repeat(0u8).take(pad_to_block(value) as usize)); // not materialized fully; size just needs parsing
        let size = parse_size(&archive[124..136]).unwrap();
        assert_eq!(size, value);
    }

    #[test]
    fn size_at_or_above_2_63_is_rejected() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        let value: u128 = 1u128 << 63;
        let bytes = value.to_be_bytes();
        field.copy_from_slice(&bytes[16 - 12..]);
        let err = parse_size(&field).unwrap_err();
        assert_eq!(err.to_string(), "tar format error: size too large");
    }
}
