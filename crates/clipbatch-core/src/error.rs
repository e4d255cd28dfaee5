// crates/clipbatch-core/src/error.rs
//
// Typed error taxonomy shared by every layer of the loader. Each variant
// carries enough context for a host-language binding to map it back to its
// nearest native exception without re-deriving the cause from a string.

use std::io;

/// A single error kind covering every failure mode the loader can surface.
///
/// Fatal errors inside one task never poison another: a `ClipBatchError`
/// produced while decoding video A is scoped to A's batch slot and does not
/// tear down the worker pool (see `clipbatch-loader::worker`).
#[derive(thiserror::Error, Debug)]
pub enum ClipBatchError {
    /// An underlying media-library call failed. `code` is the library's own
    /// status code (commonly negative `AVERROR_*`); `site` is `file:line` of
    /// the call that failed, filled in with `#[track_caller]`-style manual
    /// context since the error can cross an FFI boundary where caller
    /// location isn't automatically available.
    #[error("media error at {site}: {message} (code {code})")]
    Media {
        code: i32,
        message: String,
        site: &'static str,
    },

    /// An OS-level I/O failure from the sleepable stream layer. Distinct from
    /// `Media` because `ENOENT`/`EISDIR` need to reach the binding layer as
    /// themselves, not as an opaque decoder failure.
    #[error("io error: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: std::path::PathBuf,
    },

    /// Caller misuse: double start, double stop, asking for a batch after
    /// exhaustion, calling the unimplemented scaled-batch path, or
    /// dereferencing a finished tar iterator.
    #[error("logic error: {0}")]
    Logic(String),

    /// A requested frame index was `>= num_frames`.
    #[error("frame index {index} out of range (video has {num_frames} frames)")]
    OutOfRange { index: usize, num_frames: usize },

    /// The tar byte stream violates the documented GNU-tar subset: bad magic,
    /// checksum mismatch, truncated entry, unsupported extension type, or a
    /// size field too large to represent.
    #[error("tar format error: {0}")]
    Format(String),
}

impl ClipBatchError {
    pub fn media(code: i32, message: impl Into<String>, site: &'static str) -> Self {
        tracing::error!(code, site, "media error");
        ClipBatchError::Media {
            code,
            message: message.into(),
            site,
        }
    }

    pub fn io(source: io::Error, path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        tracing::error!(error = %source, path = %path.display(), "io error");
        ClipBatchError::Io { source, path }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "logic error");
        ClipBatchError::Logic(msg)
    }

    pub fn out_of_range(index: usize, num_frames: usize) -> Self {
        ClipBatchError::OutOfRange { index, num_frames }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "tar format error");
        ClipBatchError::Format(msg)
    }

    /// `true` for IO errors the binding layer should map to "file not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClipBatchError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// `true` for IO errors the binding layer should map to "is a directory".
    pub fn is_directory(&self) -> bool {
        match self {
            ClipBatchError::Io { source, .. } => source.raw_os_error() == Some(libc_eisdir()),
            _ => false,
        }
    }
}

/// `EISDIR`'s numeric value, without pulling in `libc` just for one constant.
/// Stable across Linux/macOS/*BSD (21); kept as a `const fn` so it's trivial
/// to special-case a target where it differs.
const fn libc_eisdir() -> i32 {
    21
}

pub type Result<T> = std::result::Result<T, ClipBatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_formats_with_both_numbers() {
        let e = ClipBatchError::out_of_range(10, 4);
        assert_eq!(
            e.to_string(),
            "frame index 10 out of range (video has 4 frames)"
        );
    }

    #[test]
    fn io_not_found_detection() {
        let e = ClipBatchError::io(
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
            "/no/such/file",
        );
        assert!(e.is_not_found());
        assert!(!e.is_directory());
    }
}
