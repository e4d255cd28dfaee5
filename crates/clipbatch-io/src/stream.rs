// crates/clipbatch-io/src/stream.rs
//
// Shared trait object alias used by both the sleepable adapter and the tar
// iterator for "whatever readable, seekable thing backs this stream" —
// a plain `File`, or (during tar opening) a handle shared with the archive
// iterator.

use std::io::{Read, Seek};

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}
