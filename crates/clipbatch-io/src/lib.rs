// crates/clipbatch-io/src/lib.rs
//
// Byte-level I/O primitives: the sleep/wake stream adapter bounding file
// descriptor usage across many open videos, and the hand-rolled GNU-tar
// iterator for opening videos packed inside a tar batch. Nothing in this
// crate knows what a video frame is.

pub mod sleepable;
pub mod stream;
pub mod tar;

pub use sleepable::{SleepableIo, Whence};
pub use stream::ReadSeek;
pub use tar::{EntryType, TarContentGuard, TarEntry, TarIterator};
