// crates/clipbatch-media/src/lib.rs
//
// ffmpeg-backed demux/decode: opens a container over a sleepable byte-range
// stream, indexes its packets, and decodes exactly the requested frames into
// RGB24 tensors. Thread/pool orchestration lives in `clipbatch-loader`.

mod avio;
mod decode;
mod demux;
mod index;
mod video;

pub use index::{FrameRequest, IndexedPacket, PacketIndex, ScheduleEntry};
pub use video::Video;