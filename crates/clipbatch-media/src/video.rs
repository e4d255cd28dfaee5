// crates/clipbatch-media/src/video.rs
//
// Public entry point: a `Video` owns a demuxer and its packet index, and
// exposes the sleep/wake lifecycle plus `get_batch` to the loader. One
// `Video` is never driven from two threads concurrently — the loader's
// schedule guarantees that, per SPEC_FULL.md §5.

use std::path::{Path, PathBuf};

use clipbatch_core::{BufferPool, ClipBatchError, TensorBuffer};
use clipbatch_io::SleepableIo;

use crate::decode;
use crate::demux::Demuxer;
use crate::index::{FrameRequest, PacketIndex};

pub struct Video {
    demux: Demuxer,
    index: PacketIndex,
    path: PathBuf,
}

impl Video {
    /// Opens `path`, indexing every packet on its best video stream
    /// immediately so `num_frames`/`get_batch` never need to re-scan.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClipBatchError> {
        let path = path.as_ref().to_path_buf();
        let io = SleepableIo::open(&path, 0, None)?;
        Self::open_io(path, io)
    }

    /// Opens over an already-constructed `SleepableIo` — the path used by
    /// the tar-batch opener (component I), which hands in a sub-range view
    /// bound to the archive's shared or per-worker stream.
    pub fn open_io(path: PathBuf, io: SleepableIo) -> Result<Self, ClipBatchError> {
        let mut demux = Demuxer::open(io)?;
        let raw_packets = demux.scan_all_packets()?;
        let index = PacketIndex::build(&raw_packets)?;
        Ok(Self { demux, index, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_frames(&self) -> usize {
        self.index.num_frames()
    }

    pub fn average_frame_rate(&self) -> (i32, i32) {
        self.demux.average_frame_rate()
    }

    pub fn is_sleeping(&self) -> bool {
        self.demux.is_sleeping()
    }

    pub fn sleep(&mut self) {
        self.demux.sleep();
    }

    pub fn wake(&mut self) -> Result<(), ClipBatchError> {
        self.demux.wake()
    }

    /// Decodes exactly `indices.len()` frames, one RGB24 frame per entry of
    /// `indices` (positions into this video's sorted-pts frame ordering,
    /// duplicates allowed), and packs them into a `[indices.len(), W, H, 3]`
    /// tensor in the same order as `indices`.
    pub fn get_batch(&mut self, indices: &[usize], pool: &BufferPool) -> Result<TensorBuffer, ClipBatchError> {
        let span = tracing::info_span!(
            "video.get_batch",
            path = %self.path.display(),
            num_frames = self.index.num_frames(),
            requested = indices.len(),
        );
        let _enter = span.enter();

        self.wake()?;

        let requests: Vec<FrameRequest> = indices
            .iter()
            .enumerate()
            .map(|(output_slot, &frame_index)| FrameRequest { output_slot, frame_index })
            .collect();

        for &frame_index in indices {
            if frame_index >= self.index.num_frames() {
                return Err(ClipBatchError::out_of_range(frame_index, self.index.num_frames()));
            }
        }

        let entries = crate::index::schedule(&self.index, &requests)?;
        decode::get_batch(&mut self.demux, &entries, indices.len(), pool)
    }
}
