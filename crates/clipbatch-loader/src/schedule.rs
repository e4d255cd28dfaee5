// crates/clipbatch-loader/src/schedule.rs
//
// The data model a caller hands to `DatasetLoader`: an ordered list of
// batches, each an ordered list of per-video requests. Order is the only
// contract here — `DatasetLoader` flattens this into load tasks and output
// slots once, at construction, and never reorders it.

use std::sync::{Arc, Mutex};

use clipbatch_media::Video;

/// A crop rectangle in source pixels, applied before any scale.
///
/// Neither `CropSpec` nor `ScaleSpec` is wired into the decode pipeline yet —
/// `DatasetLoader::get_next_scaled_batch` is the documented non-goal this
/// would feed. They're part of the schedule's shape today so callers can
/// build a `Schedule` once against the eventual surface.
#[derive(Debug, Clone, Copy)]
pub struct CropSpec {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleSpec {
    pub w: u32,
    pub h: u32,
}

/// One video's contribution to a batch: which frames, and from where.
///
/// `video` is `Arc<Mutex<Video>>` rather than a bare `Video` — a video can
/// appear in more than one batch (e.g. two disjoint frame ranges from the
/// same clip scheduled separately), and the mutex is the loader's guarantee
/// that two worker threads never drive the same `Video` at once, matching
/// the single-driver precondition in `clipbatch-media`.
pub struct BatchVideo {
    pub video: Arc<Mutex<Video>>,
    pub frame_indices: Vec<usize>,
    pub crop: Option<CropSpec>,
    pub scale: Option<ScaleSpec>,
}

impl BatchVideo {
    pub fn new(video: Arc<Mutex<Video>>, frame_indices: Vec<usize>) -> Self {
        Self {
            video,
            frame_indices,
            crop: None,
            scale: None,
        }
    }
}

pub type Batch = Vec<BatchVideo>;
pub type Schedule = Vec<Batch>;
