// crates/clipbatch-loader/src/lib.rs
//
// The dataset loader: an adaptive worker pool (component H) driving a fixed
// `Schedule` of `clipbatch_media::Video`s into ordered batch slots, plus the
// tar-batch opener (component I) that builds such schedules out of an
// archive without ever touching the filesystem per-entry.

mod config;
mod dataset_loader;
mod schedule;
mod scheduler;
mod slot;
mod tar_opener;
mod worker;

pub use config::Config;
pub use dataset_loader::DatasetLoader;
pub use schedule::{Batch, BatchVideo, CropSpec, ScaleSpec, Schedule};
pub use slot::SlotResult;
pub use tar_opener::{accept_all, open_video_tar, open_video_tar_with};
