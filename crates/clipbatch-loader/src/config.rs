// crates/clipbatch-loader/src/config.rs
//
// Runtime defaults for the adaptive scheduler, the output-buffer depth, and
// the tar-batch opener's parallelism. No environment variable drives any of
// these — `CLIPBATCH_LOG` is read only by whichever subscriber the embedder
// installs (`tracing_subscriber::EnvFilter`); this crate never calls
// `std::env::var` itself, keeping it embeddable in hosts that manage their
// own environment (see SPEC_FULL.md §10-11).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on `loaded - consumed` batches the scheduler will let
    /// workers run ahead by before pausing all of them.
    pub max_preload: usize,
    /// While the loader has been running for less than this, every worker
    /// stays active regardless of speed estimates — letting the pipeline
    /// fill before the scheduler starts trusting its own measurements.
    pub warmup_duration: Duration,
    /// Sliding window for the consumer-side speed estimator.
    pub consume_speed_window: Duration,
    /// Sliding window for each worker's load-speed estimator.
    pub load_speed_window: Duration,
    /// Worker count `tar_opener::open_video_tar` hands to
    /// `open_video_tar_with` as its default `max_threads`.
    pub tar_open_max_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_preload: 512,
            warmup_duration: Duration::from_secs(1),
            consume_speed_window: Duration::from_secs(10),
            load_speed_window: Duration::from_secs(3),
            tar_open_max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
