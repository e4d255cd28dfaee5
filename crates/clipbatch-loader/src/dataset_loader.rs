// crates/clipbatch-loader/src/dataset_loader.rs
//
// Public entry point: `DatasetLoader` turns a `Schedule` into a worker pool
// plus an ordered sequence of batch slots, and exposes the single-consumer
// `get_next_batch` surface. See SPEC_FULL.md §4.H for the full design this
// mirrors.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use clipbatch_core::{ClipBatchError, SpeedEstimator, TensorBuffer};
use clipbatch_media::Video;

use crate::config::Config;
use crate::schedule::Schedule;
use crate::scheduler::schedule_workers;
use crate::slot::{BatchSlot, SlotResult};
use crate::worker::{worker_main, WorkersShared};

pub(crate) struct LoadTask {
    pub(crate) video: Arc<Mutex<Video>>,
    pub(crate) frame_indices: Vec<usize>,
    pub(crate) batch_index: usize,
    pub(crate) slot_index: usize,
}

/// Everything a worker thread and the consumer both need to see. Lives for
/// the whole lifetime of a `DatasetLoader`; `workers` is the only part that
/// comes and goes across `start()`/`stop()` cycles.
pub(crate) struct LoaderCore {
    pub(crate) tasks: Vec<LoadTask>,
    pub(crate) output_buffer: Vec<BatchSlot>,
    pub(crate) next_task_index: AtomicUsize,
    next_batch_index: AtomicUsize,
    last_batch_size: AtomicUsize,
    pub(crate) consumed: AtomicUsize,
    pub(crate) running: AtomicBool,
    pub(crate) start_time: Mutex<Option<Instant>>,
    pub(crate) consume_speed: Mutex<SpeedEstimator>,
    pub(crate) config: Config,
    workers: Mutex<Option<Arc<WorkersShared>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

fn flatten(schedule: &Schedule) -> (Vec<BatchSlot>, Vec<LoadTask>) {
    let mut output_buffer = Vec::with_capacity(schedule.len());
    let mut tasks = Vec::new();
    for (batch_index, batch) in schedule.iter().enumerate() {
        output_buffer.push(BatchSlot::new(batch.len()));
        for (slot_index, bv) in batch.iter().enumerate() {
            tasks.push(LoadTask {
                video: Arc::clone(&bv.video),
                frame_indices: bv.frame_indices.clone(),
                batch_index,
                slot_index,
            });
        }
    }
    (output_buffer, tasks)
}

/// Drives a fixed `Schedule` with a pool of worker threads and an adaptive
/// scheduler that keeps at most `Config::max_preload` batches loaded ahead
/// of the consumer. Construct once, `start(n)`, drain with `get_next_batch`
/// in strict order, then `stop()` — or just let it drop, which stops it.
pub struct DatasetLoader {
    core: Arc<LoaderCore>,
}

impl DatasetLoader {
    pub fn new(schedule: Schedule) -> Self {
        Self::with_config(schedule, Config::default())
    }

    pub fn with_config(schedule: Schedule, config: Config) -> Self {
        let (output_buffer, tasks) = flatten(&schedule);
        let mut consume_speed = SpeedEstimator::new(config.consume_speed_window);
        // Start the clock immediately: the first `get_next_batch()` call
        // measures the time from construction, not from its own call.
        consume_speed.start();
        Self {
            core: Arc::new(LoaderCore {
                tasks,
                output_buffer,
                next_task_index: AtomicUsize::new(0),
                next_batch_index: AtomicUsize::new(0),
                last_batch_size: AtomicUsize::new(0),
                consumed: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                start_time: Mutex::new(None),
                consume_speed: Mutex::new(consume_speed),
                config,
                workers: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.core.output_buffer.len()
    }

    /// Spawn `n` worker threads and begin loading. Errors if already
    /// running, or if `n == 0` (there would never be any progress).
    pub fn start(&self, n: usize) -> Result<(), ClipBatchError> {
        if n == 0 {
            return Err(ClipBatchError::logic("worker count must be at least 1"));
        }
        if self.core.running.swap(true, Ordering::Relaxed) {
            return Err(ClipBatchError::logic("loader is already running"));
        }

        *self.core.start_time.lock().unwrap() = Some(Instant::now());

        let ws = Arc::new(WorkersShared::new(n));
        *self.core.workers.lock().unwrap() = Some(Arc::clone(&ws));

        let mut threads = Vec::with_capacity(n);
        for i in 0..n {
            let core = Arc::clone(&self.core);
            let ws = Arc::clone(&ws);
            let handle = thread::Builder::new()
                .name(format!("clipbatch-loader-{i}"))
                .spawn(move || worker_main(core, ws, i))
                .expect("failed to spawn clipbatch-loader worker thread");
            threads.push(handle);
        }
        *self.core.threads.lock().unwrap() = threads;
        tracing::info!(workers = n, "loader started");
        Ok(())
    }

    /// Wake every paused worker, let each finish its in-flight task, then
    /// join all of them. Cooperative: a task that's mid-decode runs to
    /// completion before its worker notices `running == false`.
    pub fn stop(&self) -> Result<(), ClipBatchError> {
        if !self.core.running.swap(false, Ordering::Relaxed) {
            return Err(ClipBatchError::logic("loader is already stopped"));
        }
        if let Some(ws) = self.core.workers.lock().unwrap().clone() {
            ws.active_worker_count.store(ws.count, Ordering::Relaxed);
            {
                let _guard = ws.active_worker_m.lock().unwrap();
            }
            for cv in &ws.cvs {
                cv.notify_one();
            }
        }
        let threads = std::mem::take(&mut *self.core.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
        *self.core.workers.lock().unwrap() = None;
        tracing::info!("loader stopped");
        Ok(())
    }

    /// Block for the next batch in strict ascending order. Single-consumer
    /// contract: calling this from more than one thread concurrently races
    /// on `next_batch_index` and is not supported (see SPEC_FULL.md §5).
    ///
    /// Returns one `SlotResult` per video in the batch, in schedule order —
    /// a decode failure for one video surfaces as `Err` in its own slot
    /// without failing the batch as a whole.
    pub fn get_next_batch(&self) -> Result<Vec<SlotResult>, ClipBatchError> {
        let batch_index = self.core.next_batch_index.fetch_add(1, Ordering::Relaxed);
        if batch_index >= self.core.output_buffer.len() {
            return Err(ClipBatchError::logic("no more batch"));
        }

        let last_size = self.core.last_batch_size.load(Ordering::Relaxed);
        if last_size > 0 {
            self.core.consume_speed.lock().unwrap().finish(last_size as f64);
        }

        let slot = &self.core.output_buffer[batch_index];
        slot.wait_until_full();

        self.core.consumed.fetch_add(slot.size(), Ordering::Relaxed);
        if let Some(ws) = self.core.workers.lock().unwrap().clone() {
            schedule_workers(&self.core, &ws);
        }
        self.core.last_batch_size.store(slot.size(), Ordering::Relaxed);

        let data = slot.take();
        self.core.consume_speed.lock().unwrap().start();
        Ok(data)
    }

    /// Cropped/scaled batch retrieval — not implemented. `CropSpec`/
    /// `ScaleSpec` exist on `BatchVideo` for forward compatibility, but no
    /// decode path consumes them yet.
    pub fn get_next_scaled_batch(&self) -> Result<Vec<TensorBuffer>, ClipBatchError> {
        Err(ClipBatchError::logic("get_next_scaled_batch is not implemented"))
    }
}

impl Drop for DatasetLoader {
    fn drop(&mut self) {
        if self.core.running.load(Ordering::Relaxed) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises start/stop/get_next_batch bookkeeping without touching
    // ffmpeg: a batch with zero videos in it is immediately full.
    fn empty_schedule(batches: usize) -> Schedule {
        (0..batches).map(|_| Vec::new()).collect()
    }

    #[test]
    fn double_start_is_a_logic_error() {
        let loader = DatasetLoader::new(empty_schedule(1));
        loader.start(1).unwrap();
        let err = loader.start(1).unwrap_err();
        assert!(err.to_string().contains("already running"));
        loader.stop().unwrap();
    }

    #[test]
    fn double_stop_is_a_logic_error() {
        let loader = DatasetLoader::new(empty_schedule(1));
        loader.start(1).unwrap();
        loader.stop().unwrap();
        let err = loader.stop().unwrap_err();
        assert!(err.to_string().contains("already stopped"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let loader = DatasetLoader::new(empty_schedule(1));
        let err = loader.start(0).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn batches_with_no_videos_drain_immediately_in_order() {
        let loader = DatasetLoader::new(empty_schedule(3));
        loader.start(2).unwrap();
        for _ in 0..3 {
            let batch = loader.get_next_batch().unwrap();
            assert!(batch.is_empty());
        }
        let err = loader.get_next_batch().unwrap_err();
        assert!(err.to_string().contains("no more batch"));
        loader.stop().unwrap();
    }

    #[test]
    fn scaled_batch_is_not_implemented() {
        let loader = DatasetLoader::new(empty_schedule(1));
        let err = loader.get_next_scaled_batch().unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
