// crates/clipbatch-loader/src/worker.rs
//
// One load-worker thread's body. Each worker owns a private `BufferPool` —
// no cross-worker contention on pool buckets — and a private
// `SpeedEstimator`, whose read-only handle is published into
// `WorkersShared::speed_handles` for the scheduler to poll.
//
// Pause/resume uses the same empty-lock-around-notify condvar pattern as
// `clipbatch-loader::slot::BatchSlot`: `active_worker_m` is held only to
// avoid a missed wakeup between a worker's predicate check and its
// `Condvar::wait` call, never across the actual work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use clipbatch_core::{BufferPool, SpeedEstimator, SpeedHandle};

use crate::dataset_loader::LoaderCore;
use crate::scheduler::schedule_workers;

/// State shared by every worker thread spawned by one `DatasetLoader::start`
/// call. Rebuilt fresh on each `start()`; torn down on `stop()`.
pub(crate) struct WorkersShared {
    pub(crate) count: usize,
    pub(crate) active_worker_count: AtomicUsize,
    pub(crate) active_worker_m: Mutex<()>,
    pub(crate) cvs: Vec<Condvar>,
    pub(crate) speed_handles: Vec<Mutex<Option<SpeedHandle>>>,
}

impl WorkersShared {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count,
            active_worker_count: AtomicUsize::new(count),
            active_worker_m: Mutex::new(()),
            cvs: (0..count).map(|_| Condvar::new()).collect(),
            speed_handles: (0..count).map(|_| Mutex::new(None)).collect(),
        }
    }
}

pub(crate) fn worker_main(core: std::sync::Arc<LoaderCore>, ws: std::sync::Arc<WorkersShared>, worker_index: usize) {
    let pool = BufferPool::new();
    let mut speed = SpeedEstimator::new(core.config.load_speed_window);
    *ws.speed_handles[worker_index].lock().unwrap() = Some(speed.handle());

    let span = tracing::info_span!("loader.worker", worker_id = worker_index);
    let _enter = span.enter();
    tracing::debug!("worker started");

    loop {
        if !core.running.load(Ordering::Relaxed) {
            break;
        }
        let task_index = core.next_task_index.fetch_add(1, Ordering::Relaxed);
        if task_index >= core.tasks.len() {
            break;
        }

        speed.start();
        let task = &core.tasks[task_index];
        let result = {
            let mut video = task.video.lock().unwrap();
            let r = video.get_batch(&task.frame_indices, &pool);
            video.sleep();
            r
        };
        core.output_buffer[task.batch_index].add(task.slot_index, result);
        speed.finish(1.0);

        schedule_workers(&core, &ws);

        let is_active = || ws.active_worker_count.load(Ordering::Relaxed) > worker_index;
        if !is_active() {
            tracing::debug!("pausing");
            let guard = ws.active_worker_m.lock().unwrap();
            let _guard = ws.cvs[worker_index].wait_while(guard, |_| !is_active()).unwrap();
            tracing::debug!("resumed");
        }
    }
    tracing::debug!("worker exiting");
}
