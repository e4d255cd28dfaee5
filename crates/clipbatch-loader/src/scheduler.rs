// crates/clipbatch-loader/src/scheduler.rs
//
// The adaptive worker-count decision. `target_worker_count` is the pure
// arithmetic core, kept free of threads and locks so its monotonicity and
// edge-case behavior can be unit tested directly. `schedule_workers` is the
// live wiring: it reads the loader's current counters and every active
// worker's speed estimate, then wakes however many workers the target calls
// for.

use std::sync::atomic::Ordering;

use crate::dataset_loader::LoaderCore;
use crate::worker::WorkersShared;

/// Decide how many workers should be active right now.
///
/// - `can_load <= 0`: the preload buffer is full; pause everyone.
/// - `within_warmup`: too early to trust any speed estimate; run everyone.
/// - either speed estimate is NaN (not enough samples yet): run everyone.
/// - otherwise: run `ceil(avg_load_speed / (consume_speed * 0.95))` workers,
///   clamped to `[0, min(can_load, worker_count)]`. The `0.95` factor biases
///   toward slightly over-provisioning workers rather than under-provisioning
///   and stalling the consumer.
pub(crate) fn target_worker_count(
    can_load: i64,
    within_warmup: bool,
    consume_speed: f64,
    avg_load_speed: f64,
    worker_count: usize,
) -> usize {
    if can_load <= 0 {
        return 0;
    }
    if within_warmup {
        return worker_count;
    }
    if consume_speed.is_nan() || avg_load_speed.is_nan() {
        return worker_count;
    }
    let raw_target = (avg_load_speed / (consume_speed * 0.95)).ceil();
    let target = if raw_target.is_finite() && raw_target > 0.0 {
        raw_target as usize
    } else {
        0
    };
    target.min(can_load.max(0) as usize).min(worker_count)
}

/// Read the live state and recompute + apply the target worker count,
/// waking any newly-activated workers. Called after every completed load
/// task and after every `get_next_batch()` call — the two events that move
/// `loaded`/`consumed` and thus can change the target.
pub(crate) fn schedule_workers(core: &LoaderCore, ws: &WorkersShared) {
    let loaded = core.next_task_index.load(Ordering::Relaxed).min(core.tasks.len());
    let consumed = core.consumed.load(Ordering::Relaxed);
    let can_load = core.config.max_preload as i64 - (loaded as i64 - consumed as i64);

    let within_warmup = core
        .start_time
        .lock()
        .unwrap()
        .map(|t| t.elapsed() < core.config.warmup_duration)
        .unwrap_or(true);

    let consume_speed = core.consume_speed.lock().unwrap().duration_per_event();

    let active = ws.active_worker_count.load(Ordering::Relaxed).min(ws.count);
    let avg_load_speed = if active == 0 {
        ws.speed_handles[0]
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.duration_per_event())
            .unwrap_or(f64::NAN)
    } else {
        let mut sum = 0.0;
        for handle in &ws.speed_handles[..active] {
            sum += handle
                .lock()
                .unwrap()
                .as_ref()
                .map(|h| h.duration_per_event())
                .unwrap_or(f64::NAN);
        }
        sum / active as f64
    };

    let target = target_worker_count(can_load, within_warmup, consume_speed, avg_load_speed, ws.count);
    ws.active_worker_count.store(target, Ordering::Relaxed);
    if !within_warmup && (consume_speed.is_nan() || avg_load_speed.is_nan()) {
        tracing::warn!(
            can_load,
            consume_speed,
            avg_load_speed,
            "speed estimate unavailable past warmup, falling back to all workers"
        );
    }
    tracing::debug!(target, can_load, within_warmup, consume_speed, avg_load_speed, "schedule_workers");

    // Hold the activation mutex empty around the notify so a worker that's
    // between its predicate check and `wait()` never misses this wakeup.
    let _guard = ws.active_worker_m.lock().unwrap();
    for cv in &ws.cvs[..target] {
        cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preload_buffer_full_pauses_everyone() {
        assert_eq!(target_worker_count(0, false, 1.0, 1.0, 8), 0);
        assert_eq!(target_worker_count(-5, false, 1.0, 1.0, 8), 0);
    }

    #[test]
    fn warmup_runs_everyone_regardless_of_speed() {
        assert_eq!(target_worker_count(100, true, 0.001, 1000.0, 8), 8);
    }

    #[test]
    fn missing_speed_estimate_runs_everyone() {
        assert_eq!(target_worker_count(100, false, f64::NAN, 1.0, 8), 8);
        assert_eq!(target_worker_count(100, false, 1.0, f64::NAN, 8), 8);
    }

    #[test]
    fn target_tracks_relative_speed_ratio() {
        // consumer takes 1s/item, each worker takes 0.5s/item on average ->
        // one worker alone would already outpace the consumer.
        let t = target_worker_count(100, false, 1.0, 0.5, 8);
        assert_eq!(t, 1);
    }

    #[test]
    fn target_is_clamped_to_preload_headroom_and_worker_count() {
        // worker is much slower than consumer -> formula wants many workers,
        // but there's only headroom for 3 more batches.
        let t = target_worker_count(3, false, 0.01, 10.0, 100);
        assert_eq!(t, 3);
        // headroom is ample but the pool only has 4 workers total.
        let t2 = target_worker_count(1000, false, 0.01, 10.0, 4);
        assert_eq!(t2, 4);
    }

    #[test]
    fn doubling_consume_speed_never_increases_the_target() {
        let slow_consumer = target_worker_count(100, false, 1.0, 0.3, 16);
        let fast_consumer = target_worker_count(100, false, 2.0, 0.3, 16);
        assert!(fast_consumer <= slow_consumer);
    }
}
