// crates/clipbatch-loader/src/slot.rs
//
// BatchSlot: the output side of a scheduled batch. Every video contributing
// to a batch writes its result into one slot exactly once; the consumer
// blocks until every slot is filled, then takes the whole batch at once.
// Once full, a slot is never mutated again until `take()` drains it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use clipbatch_core::{ClipBatchError, TensorBuffer};

/// Per-slot outcome: a successful tensor, or the error that video's load
/// task hit. A failure in one slot never poisons the rest of the batch —
/// see SPEC_FULL.md §7.
pub type SlotResult = Result<TensorBuffer, ClipBatchError>;

pub struct BatchSlot {
    size: usize,
    buffer: Mutex<Vec<Option<SlotResult>>>,
    filled_count: AtomicUsize,
    full_m: Mutex<()>,
    full_cv: Condvar,
}

impl BatchSlot {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffer: Mutex::new((0..size).map(|_| None).collect()),
            filled_count: AtomicUsize::new(0),
            full_m: Mutex::new(()),
            full_cv: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Write this slot's result. Panics if called twice for the same index —
    /// each index is written by exactly one load task, so a double write is a
    /// scheduling bug, not a runtime condition callers need to handle.
    pub fn add(&self, index: usize, result: SlotResult) {
        {
            let mut buf = self.buffer.lock().unwrap();
            assert!(buf[index].is_none(), "batch slot index {index} written twice");
            buf[index] = Some(result);
        }
        let filled = self.filled_count.fetch_add(1, Ordering::Release) + 1;
        if filled == self.size {
            // Hold the lock empty around the notify, same as the activation
            // condvar in worker.rs: without it a waiter that's between its
            // predicate check and `wait()` can miss this wakeup.
            let _guard = self.full_m.lock().unwrap();
            self.full_cv.notify_all();
        }
    }

    fn is_full(&self) -> bool {
        self.filled_count.load(Ordering::Acquire) == self.size
    }

    /// Block until every index has been written.
    pub fn wait_until_full(&self) {
        if self.size == 0 || self.is_full() {
            return;
        }
        let guard = self.full_m.lock().unwrap();
        let _guard = self
            .full_cv
            .wait_while(guard, |_| !self.is_full())
            .unwrap();
    }

    /// Drain every slot's result, leaving the slot empty. Only meaningful
    /// after `wait_until_full` has returned — called exactly once per batch
    /// by the single consumer.
    pub fn take(&self) -> Vec<SlotResult> {
        let mut buf = self.buffer.lock().unwrap();
        buf.drain(..)
            .map(|o| o.expect("take() called before the slot was full"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tensor() -> TensorBuffer {
        TensorBuffer::alloc_default_stride(clipbatch_core::Shape::new(1, 1, 1))
    }

    #[test]
    fn wait_returns_immediately_once_all_slots_written() {
        let slot = BatchSlot::new(2);
        slot.add(0, Ok(tensor()));
        slot.add(1, Ok(tensor()));
        slot.wait_until_full();
        let data = slot.take();
        assert_eq!(data.len(), 2);
        assert!(data[0].is_ok() && data[1].is_ok());
    }

    #[test]
    fn empty_slot_is_immediately_full() {
        let slot = BatchSlot::new(0);
        slot.wait_until_full();
        assert!(slot.take().is_empty());
    }

    #[test]
    fn waiter_wakes_once_the_last_write_lands() {
        let slot = Arc::new(BatchSlot::new(2));
        let s2 = Arc::clone(&slot);
        let waiter = thread::spawn(move || {
            s2.wait_until_full();
        });
        thread::sleep(Duration::from_millis(20));
        slot.add(0, Ok(tensor()));
        slot.add(1, Err(ClipBatchError::logic("simulated load failure")));
        waiter.join().unwrap();
        let data = slot.take();
        assert!(data[0].is_ok());
        assert!(data[1].is_err());
    }

    #[test]
    #[should_panic(expected = "written twice")]
    fn writing_the_same_index_twice_panics() {
        let slot = BatchSlot::new(1);
        slot.add(0, Err(ClipBatchError::logic("first")));
        slot.add(0, Err(ClipBatchError::logic("second")));
    }
}
