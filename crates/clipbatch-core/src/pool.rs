// crates/clipbatch-core/src/pool.rs
//
// Size-bucketed tensor buffer pool. Grounded on the bucketed buffer-reuse
// pattern used elsewhere in the example pack (a `FramePool<T>` keyed by
// fixed bucket sizes with a `Weak` handle so returns after the pool is gone
// are silently dropped) — generalized here to the pool's two requirements
// that a fixed-bucket pool doesn't have: buckets are created on demand at
// whatever size is actually handed out (not pre-declared), and the handed-out
// count must reach zero before the pool's shared core is released, not just
// before the pool handle itself drops.

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::tensor::{Shape, TensorBuffer};

struct PoolCoreInner {
    buckets: BTreeMap<usize, Vec<TensorBuffer>>,
    handed_out_count: usize,
    pool_alive: bool,
}

/// Shared state between a `BufferPool` and every buffer it has handed out.
/// Lives until both the pool has dropped its reference *and*
/// `handed_out_count` has reached zero — whichever happens last.
struct PoolCore {
    inner: Mutex<PoolCoreInner>,
}

/// Reclamation context attached to every buffer that came from a pool.
/// `size` is the bucket key the buffer was allocated/reused under — a
/// buffer always returns to the same bucket it was handed out from, never
/// one the pool later decides looks similar.
pub(crate) struct ManagerCtx {
    size: usize,
    core: Arc<PoolCore>,
}

impl ManagerCtx {
    /// Called from `TensorBuffer::drop`. Returns `true` if the pool took
    /// ownership of the allocation (the caller must not free it), `false` if
    /// the caller should free it directly (pool already gone).
    pub(crate) fn reclaim(&self, ptr: NonNull<u8>, layout: Layout, shape: Shape, linesize: usize) -> bool {
        let mut inner = self.core.inner.lock().unwrap();
        inner.handed_out_count -= 1;
        if !inner.pool_alive {
            tracing::debug!(size = self.size, "pool gone, freeing buffer directly");
            return false;
        }
        // Reconstruct a fresh, contextless TensorBuffer over the same
        // allocation and file it back under its original bucket. The
        // buffer being dropped never reaches its own `dealloc` call because
        // `manager_ctx` was already taken before this function ran.
        let recycled = TensorBuffer {
            ptr,
            layout,
            shape,
            linesize,
            manager_ctx: None,
        };
        inner.buckets.entry(self.size).or_default().push(recycled);
        true
    }
}

/// Reference-counted, size-bucketed pool of [`TensorBuffer`]s.
///
/// `get(size)` reuses the smallest existing bucket `k >= size` as long as
/// `k < 2 * size` (otherwise the bucket is considered too wasteful to reuse
/// and a fresh buffer is allocated instead). Every buffer handed out carries
/// a strong reference to the pool's shared core, so the core outlives the
/// `BufferPool` value itself for as long as any buffer is still out in the
/// world — dropping the pool only flips `pool_alive` to false under the
/// lock; the core's own allocation is freed once the last `Arc` (pool or
/// buffer) drops.
pub struct BufferPool {
    core: Arc<PoolCore>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            core: Arc::new(PoolCore {
                inner: Mutex::new(PoolCoreInner {
                    buckets: BTreeMap::new(),
                    handed_out_count: 0,
                    pool_alive: true,
                }),
            }),
        }
    }

    /// Number of buffers currently checked out and not yet returned.
    pub fn handed_out_count(&self) -> usize {
        self.core.inner.lock().unwrap().handed_out_count
    }

    /// Acquire a buffer of the given `shape`/`linesize`, reusing a pooled
    /// allocation when one of a compatible size exists.
    pub fn get(&self, shape: Shape, linesize: usize) -> TensorBuffer {
        let size = linesize * shape.h * shape.n;
        let mut inner = self.core.inner.lock().unwrap();

        let reusable_key = inner
            .buckets
            .range(size..)
            .find(|(&k, bucket)| k < 2 * size && !bucket.is_empty())
            .map(|(&k, _)| k);

        let mut buf = if let Some(key) = reusable_key {
            let bucket = inner.buckets.get_mut(&key).unwrap();
            let mut reused = bucket.pop().unwrap();
            if bucket.is_empty() {
                inner.buckets.remove(&key);
            }
            reused.shape = shape;
            reused.linesize = linesize;
            reused.as_mut_slice().fill(0);
            tracing::debug!(size, bucket = key, "pool hit");
            reused
        } else {
            tracing::debug!(size, "pool miss, allocating fresh buffer");
            TensorBuffer::alloc(shape, linesize)
        };

        inner.handed_out_count += 1;
        buf.manager_ctx = Some(ManagerCtx {
            size,
            core: Arc::clone(&self.core),
        });
        buf
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let mut inner = self.core.inner.lock().unwrap();
        inner.buckets.clear();
        inner.pool_alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_a_compatible_bucket() {
        let pool = BufferPool::new();
        let shape = Shape::new(4, 8, 8);
        let linesize = 64;
        {
            let _buf = pool.get(shape, linesize);
            assert_eq!(pool.handed_out_count(), 1);
        }
        assert_eq!(pool.handed_out_count(), 0);
        let _buf2 = pool.get(shape, linesize);
        assert_eq!(pool.handed_out_count(), 1);
    }

    #[test]
    fn skips_buckets_more_than_double_the_request() {
        let pool = BufferPool::new();
        let big_shape = Shape::new(16, 64, 64);
        let big = pool.get(big_shape, 256);
        let big_size = big.byte_size();
        drop(big);

        // Requesting something much smaller than the pooled bucket must not
        // reuse it (bucket >= 2x request).
        let small_shape = Shape::new(1, 4, 4);
        let small = pool.get(small_shape, 16);
        assert!(small.byte_size() * 2 <= big_size);
    }

    #[test]
    fn outstanding_buffer_survives_pool_drop() {
        let pool = BufferPool::new();
        let shape = Shape::new(2, 4, 4);
        let buf = pool.get(shape, 16);
        drop(pool);
        // Must not crash, and must actually free on drop rather than try to
        // return to a dead pool.
        drop(buf);
    }

    #[test]
    fn many_buffers_leak_nothing_across_pool_drop() {
        let pool = BufferPool::new();
        let shape = Shape::new(1, 8, 8);
        let mut bufs = Vec::new();
        for _ in 0..32 {
            bufs.push(pool.get(shape, 32));
        }
        assert_eq!(pool.handed_out_count(), 32);
        drop(pool);
        drop(bufs);
    }
}
