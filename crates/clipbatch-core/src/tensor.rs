// crates/clipbatch-core/src/tensor.rs
//
// The managed 4-D uint8 buffer handed back to callers of `get_batch`.
//
// Shape is declared as [N, W, H, 3] (batch, width, height, channel) but the
// byte layout is row-major per frame: [linesize*H, 3, linesize, 1] strides.
// Dimension 1 (width) carries stride 3 and dimension 2 (height) carries
// stride `linesize` — this looks backwards next to the declared shape, but
// it is the documented wire layout (see SPEC_FULL.md §4.G) and downstream
// consumers depend on it bit-for-bit. Do not "fix" it without also changing
// the declared shape.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::pool::ManagerCtx;

/// Minimum alignment for a decoded-frame buffer. Matches the alignment SIMD
/// pixel-conversion routines in the media library expect for unaligned-load
/// avoidance.
pub const FRAME_ALIGN: usize = 64;

/// Declared tensor shape: `[N, W, H, 3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub n: usize,
    pub w: usize,
    pub h: usize,
    pub c: usize,
}

impl Shape {
    pub fn new(n: usize, w: usize, h: usize) -> Self {
        Self { n, w, h, c: 3 }
    }
}

/// The linesize `alloc_default_stride` would pick for `shape`, exposed so
/// callers that need the number before allocating (e.g. to ask a
/// [`crate::pool::BufferPool`] for a matching buffer) don't duplicate the
/// rounding rule.
pub fn default_linesize(shape: Shape) -> usize {
    let row_bytes = shape.w * shape.c;
    (row_bytes.div_ceil(FRAME_ALIGN) * FRAME_ALIGN).max(row_bytes)
}

/// A contiguous, aligned uint8 region backing one batch's worth of decoded
/// frames. Carries an optional `manager_ctx` used by `BufferPool` to route
/// its eventual destruction back to the pool instead of the allocator.
pub struct TensorBuffer {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) layout: Layout,
    pub shape: Shape,
    /// Row stride in bytes for one frame (>= w*3, rounded for alignment).
    pub linesize: usize,
    pub(crate) manager_ctx: Option<ManagerCtx>,
}

// SAFETY: TensorBuffer owns its backing allocation exclusively; nothing else
// holds a pointer into it while a `TensorBuffer` value is alive on another
// thread. The `BufferPool` that may later reclaim it synchronizes through
// its own mutex before touching the pointer.
unsafe impl Send for TensorBuffer {}

impl TensorBuffer {
    /// Total byte size of the buffer: `linesize * H * N`.
    pub fn byte_size(&self) -> usize {
        self.linesize * self.shape.h * self.shape.n
    }

    /// Strides in bytes, in `[N, W, H, C]` declared-axis order. See the
    /// module doc comment for why axes 1 and 2 look transposed.
    pub fn strides(&self) -> [usize; 4] {
        [self.linesize * self.shape.h, 3, self.linesize, 1]
    }

    /// Allocate a fresh, zero-initialized buffer sized for `shape` with a
    /// caller-chosen `linesize` (must be `>= shape.w * shape.c`).
    ///
    /// This is the "cold" path the pool falls back to on a bucket miss;
    /// `BufferPool::get` is the usual entry point.
    pub fn alloc(shape: Shape, linesize: usize) -> Self {
        assert!(
            linesize >= shape.w * shape.c,
            "linesize {linesize} too small for width {} * channels {}",
            shape.w,
            shape.c
        );
        let size = linesize * shape.h * shape.n;
        let layout = Layout::from_size_align(size.max(1), FRAME_ALIGN)
            .expect("tensor buffer layout must be valid");
        // SAFETY: layout has non-zero, power-of-two alignment and a size
        // that fits in isize (guaranteed by Layout's own constructor).
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        // SAFETY: freshly allocated region of `size` bytes, zero-filled here
        // so uninitialized padding never leaks into a downstream tensor.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Self {
            ptr,
            layout,
            shape,
            linesize,
            manager_ctx: None,
        }
    }

    /// Construct a buffer of the minimum `linesize` that satisfies alignment
    /// and the channel width, used when the caller has no alignment
    /// preference beyond `FRAME_ALIGN`.
    pub fn alloc_default_stride(shape: Shape) -> Self {
        Self::alloc(shape, default_linesize(shape))
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `byte_size()` bytes for the lifetime of
        // `self`; `self` is borrowed immutably here so no concurrent writer
        // exists through this buffer.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.byte_size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive borrow of `self` guarantees no other reference
        // to the same bytes exists.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.byte_size()) }
    }

    /// One frame's writable row slice within the buffer, for builders that
    /// fill frame-by-frame, row-by-row during decode.
    pub fn frame_row_mut(&mut self, frame_index: usize, row: usize) -> &mut [u8] {
        let row_bytes = self.shape.w * self.shape.c;
        let frame_stride = self.linesize * self.shape.h;
        let start = frame_index * frame_stride + row * self.linesize;
        &mut self.as_mut_slice()[start..start + row_bytes]
    }
}

impl Drop for TensorBuffer {
    fn drop(&mut self) {
        // A buffer with a live pool context always consults the pool first —
        // the pool may choose to recycle the allocation rather than free it.
        if let Some(ctx) = self.manager_ctx.take() {
            if ctx.reclaim(self.ptr, self.layout, self.shape, self.linesize) {
                return;
            }
        }
        // SAFETY: `layout` is exactly the layout used in `alloc`, and this is
        // the only place that frees `ptr` (pool reclamation above takes over
        // the free itself and returns early).
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zeroes_and_sizes_correctly() {
        let shape = Shape::new(4, 8, 6);
        let buf = TensorBuffer::alloc_default_stride(shape);
        assert_eq!(buf.shape, shape);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.byte_size(), buf.linesize * 6 * 4);
    }

    #[test]
    fn strides_match_documented_transposed_layout() {
        let buf = TensorBuffer::alloc(Shape::new(2, 10, 5), 64);
        assert_eq!(buf.strides(), [64 * 5, 3, 64, 1]);
    }

    #[test]
    fn frame_row_mut_lands_in_bounds() {
        let mut buf = TensorBuffer::alloc(Shape::new(2, 4, 3), 64);
        let row = buf.frame_row_mut(1, 2);
        assert_eq!(row.len(), 4 * 3);
        row.fill(9);
        assert_eq!(buf.as_slice()[1 * 64 * 3 + 2 * 64], 9);
    }
}
