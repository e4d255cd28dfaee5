// crates/clipbatch-media/src/avio.rs
//
// Bridges a `SleepableIo` into a custom `AVIOContext` so the demuxer can be
// opened over a byte range (a tar sub-region, or a file that may be asleep
// between uses) instead of the library's own "open by path" entry point,
// which always owns its fd directly and has no notion of a sub-range.
//
// This is the one place the crate drives the media library's raw C entry
// points instead of its safe wrapper types — the same posture `decode.rs`
// and `probe.rs` already took for raw codec-parameter access. The safe
// wrapper's `format::input()` has no "open with custom I/O" knob, so the
// custom-AVIOContext path has to start from `ffmpeg_the_third::ffi` directly.

use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;

use clipbatch_io::{SleepableIo, Whence};

use ffmpeg_the_third::ffi;

/// Size of the scratch buffer `AVIOContext` reads through. Freed on
/// `sleep()`, reallocated on `wake()` — see `AvioBridge::sleep`/`wake`.
const IO_BUFFER_SIZE: usize = 32 * 1024;

const fn mktag(a: u8, b: u8, c: u8, d: u8) -> i32 {
    (a as i32) | ((b as i32) << 8) | ((c as i32) << 16) | ((d as i32) << 24)
}

/// `AVERROR_EOF`, computed the same way the library itself derives it
/// (`-MKTAG('E','O','F',' ')`) rather than trusting a particular binding
/// generation to have exported the constant under a stable name.
const AVERROR_EOF: c_int = -mktag(b'E', b'O', b'F', b' ');
const AVERROR_EIO: c_int = -(libc::EIO as c_int);

/// Owns the boxed `SleepableIo` plus the `AVIOContext` built on top of it.
/// The `Box` is never moved once built — the opaque pointer handed to
/// `avio_alloc_context` points straight into it — so this struct is the only
/// thing allowed to drop it.
pub struct AvioBridge {
    io: Box<SleepableIo>,
    ctx: Option<NonNull<ffi::AVIOContext>>,
}

impl AvioBridge {
    pub fn new(io: SleepableIo) -> Self {
        let mut io = Box::new(io);
        let ctx = unsafe { alloc_avio_context(io.as_mut()) };
        Self { io, ctx: Some(ctx) }
    }

    /// Raw pointer suitable for `AVFormatContext.pb`. `None` while asleep.
    pub fn raw(&self) -> Option<*mut ffi::AVIOContext> {
        self.ctx.map(|p| p.as_ptr())
    }

    pub fn is_sleeping(&self) -> bool {
        self.ctx.is_none()
    }

    /// Frees the `AVIOContext` and its scratch buffer, then puts the
    /// underlying stream to sleep. The demuxer must not hold onto the old
    /// `pb` pointer past this call.
    pub fn sleep(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            unsafe { free_avio_context(ctx) };
        }
        self.io.sleep();
    }

    /// Wakes the underlying stream and rebuilds a fresh `AVIOContext` over
    /// it. The demuxer must re-read `raw()` and reassign `pb` afterward.
    pub fn wake(&mut self) -> Result<(), clipbatch_core::ClipBatchError> {
        self.io.wake()?;
        if self.ctx.is_none() {
            self.ctx = Some(unsafe { alloc_avio_context(self.io.as_mut()) });
        }
        Ok(())
    }
}

impl Drop for AvioBridge {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            unsafe { free_avio_context(ctx) };
        }
    }
}

unsafe fn alloc_avio_context(io: &mut SleepableIo) -> NonNull<ffi::AVIOContext> {
    let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
    let opaque = io as *mut SleepableIo as *mut c_void;
    let raw = ffi::avio_alloc_context(
        buffer,
        IO_BUFFER_SIZE as c_int,
        0, // read-only
        opaque,
        Some(read_packet_trampoline),
        None, // write_packet
        Some(seek_trampoline),
    );
    // avio_alloc_context only returns null on allocation failure, which
    // `av_malloc`'s own abort-on-OOM policy makes unreachable in practice;
    // the expect documents that assumption rather than silently unwrapping.
    NonNull::new(raw).expect("avio_alloc_context returned null")
}

unsafe fn free_avio_context(ctx: NonNull<ffi::AVIOContext>) {
    let mut ptr = ctx.as_ptr();
    // avio_context_free also frees the buffer it was allocated with.
    ffi::avio_context_free(&mut ptr);
}

unsafe extern "C" fn read_packet_trampoline(
    opaque: *mut c_void,
    buf: *mut u8,
    buf_size: c_int,
) -> c_int {
    let io = &mut *(opaque as *mut SleepableIo);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size.max(0) as usize);
    match io.read(slice) {
        Ok(0) => AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(_) => AVERROR_EIO,
    }
}

unsafe extern "C" fn seek_trampoline(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let io = &mut *(opaque as *mut SleepableIo);
    // AVSEEK_SIZE (0x10000) is ffmpeg's convention for "don't move, tell me
    // the size" — the same query `Whence::Size` already models.
    const AVSEEK_SIZE: c_int = 0x10000;
    let masked = whence & !AVSEEK_SIZE;
    let resolved = if whence & AVSEEK_SIZE != 0 {
        Whence::Size
    } else {
        match masked {
            libc::SEEK_SET => Whence::Start,
            libc::SEEK_CUR => Whence::Current,
            libc::SEEK_END => Whence::End,
            _ => return AVERROR_EIO as i64,
        }
    };
    match io.seek(offset, resolved) {
        Ok(pos) => pos as i64,
        Err(_) => AVERROR_EIO as i64,
    }
}
