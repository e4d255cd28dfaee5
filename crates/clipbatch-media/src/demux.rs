// crates/clipbatch-media/src/demux.rs
//
// Thin RAII wrapper around a raw `AVFormatContext` opened over a custom
// `AVIOContext` (see avio.rs). Finds the best video stream and hands packets
// to the caller; doesn't know about codecs or pixel formats.

use std::ffi::CString;
use std::os::raw::c_int;
use std::ptr::NonNull;

use clipbatch_core::ClipBatchError;
use clipbatch_io::SleepableIo;

use ffmpeg_the_third::ffi;

use crate::avio::AvioBridge;

fn av_check(ret: c_int, site: &'static str) -> Result<c_int, ClipBatchError> {
    if ret < 0 {
        Err(ClipBatchError::media(ret, av_err2str(ret), site))
    } else {
        Ok(ret)
    }
}

fn av_err2str(errnum: c_int) -> String {
    const BUF_SIZE: usize = 64;
    let mut buf = [0i8; BUF_SIZE];
    unsafe {
        ffi::av_strerror(errnum, buf.as_mut_ptr(), BUF_SIZE);
        std::ffi::CStr::from_ptr(buf.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

/// One demuxed packet, owning its own `AVPacket`.
pub struct AvPacket {
    ptr: NonNull<ffi::AVPacket>,
}

impl AvPacket {
    fn alloc() -> Self {
        let raw = unsafe { ffi::av_packet_alloc() };
        Self {
            ptr: NonNull::new(raw).expect("av_packet_alloc returned null"),
        }
    }

    pub fn as_ptr(&self) -> *mut ffi::AVPacket {
        self.ptr.as_ptr()
    }

    pub fn stream_index(&self) -> usize {
        unsafe { (*self.ptr.as_ptr()).stream_index as usize }
    }

    pub fn pts(&self) -> i64 {
        unsafe { (*self.ptr.as_ptr()).pts }
    }

    pub fn is_key(&self) -> bool {
        unsafe { (*self.ptr.as_ptr()).flags & ffi::AV_PKT_FLAG_KEY != 0 }
    }

    /// Marks the packet as not needed for output. The decoder still consumes
    /// it to keep reference-frame state correct, it just won't surface a
    /// frame for it.
    pub fn set_discard(&mut self) {
        unsafe { (*self.ptr.as_ptr()).flags |= ffi::AV_PKT_FLAG_DISCARD };
    }

    pub(crate) fn unref(&mut self) {
        unsafe { ffi::av_packet_unref(self.ptr.as_ptr()) };
    }
}

impl Drop for AvPacket {
    fn drop(&mut self) {
        let mut ptr = self.ptr.as_ptr();
        unsafe { ffi::av_packet_free(&mut ptr) };
    }
}

/// The demuxer's i/o layer and its format context. `sleep`/`wake` tear down
/// and rebuild only the `AVIOContext`; the `AVFormatContext` — stream list,
/// codec parameters, index — is untouched so re-waking doesn't cost a
/// re-probe.
pub struct Demuxer {
    avio: AvioBridge,
    fmt_ctx: NonNull<ffi::AVFormatContext>,
    video_stream_index: usize,
}

// The demuxer is explicitly not `Sync`: only one thread at a time may own a
// Video's decode. `Send` is fine — a worker thread owns it for the lifetime
// of one task.
unsafe impl Send for Demuxer {}

impl Demuxer {
    pub fn open(io: SleepableIo) -> Result<Self, ClipBatchError> {
        let mut avio = AvioBridge::new(io);
        let fmt_ctx = unsafe { open_format_context(&mut avio)? };

        let video_stream_index = unsafe {
            let ret = ffi::av_find_best_stream(
                fmt_ctx.as_ptr(),
                ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
                -1,
                -1,
                std::ptr::null_mut(),
                0,
            );
            av_check(ret, "demux::open av_find_best_stream")?
        };

        Ok(Self {
            avio,
            fmt_ctx,
            video_stream_index: video_stream_index as usize,
        })
    }

    pub fn video_stream_index(&self) -> usize {
        self.video_stream_index
    }

    pub fn fmt_ctx_ptr(&self) -> *mut ffi::AVFormatContext {
        self.fmt_ctx.as_ptr()
    }

    pub fn codecpar_ptr(&self) -> *mut ffi::AVCodecParameters {
        unsafe {
            let streams = (*self.fmt_ctx.as_ptr()).streams;
            (*(*streams.add(self.video_stream_index))).codecpar
        }
    }

    pub fn time_base(&self) -> (i32, i32) {
        unsafe {
            let streams = (*self.fmt_ctx.as_ptr()).streams;
            let tb = (*(*streams.add(self.video_stream_index))).time_base;
            (tb.num, tb.den)
        }
    }

    pub fn average_frame_rate(&self) -> (i32, i32) {
        unsafe {
            let streams = (*self.fmt_ctx.as_ptr()).streams;
            let fr = (*(*streams.add(self.video_stream_index))).avg_frame_rate;
            (fr.num, fr.den)
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.avio.is_sleeping()
    }

    pub fn sleep(&mut self) {
        self.avio.sleep();
        unsafe {
            (*self.fmt_ctx.as_ptr()).pb = std::ptr::null_mut();
        }
    }

    pub fn wake(&mut self) -> Result<(), ClipBatchError> {
        self.avio.wake()?;
        unsafe {
            (*self.fmt_ctx.as_ptr()).pb = self.avio.raw().expect("woke but still asleep");
        }
        Ok(())
    }

    /// Seeks to the key frame at or before `target_pts`, in the video
    /// stream's own time base.
    pub fn seek_backward(&mut self, target_pts: i64) -> Result<(), ClipBatchError> {
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.fmt_ctx.as_ptr(),
                self.video_stream_index as c_int,
                i64::MIN,
                target_pts,
                target_pts,
                ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        av_check(ret, "demux::seek_backward").map(|_| ())
    }

    /// Reads the next packet from any stream; returns `None` at genuine EOF.
    /// Callers filter by `video_stream_index()` themselves, matching the
    /// scheduler's packet-keep/discard loop in `decode.rs`.
    pub fn read_packet(&mut self) -> Result<Option<AvPacket>, ClipBatchError> {
        let mut packet = AvPacket::alloc();
        let ret = unsafe { ffi::av_read_frame(self.fmt_ctx.as_ptr(), packet.as_ptr()) };
        if ret == ffi::AVERROR_EOF {
            return Ok(None);
        }
        av_check(ret, "demux::read_packet")?;
        Ok(Some(packet))
    }

    /// One-time full scan used to build the packet index at open: reads
    /// every packet on the video stream, recording `(pts, is_key)` in raw
    /// decode order, then leaves the demuxer positioned at EOF — callers
    /// always seek explicitly before the next real read, so no rewind is
    /// needed here.
    pub fn scan_all_packets(&mut self) -> Result<Vec<(i64, bool)>, ClipBatchError> {
        let mut out = Vec::new();
        while let Some(mut packet) = self.read_packet()? {
            if packet.stream_index() == self.video_stream_index {
                out.push((packet.pts(), packet.is_key()));
            }
            packet.unref();
        }
        Ok(out)
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        unsafe {
            // Custom-allocated AVIOContexts are never freed by
            // avformat_close_input — detach pb first so it doesn't try, and
            // let `AvioBridge`'s own Drop handle the buffer/context.
            (*self.fmt_ctx.as_ptr()).pb = std::ptr::null_mut();
            let mut ptr = self.fmt_ctx.as_ptr();
            ffi::avformat_close_input(&mut ptr);
        }
    }
}

unsafe fn open_format_context(
    avio: &mut AvioBridge,
) -> Result<NonNull<ffi::AVFormatContext>, ClipBatchError> {
    let mut fmt_ctx = ffi::avformat_alloc_context();
    if fmt_ctx.is_null() {
        return Err(ClipBatchError::media(0, "avformat_alloc_context failed", "demux::open"));
    }
    (*fmt_ctx).pb = avio.raw().expect("fresh AvioBridge is never asleep");
    (*fmt_ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

    // The URL is purely diagnostic when a custom AVIOContext is supplied —
    // probing happens entirely through the read/seek callbacks.
    let url = CString::new("clipbatch://sleepable").unwrap();
    let ret = ffi::avformat_open_input(
        &mut fmt_ctx,
        url.as_ptr(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    );
    if ret < 0 {
        // avformat_open_input frees fmt_ctx itself on failure.
        return Err(ClipBatchError::media(ret, av_err2str(ret), "demux::avformat_open_input"));
    }

    let ret = ffi::avformat_find_stream_info(fmt_ctx, std::ptr::null_mut());
    if ret < 0 {
        let mut ptr = fmt_ctx;
        ffi::avformat_close_input(&mut ptr);
        return Err(ClipBatchError::media(ret, av_err2str(ret), "demux::avformat_find_stream_info"));
    }

    Ok(NonNull::new(fmt_ctx).expect("fmt_ctx checked non-null above"))
}
