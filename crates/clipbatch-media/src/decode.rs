// crates/clipbatch-media/src/decode.rs
//
// Per-request decode pipeline: opens a fresh decoder context against the
// demuxer's stream parameters, drives the schedule produced by `index.rs`
// through a send-packet/receive-frame loop, and writes each wanted frame
// into the output tensor as RGB24 via swscale.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use clipbatch_core::{default_linesize, BufferPool, ClipBatchError, Shape, TensorBuffer};

use ffmpeg_the_third::ffi;

use crate::demux::Demuxer;
use crate::index::ScheduleEntry;

fn av_err2str(errnum: i32) -> String {
    const BUF_SIZE: usize = 64;
    let mut buf = [0i8; BUF_SIZE];
    unsafe {
        ffi::av_strerror(errnum, buf.as_mut_ptr(), BUF_SIZE);
        std::ffi::CStr::from_ptr(buf.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

fn media_err(ret: i32, site: &'static str) -> ClipBatchError {
    ClipBatchError::media(ret, av_err2str(ret), site)
}

/// `-EAGAIN`, computed from `libc` rather than trusted to a particular
/// binding generation's re-export of the macro.
const AVERROR_EAGAIN: i32 = -(libc::EAGAIN as i32);

struct AvCodecContext {
    ptr: NonNull<ffi::AVCodecContext>,
}

impl AvCodecContext {
    fn open(codecpar: *mut ffi::AVCodecParameters) -> Result<Self, ClipBatchError> {
        unsafe {
            let codec_id = (*codecpar).codec_id;
            let codec = ffi::avcodec_find_decoder(codec_id);
            if codec.is_null() {
                return Err(ClipBatchError::media(0, "no decoder for codec", "decode::open"));
            }
            let raw_ctx = ffi::avcodec_alloc_context3(codec);
            let ctx = NonNull::new(raw_ctx)
                .ok_or_else(|| ClipBatchError::media(0, "avcodec_alloc_context3 failed", "decode::open"))?;

            let ret = ffi::avcodec_parameters_to_context(ctx.as_ptr(), codecpar);
            if ret < 0 {
                let mut p = ctx.as_ptr();
                ffi::avcodec_free_context(&mut p);
                return Err(media_err(ret, "decode::avcodec_parameters_to_context"));
            }

            // Threading disabled: each request gets a fresh, short-lived
            // decoder context, and parallelism already comes from the
            // worker pool processing different videos, not from
            // parallelizing a single decode.
            (*ctx.as_ptr()).thread_count = 1;

            let ret = ffi::avcodec_open2(ctx.as_ptr(), codec, std::ptr::null_mut());
            if ret < 0 {
                let mut p = ctx.as_ptr();
                ffi::avcodec_free_context(&mut p);
                return Err(media_err(ret, "decode::avcodec_open2"));
            }

            Ok(Self { ptr: ctx })
        }
    }

    fn as_ptr(&self) -> *mut ffi::AVCodecContext {
        self.ptr.as_ptr()
    }

    fn send_packet(&mut self, packet: *mut ffi::AVPacket) -> Result<(), ClipBatchError> {
        let ret = unsafe { ffi::avcodec_send_packet(self.as_ptr(), packet) };
        if ret < 0 && ret != AVERROR_EAGAIN {
            return Err(media_err(ret, "decode::send_packet"));
        }
        Ok(())
    }

    /// `Ok(true)` if a frame was decoded into `frame`, `Ok(false)` on "need
    /// more input" — not an error, the caller feeds another packet.
    fn receive_frame(&mut self, frame: &mut AvFrame) -> Result<bool, ClipBatchError> {
        let ret = unsafe { ffi::avcodec_receive_frame(self.as_ptr(), frame.as_ptr()) };
        if ret == AVERROR_EAGAIN || ret == ffi::AVERROR_EOF {
            return Ok(false);
        }
        if ret < 0 {
            return Err(media_err(ret, "decode::receive_frame"));
        }
        Ok(true)
    }

    /// Drops any buffered reference frames and internal decode state. Called
    /// before seeking to a new schedule entry so frames left over from the
    /// previous run's tail never bleed into the next run's output.
    fn flush(&mut self) {
        unsafe { ffi::avcodec_flush_buffers(self.as_ptr()) };
    }
}

impl Drop for AvCodecContext {
    fn drop(&mut self) {
        let mut ptr = self.ptr.as_ptr();
        unsafe { ffi::avcodec_free_context(&mut ptr) };
    }
}

struct AvFrame {
    ptr: NonNull<ffi::AVFrame>,
}

impl AvFrame {
    fn new() -> Self {
        let raw = unsafe { ffi::av_frame_alloc() };
        Self {
            ptr: NonNull::new(raw).expect("av_frame_alloc returned null"),
        }
    }

    fn as_ptr(&self) -> *mut ffi::AVFrame {
        self.ptr.as_ptr()
    }

    fn pts(&self) -> i64 {
        unsafe { (*self.as_ptr()).pts }
    }

    fn width(&self) -> i32 {
        unsafe { (*self.as_ptr()).width }
    }

    fn height(&self) -> i32 {
        unsafe { (*self.as_ptr()).height }
    }

    /// Raw `AVPixelFormat` value the frame was decoded into.
    fn pixel_format(&self) -> ffi::AVPixelFormat {
        let raw = unsafe { (*self.as_ptr()).format };
        // SAFETY: AVFrame.format stores an `AVPixelFormat` value narrowed to
        // `c_int` at the C level; the two share representation by
        // definition of the enum's underlying type.
        unsafe { std::mem::transmute::<i32, ffi::AVPixelFormat>(raw) }
    }

    fn data_and_linesize(&self) -> ([*const u8; 8], [i32; 8]) {
        unsafe {
            let f = &*self.as_ptr();
            let mut data = [std::ptr::null(); 8];
            let mut linesize = [0i32; 8];
            for i in 0..8 {
                data[i] = f.data[i];
                linesize[i] = f.linesize[i];
            }
            (data, linesize)
        }
    }

    fn unref(&mut self) {
        unsafe { ffi::av_frame_unref(self.as_ptr()) };
    }
}

impl Drop for AvFrame {
    fn drop(&mut self) {
        let mut ptr = self.ptr.as_ptr();
        unsafe { ffi::av_frame_free(&mut ptr) };
    }
}

struct SwsConverter {
    ptr: NonNull<ffi::SwsContext>,
    height: i32,
}

impl SwsConverter {
    fn new(src_format: ffi::AVPixelFormat, width: i32, height: i32) -> Result<Self, ClipBatchError> {
        let raw = unsafe {
            ffi::sws_getContext(
                width,
                height,
                src_format,
                width,
                height,
                ffi::AVPixelFormat::AV_PIX_FMT_RGB24,
                ffi::SWS_BILINEAR as i32,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null(),
            )
        };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| ClipBatchError::media(0, "sws_getContext failed", "decode::sws_new"))?;
        Ok(Self { ptr, height })
    }

    /// Converts one source frame straight into the tensor row `dst` points
    /// at, at the tensor's own `dst_linesize` — skipping an intermediate
    /// packed copy.
    fn scale_into(&mut self, frame: &AvFrame, dst: *mut u8, dst_linesize: usize) {
        let (src_data, src_linesize) = frame.data_and_linesize();
        let dst_slices: [*mut u8; 8] = [
            dst,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        ];
        let dst_linesizes: [i32; 8] = [dst_linesize as i32, 0, 0, 0, 0, 0, 0, 0];
        unsafe {
            ffi::sws_scale(
                self.ptr.as_ptr(),
                src_data.as_ptr(),
                src_linesize.as_ptr(),
                0,
                self.height,
                dst_slices.as_ptr(),
                dst_linesizes.as_ptr(),
            );
        }
    }
}

impl Drop for SwsConverter {
    fn drop(&mut self) {
        unsafe { ffi::sws_freeContext(self.ptr.as_ptr()) };
    }
}

struct BatchBuilder<'a> {
    pool: &'a BufferPool,
    total_slots: usize,
    sws: Option<SwsConverter>,
    tensor: Option<TensorBuffer>,
    filled: usize,
}

impl<'a> BatchBuilder<'a> {
    fn new(pool: &'a BufferPool, total_slots: usize) -> Self {
        Self { pool, total_slots, sws: None, tensor: None, filled: 0 }
    }

    fn write(&mut self, frame: &AvFrame, slots: &[usize]) -> Result<(), ClipBatchError> {
        if self.sws.is_none() {
            self.sws = Some(SwsConverter::new(frame.pixel_format(), frame.width(), frame.height())?);
        }
        if self.tensor.is_none() {
            let shape = Shape::new(self.total_slots, frame.width() as usize, frame.height() as usize);
            self.tensor = Some(self.pool.get(shape, default_linesize(shape)));
        }
        let buf = self.tensor.as_mut().unwrap();
        let converter = self.sws.as_mut().unwrap();
        let linesize = buf.linesize;
        for &slot in slots {
            let row_ptr = buf.frame_row_mut(slot, 0).as_mut_ptr();
            converter.scale_into(frame, row_ptr, linesize);
        }
        self.filled += slots.len();
        Ok(())
    }

    fn finish(self) -> Result<TensorBuffer, ClipBatchError> {
        if self.filled != self.total_slots {
            return Err(ClipBatchError::logic(format!(
                "decode pipeline filled {} of {} requested output slots",
                self.filled, self.total_slots
            )));
        }
        self.tensor
            .ok_or_else(|| ClipBatchError::logic("decode pipeline produced no frames for a non-empty request"))
    }
}

/// Runs `entries` against `demux`'s video stream and fills a tensor with one
/// RGB24 frame per output slot. `total_slots` is the number of entries in
/// the caller's original (possibly duplicate-containing) request list.
///
/// Each entry is its own bounded run: seek once to the entry's key frame,
/// read forward only until that entry's own `wanted` set has drained,
/// marking every other packet `AV_PKT_FLAG_DISCARD` so the decoder isn't
/// asked to surface frames nobody wants. The decoder is flushed before each
/// re-seek past the first entry so a run's unread tail never bleeds into
/// the next.
pub fn get_batch(
    demux: &mut Demuxer,
    entries: &[ScheduleEntry],
    total_slots: usize,
    pool: &BufferPool,
) -> Result<TensorBuffer, ClipBatchError> {
    if entries.is_empty() {
        let shape = Shape::new(0, 0, 0);
        return Ok(pool.get(shape, 1));
    }

    let mut codec = AvCodecContext::open(demux.codecpar_ptr())?;
    let mut builder = BatchBuilder::new(pool, total_slots);
    let video_stream_index = demux.video_stream_index();

    for (entry_index, entry) in entries.iter().enumerate() {
        if entry_index > 0 {
            codec.flush();
        }
        demux.seek_backward(entry.key_frame_pts)?;

        let mut wanted = entry.wanted.clone();
        while !wanted.is_empty() {
            let Some(mut packet) = demux.read_packet()? else {
                break;
            };
            if packet.stream_index() != video_stream_index {
                packet.unref();
                continue;
            }
            if !wanted.contains_key(&packet.pts()) {
                packet.set_discard();
            }
            codec.send_packet(packet.as_ptr())?;
            packet.unref();

            loop {
                let mut frame = AvFrame::new();
                if !codec.receive_frame(&mut frame)? {
                    break;
                }
                consume_matching(&mut wanted, &frame, &mut builder)?;
                frame.unref();
                if wanted.is_empty() {
                    break;
                }
            }
        }

        if !wanted.is_empty() {
            // Hit genuine EOF before this entry's wanted set drained: flush
            // the decoder's remaining buffered frames.
            codec.send_packet(std::ptr::null_mut())?;
            loop {
                let mut frame = AvFrame::new();
                if !codec.receive_frame(&mut frame)? {
                    break;
                }
                consume_matching(&mut wanted, &frame, &mut builder)?;
                frame.unref();
                if wanted.is_empty() {
                    break;
                }
            }
        }
    }

    builder.finish()
}

/// Removes `frame`'s pts from `wanted` and writes it into the batch if
/// present. A no-op for frames decoded only to keep reference state
/// current (flagged discard, or simply not in `wanted`).
fn consume_matching(
    wanted: &mut BTreeMap<i64, Vec<usize>>,
    frame: &AvFrame,
    builder: &mut BatchBuilder,
) -> Result<(), ClipBatchError> {
    if let Some(slots) = wanted.remove(&frame.pts()) {
        builder.write(frame, &slots)?;
    }
    Ok(())
}
