// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend running on libavcodec, libavcodec's H.264 parser and libswscale.

use std::os::raw::c_int;
use std::ptr;
use std::ptr::NonNull;

use anyhow::anyhow;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::error::Error as FfmpegError;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use ffmpeg_next::packet::Packet;
use ffmpeg_next::software::scaling::context::Context as ScalingContext;
use ffmpeg_next::software::scaling::flag::Flags as ScalingFlags;
use ffmpeg_next::util::error::EAGAIN;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::ConversionPipeline;
use crate::backend::DecodedFrame;
use crate::backend::ParseStep;
use crate::backend::ReceiveStatus;
use crate::backend::StreamParser;
use crate::backend::VideoDecoder;
use crate::config::AccessUnitFraming;
use crate::config::DecoderConfig;
use crate::FrameGeometry;
use crate::OUTPUT_BYTES_PER_PIXEL;

fn is_again(err: &FfmpegError) -> bool {
    matches!(err, FfmpegError::Other { errno } if *errno == EAGAIN)
}

/// A decoded frame as allocated by `av_frame_alloc`.
pub struct FfmpegFrame(frame::Video);

// SAFETY: the frame is only ever accessed by the thread currently owning it.
unsafe impl Send for FfmpegFrame {}

impl DecodedFrame for FfmpegFrame {
    type Format = Pixel;

    fn width(&self) -> u32 {
        self.0.width()
    }

    fn height(&self) -> u32 {
        self.0.height()
    }

    fn format(&self) -> Pixel {
        self.0.format()
    }
}

pub struct FfmpegDecoder(ffmpeg::decoder::Video);

// SAFETY: the codec context is only ever accessed by the thread currently owning it.
unsafe impl Send for FfmpegDecoder {}

impl VideoDecoder for FfmpegDecoder {
    type Frame = FfmpegFrame;

    fn send(&mut self, access_unit: &[u8]) -> BackendResult<()> {
        self.0
            .send_packet(&Packet::copy(access_unit))
            .map_err(|e| anyhow!("avcodec_send_packet: {}", e).into())
    }

    fn receive(&mut self, frame: &mut FfmpegFrame) -> BackendResult<ReceiveStatus> {
        match self.0.receive_frame(&mut frame.0) {
            Ok(()) => Ok(ReceiveStatus::Ready),
            Err(e) if is_again(&e) => Ok(ReceiveStatus::Again),
            Err(FfmpegError::Eof) => Ok(ReceiveStatus::Again),
            Err(e) => Err(anyhow!("avcodec_receive_frame: {}", e).into()),
        }
    }
}

/// libavcodec's H.264 parser along with the codec context it reports stream parameters into.
pub struct FfmpegParser {
    parser: NonNull<ffi::AVCodecParserContext>,
    context: codec::Context,
    /// Copy of the input followed by the zeroed padding the parser may read past the end.
    scratch: Vec<u8>,
}

// SAFETY: the parser is only ever accessed by the thread currently owning it.
unsafe impl Send for FfmpegParser {}

impl StreamParser for FfmpegParser {
    fn parse<'a>(&'a mut self, data: &'a [u8]) -> ParseStep<'a> {
        let padding = ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let len = data.len().min(c_int::MAX as usize - padding);

        self.scratch.clear();
        self.scratch.extend_from_slice(&data[..len]);
        self.scratch.resize(len + padding, 0);

        let mut out: *mut u8 = ptr::null_mut();
        let mut out_size: c_int = 0;

        // SAFETY: `scratch` holds `len` valid bytes followed by the required padding, and the
        // output pointer refers to memory owned by the parser or by `scratch`, both of which
        // outlive the returned borrow of `self`.
        let ret = unsafe {
            ffi::av_parser_parse2(
                self.parser.as_ptr(),
                self.context.as_mut_ptr(),
                &mut out,
                &mut out_size,
                self.scratch.as_ptr(),
                len as c_int,
                ffi::AV_NOPTS_VALUE,
                ffi::AV_NOPTS_VALUE,
                0,
            )
        };

        let consumed = usize::try_from(ret).unwrap_or(0);
        let access_unit = if out.is_null() || out_size <= 0 {
            None
        } else {
            // SAFETY: see above.
            Some(unsafe { std::slice::from_raw_parts(out, out_size as usize) })
        };

        ParseStep {
            consumed,
            access_unit,
        }
    }
}

impl Drop for FfmpegParser {
    fn drop(&mut self) {
        // SAFETY: `parser` was returned by `av_parser_init` and is closed only here.
        unsafe { ffi::av_parser_close(self.parser.as_ptr()) }
    }
}

/// A swscale context converting one geometry to RGB24.
pub struct FfmpegPipeline {
    scaler: ScalingContext,
    geometry: FrameGeometry<Pixel>,
}

// SAFETY: the scaling context is only ever accessed by the thread currently owning it.
unsafe impl Send for FfmpegPipeline {}

impl ConversionPipeline for FfmpegPipeline {
    type Frame = FfmpegFrame;

    fn convert(&mut self, src: &FfmpegFrame, dst: &mut [u8], stride: usize) -> BackendResult<()> {
        if src.geometry() != self.geometry {
            return Err(BackendError::Unsupported(format!(
                "pipeline built for {:?} cannot convert {:?}",
                self.geometry,
                src.geometry()
            )));
        }

        let height = self.geometry.height as usize;
        let line_size = self.geometry.width as usize * OUTPUT_BYTES_PER_PIXEL;
        if height == 0
            || stride < line_size
            || stride > c_int::MAX as usize
            || dst.len() < stride * (height - 1) + line_size
        {
            return Err(anyhow!(
                "output buffer of {} bytes with stride {} is too small for {:?}",
                dst.len(),
                stride,
                self.geometry
            )
            .into());
        }

        let dst_data = [dst.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
        let dst_linesize = [stride as c_int, 0, 0, 0];

        // SAFETY: the source frame matches the geometry the context was created for, and `dst`
        // was checked to hold `height` lines of `stride` bytes.
        let ret = unsafe {
            let src = src.0.as_ptr();
            ffi::sws_scale(
                self.scaler.as_mut_ptr(),
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                height as c_int,
                dst_data.as_ptr(),
                dst_linesize.as_ptr(),
            )
        };

        if ret < 0 {
            return Err(anyhow!("sws_scale: {}", FfmpegError::from(ret)).into());
        }

        Ok(())
    }
}

/// Backend using the system's FFmpeg libraries.
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> BackendResult<Self> {
        ffmpeg::init().map_err(|e| anyhow!("cannot initialize ffmpeg: {}", e))?;
        Ok(Self)
    }

    /// A codec context bound to the H.264 decoder, not opened yet.
    fn h264_context() -> BackendResult<codec::Context> {
        let codec = codec::decoder::find(codec::Id::H264)
            .ok_or_else(|| BackendError::Unsupported(String::from("no H.264 decoder available")))?;

        Ok(codec::Context::new_with_codec(codec))
    }
}

impl Backend for FfmpegBackend {
    type Frame = FfmpegFrame;
    type Decoder = FfmpegDecoder;
    type Parser = FfmpegParser;
    type Pipeline = FfmpegPipeline;

    fn open_decoder(&self, config: &DecoderConfig) -> BackendResult<FfmpegDecoder> {
        let mut context = Self::h264_context()?;

        // Applied before the codec is opened, which is when libavcodec reads them.
        if config.low_delay {
            context.set_flags(codec::Flags::LOW_DELAY);
        }
        if config.fast_decode {
            // SAFETY: the context is valid and not opened yet.
            unsafe {
                (*context.as_mut_ptr()).flags2 |= ffi::AV_CODEC_FLAG2_FAST as c_int;
            }
        }
        if let Some(count) = config.thread_count {
            context.set_threading(codec::threading::Config {
                // Frame threading would delay output by one frame per thread.
                kind: codec::threading::Type::Slice,
                count,
                ..Default::default()
            });
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| anyhow!("avcodec_open2: {}", e))?;

        Ok(FfmpegDecoder(decoder))
    }

    fn open_parser(&self, config: &DecoderConfig) -> BackendResult<FfmpegParser> {
        let context = Self::h264_context()?;

        // SAFETY: plain constructor call.
        let parser = unsafe { ffi::av_parser_init(ffi::AVCodecID::AV_CODEC_ID_H264 as c_int) };
        let parser = NonNull::new(parser).ok_or(BackendError::OutOfMemory("parser"))?;

        if config.framing == AccessUnitFraming::ChunkBoundary {
            // SAFETY: `parser` is a valid parser context.
            unsafe {
                (*parser.as_ptr()).flags |= ffi::PARSER_FLAG_COMPLETE_FRAMES as c_int;
            }
        }

        Ok(FfmpegParser {
            parser,
            context,
            scratch: Vec::new(),
        })
    }

    fn alloc_frame(&self) -> BackendResult<FfmpegFrame> {
        let frame = frame::Video::empty();
        // SAFETY: only checks the pointer returned by `av_frame_alloc`.
        if unsafe { frame.as_ptr().is_null() } {
            return Err(BackendError::OutOfMemory("frame"));
        }

        Ok(FfmpegFrame(frame))
    }

    fn create_pipeline(&self, geometry: &FrameGeometry<Pixel>) -> BackendResult<FfmpegPipeline> {
        let scaler = ScalingContext::get(
            geometry.format,
            geometry.width,
            geometry.height,
            Pixel::RGB24,
            geometry.width,
            geometry.height,
            ScalingFlags::POINT,
        )
        .map_err(|e| anyhow!("sws_getContext for {:?}: {}", geometry, e))?;

        Ok(FfmpegPipeline {
            scaler,
            geometry: *geometry,
        })
    }
}
