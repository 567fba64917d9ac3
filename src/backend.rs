// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend interfaces.
//!
//! A backend provides the native resources a [`DecoderContext`](crate::DecoderContext) drives:
//! the H.264 decoder, the streaming access-unit parser, the reusable decoded frame, and the
//! pipelines converting decoded frames to packed RGB24.

pub mod dummy;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::fmt::Debug;

use thiserror::Error;

use crate::config::DecoderConfig;
use crate::FrameGeometry;
use crate::OUTPUT_BYTES_PER_PIXEL;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("cannot allocate {0}")]
    OutOfMemory(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of asking a decoder for its next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// A frame has been written into the frame passed to [`VideoDecoder::receive`].
    Ready,
    /// No frame is available until more input is submitted.
    Again,
}

/// Result of feeding data to a [`StreamParser`].
#[derive(Debug, PartialEq, Eq)]
pub struct ParseStep<'a> {
    /// Number of bytes of the input that the parser took.
    pub consumed: usize,
    /// A complete access unit, if one is ready for decoding.
    pub access_unit: Option<&'a [u8]>,
}

/// A frame produced by a [`VideoDecoder`].
pub trait DecodedFrame: Send {
    /// Backend-specific description of the frame's pixel layout.
    type Format: Copy + Eq + Debug + Send;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> Self::Format;

    fn geometry(&self) -> FrameGeometry<Self::Format> {
        FrameGeometry::new(self.width(), self.height(), self.format())
    }
}

/// Splits a byte stream into access units.
pub trait StreamParser: Send {
    fn parse<'a>(&'a mut self, data: &'a [u8]) -> ParseStep<'a>;
}

/// Decodes access units into frames.
pub trait VideoDecoder: Send {
    type Frame: DecodedFrame;

    /// Submits one complete access unit.
    fn send(&mut self, access_unit: &[u8]) -> BackendResult<()>;

    /// Moves the next available frame into `frame`.
    fn receive(&mut self, frame: &mut Self::Frame) -> BackendResult<ReceiveStatus>;
}

/// Converts frames of one geometry into packed RGB24.
pub trait ConversionPipeline: Send {
    type Frame: DecodedFrame;

    /// Converts `src` into `dst`, whose lines are `stride` bytes apart.
    fn convert(&mut self, src: &Self::Frame, dst: &mut [u8], stride: usize) -> BackendResult<()>;
}

pub type FormatOf<B> = <<B as Backend>::Frame as DecodedFrame>::Format;

/// Factory for all the native resources of a decoding context.
pub trait Backend: Send + Sync + 'static {
    type Frame: DecodedFrame;
    type Decoder: VideoDecoder<Frame = Self::Frame>;
    type Parser: StreamParser;
    type Pipeline: ConversionPipeline<Frame = Self::Frame>;

    fn open_decoder(&self, config: &DecoderConfig) -> BackendResult<Self::Decoder>;

    fn open_parser(&self, config: &DecoderConfig) -> BackendResult<Self::Parser>;

    /// Allocates the frame that decoded pictures are received into.
    fn alloc_frame(&self) -> BackendResult<Self::Frame>;

    /// Creates a pipeline converting frames of `geometry` into RGB24 of the same size.
    fn create_pipeline(
        &self,
        geometry: &FrameGeometry<FormatOf<Self>>,
    ) -> BackendResult<Self::Pipeline>;

    /// Stride, in bytes, of RGB24 output lines for frames of `width` pixels.
    fn output_stride(&self, width: u32) -> usize {
        width as usize * OUTPUT_BYTES_PER_PIXEL
    }
}
