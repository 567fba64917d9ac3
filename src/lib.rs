// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-flight H.264 to RGB24 decoding.
//!
//! A [`DecoderContext`] owns an H.264 decoder, a streaming access-unit parser, a temporary
//! decoded frame and a lazily allocated conversion pipeline that turns every decoded frame into
//! packed RGB24. Decoding runs on a dedicated worker thread, one task at a time; the outcome of
//! each task is delivered to a registered callback on the thread that drives the context.
//!
//! The decoding library itself is abstracted behind the [`backend::Backend`] trait. The
//! [dummy backend](backend::dummy) is always available and is what the tests run against; an
//! FFmpeg backend is available behind the `ffmpeg` feature.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod image_processing;

use std::fmt::Debug;
use std::str::FromStr;

pub use config::AccessUnitFraming;
pub use config::DecoderConfig;
pub use decoder::DecodeOutcome;
pub use decoder::DecoderContext;
pub use decoder::DecoderEvent;
pub use decoder::Error;
pub use decoder::FrameHandle;
pub use decoder::FrameOutput;
pub use decoder::QueuedDecoder;
pub use decoder::Result;
pub use decoder::TaskError;

/// Number of bytes per pixel of the packed RGB24 output format.
pub const OUTPUT_BYTES_PER_PIXEL: usize = 3;

/// Pixel layouts the software conversion path can read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized decoded format. Valid values: nv12, i420"),
        }
    }
}

/// The (width, height, source pixel format) triple a conversion pipeline is built for.
///
/// `F` is the backend's pixel format type, e.g. [`DecodedFormat`] for the dummy backend or
/// FFmpeg's pixel format for the FFmpeg one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameGeometry<F> {
    pub width: u32,
    pub height: u32,
    pub format: F,
}

impl<F: Copy + Eq + Debug> FrameGeometry<F> {
    pub fn new(width: u32, height: u32, format: F) -> Self {
        Self {
            width,
            height,
            format,
        }
    }
}
