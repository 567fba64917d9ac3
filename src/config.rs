// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::str::FromStr;

/// Decides when the parser considers an access unit complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessUnitFraming {
    /// The end of every input range terminates the pending access unit. Suited to callers that
    /// submit whole access units (or whole pictures) per call.
    ChunkBoundary,
    /// An access unit is only complete once the first NAL unit of the next one is seen, or at an
    /// end of sequence/stream NAL unit. Output therefore lags input by one access unit.
    NextAccessUnit,
}

impl Default for AccessUnitFraming {
    fn default() -> Self {
        Self::ChunkBoundary
    }
}

impl FromStr for AccessUnitFraming {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" | "chunk-boundary" => Ok(AccessUnitFraming::ChunkBoundary),
            "next" | "next-access-unit" => Ok(AccessUnitFraming::NextAccessUnit),
            _ => Err("unrecognized framing. Valid values: chunk, next"),
        }
    }
}

/// Options used when a [`DecoderContext`](crate::DecoderContext) allocates its resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub framing: AccessUnitFraming,
    /// Output frames as soon as they are decoded instead of waiting for reordering.
    pub low_delay: bool,
    /// Allow speedup tricks that are not standard compliant.
    pub fast_decode: bool,
    /// Number of threads the decoder may use internally. `None` lets the backend decide.
    pub thread_count: Option<usize>,
    /// Name given to the decode worker thread.
    pub worker_name: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            framing: Default::default(),
            low_delay: true,
            fast_decode: true,
            thread_count: None,
            worker_name: String::from("h264-decode"),
        }
    }
}
