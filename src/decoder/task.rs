// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One decode operation over one input range.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::DecodedFrame;
use crate::backend::ReceiveStatus;
use crate::backend::StreamParser;
use crate::backend::VideoDecoder;
use crate::decoder::conversion::ConversionCache;
use crate::decoder::Resources;

/// Why a decode task failed. The context stays usable after any of these, although it needs
/// to be initialized again after [`TaskError::Panicked`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to decode frame: incomplete frame ({remaining} bytes could not be parsed)")]
    ParseIncomplete { remaining: usize },
    #[error("failed to decode frame: {0}")]
    SubmitFailed(#[source] BackendError),
    #[error("failed to decode frame: {0}")]
    DrainFailed(#[source] BackendError),
    #[error("failed to decode frame: cannot set up {width}x{height} output frame: {source}")]
    ConversionSetupFailed {
        width: u32,
        height: u32,
        #[source]
        source: BackendError,
    },
    #[error("failed to decode frame: conversion failed: {0}")]
    ConversionFailed(#[source] BackendError),
    /// The backend panicked. The context has lost its resources and is released.
    #[error("failed to decode frame: the decoder panicked")]
    Panicked,
}

/// Successful end of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    /// At least one frame was decoded; the output frame holds the last one.
    Decoded { width: u32, height: u32 },
    /// All the input was taken but no frame came out of it yet.
    NeedsInput,
}

/// What a finished task hands back to its context.
pub(crate) struct TaskReport<B: Backend> {
    pub(crate) resources: Resources<B>,
    pub(crate) input: Arc<[u8]>,
    pub(crate) outcome: Result<TaskOutcome, TaskError>,
}

/// Parses, decodes and converts `input[offset..offset + length]`.
///
/// The task owns the context's resources and the input for as long as it runs, and returns
/// both in its [`TaskReport`].
pub(crate) struct DecodeTask<B: Backend> {
    resources: Resources<B>,
    input: Arc<[u8]>,
    offset: usize,
    length: usize,
}

impl<B: Backend> DecodeTask<B> {
    /// `offset` and `length` must describe a range within `input`.
    pub(crate) fn new(
        resources: Resources<B>,
        input: Arc<[u8]>,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            resources,
            input,
            offset,
            length,
        }
    }

    /// Gives back the resources of a task that never ran.
    pub(crate) fn into_resources(self) -> Resources<B> {
        self.resources
    }

    pub(crate) fn execute(self) -> TaskReport<B> {
        let DecodeTask {
            mut resources,
            input,
            offset,
            length,
        } = self;

        let range = offset.checked_add(length).and_then(|end| input.get(offset..end));
        let outcome = match range {
            Some(data) => run(&mut resources, data),
            None => Err(TaskError::ParseIncomplete { remaining: length }),
        };

        TaskReport {
            resources,
            input,
            outcome,
        }
    }
}

fn run<B: Backend>(resources: &mut Resources<B>, data: &[u8]) -> Result<TaskOutcome, TaskError> {
    let Resources {
        decoder,
        parser,
        frame,
        cache,
    } = resources;

    let mut cursor = 0;
    let mut decoded = None;

    while cursor < data.len() {
        let step = parser.parse(&data[cursor..]);
        cursor += step.consumed.min(data.len() - cursor);

        match step.access_unit {
            Some(access_unit) => {
                decoder.send(access_unit).map_err(TaskError::SubmitFailed)?;

                // A later access unit without output does not hide an earlier frame.
                if let Some(size) = drain(decoder, frame, cache)? {
                    decoded = Some(size);
                }
            }
            None if cursor < data.len() => {
                return Err(TaskError::ParseIncomplete {
                    remaining: data.len() - cursor,
                });
            }
            None => (),
        }
    }

    Ok(match decoded {
        Some((width, height)) => TaskOutcome::Decoded { width, height },
        None => TaskOutcome::NeedsInput,
    })
}

/// Converts every frame the decoder has ready. Each conversion overwrites the previous one, so
/// only the last frame survives. Returns the size of that frame, if any.
fn drain<B: Backend>(
    decoder: &mut B::Decoder,
    frame: &mut B::Frame,
    cache: &mut ConversionCache<B>,
) -> Result<Option<(u32, u32)>, TaskError> {
    let mut last = None;

    loop {
        match decoder.receive(frame).map_err(TaskError::DrainFailed)? {
            ReceiveStatus::Again => break,
            ReceiveStatus::Ready => {
                let geometry = frame.geometry();
                cache.ensure_output_frame(geometry).map_err(|source| {
                    log::error!("cannot set up output frame for {:?}: {}", geometry, source);
                    TaskError::ConversionSetupFailed {
                        width: geometry.width,
                        height: geometry.height,
                        source,
                    }
                })?;
                cache.convert(frame).map_err(TaskError::ConversionFailed)?;
                last = Some((geometry.width, geometry.height));
            }
        }
    }

    Ok(last)
}
