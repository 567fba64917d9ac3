// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoding context: resource lifecycle and task sequencing.
//!
//! A [`DecoderContext`] is in one of three states:
//!
//! * released: no native resource is allocated. [`DecoderContext::init`] moves it to idle.
//! * idle: the decoder, parser, temporary frame and conversion cache are owned by the context.
//!   [`DecoderContext::decode_frames`] moves them into a task and the context becomes busy.
//! * busy: a task is running on the worker thread. [`DecoderContext::release`] only marks the
//!   release as pending. When the task completes the resources come back, any pending release is
//!   performed, and then the outcome is delivered to the callback.
//!
//! A task whose backend panics loses the resources it owned. The context then falls back to
//! released and reports [`TaskError::Panicked`]; it can be initialized again.
//!
//! Completion is a two-phase handoff: the worker produces a report, and the report is applied on
//! the thread calling [`DecoderContext::dispatch_completion`] or
//! [`DecoderContext::wait_for_completion`]. The callback only ever runs there.
//!
//! [`QueuedDecoder`] sits on top of a context for callers that want to submit many ranges
//! without waiting for each of them.

mod conversion;
mod queue;
mod task;
mod worker;

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::config::DecoderConfig;
use crate::decoder::conversion::ConversionCache;
use crate::decoder::task::DecodeTask;
use crate::decoder::task::TaskOutcome;
use crate::decoder::task::TaskReport;
use crate::decoder::worker::Completion;
use crate::decoder::worker::Worker;

pub use conversion::FrameHandle;
pub use conversion::HandleError;
pub use queue::DecoderEvent;
pub use queue::QueuedDecoder;
pub use task::TaskError;

pub type Result<T> = std::result::Result<T, Error>;

/// Allocation failures of [`DecoderContext::init`]. The context is left released.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot open H.264 decoder: {0}")]
    Decoder(#[source] BackendError),
    #[error("cannot open H.264 parser: {0}")]
    Parser(#[source] BackendError),
    #[error("cannot allocate temporary frame: {0}")]
    TempFrame(#[source] BackendError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("the decoder context is not initialized")]
    NotInitialized,
    #[error("a decode task is already running")]
    Busy,
    #[error("the decoder context is being released")]
    ReleasePending,
    #[error("range {offset}+{length} is out of bounds of a {size} bytes buffer")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error(transparent)]
    Init(#[from] InitError),
    #[error("cannot spawn decode worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("cannot create completion event: {0}")]
    CompletionEvent(#[source] nix::Error),
    #[error("the decode worker has stopped")]
    WorkerGone,
}

/// A successfully decoded and converted frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// Handle to the RGB24 output frame. The same handle is delivered for as long as the frame
    /// geometry does not change.
    pub handle: FrameHandle,
    pub width: u32,
    pub height: u32,
}

/// What the callback receives once per call to [`DecoderContext::decode_frames`].
#[derive(Debug)]
pub enum DecodeOutcome {
    /// The input decoded into at least one frame, the last of which is in the output frame.
    Frame(FrameOutput),
    /// The input was consumed but produced no frame. More input can be submitted.
    Consumed,
    /// The task failed. The context remains usable.
    Failed(TaskError),
}

/// Native resources of an initialized context.
pub(crate) struct Resources<B: Backend> {
    pub(crate) decoder: B::Decoder,
    pub(crate) parser: B::Parser,
    pub(crate) frame: B::Frame,
    pub(crate) cache: ConversionCache<B>,
}

impl<B: Backend> Resources<B> {
    /// Allocates the decoder, the parser and the temporary frame, in that order. Whatever was
    /// allocated before a failure is freed on return.
    fn alloc(backend: &Arc<B>, config: &DecoderConfig) -> std::result::Result<Self, InitError> {
        let decoder = backend.open_decoder(config).map_err(|e| {
            log::error!("cannot open H.264 decoder: {}", e);
            InitError::Decoder(e)
        })?;

        let parser = backend.open_parser(config).map_err(|e| {
            log::error!("cannot open H.264 parser: {}", e);
            InitError::Parser(e)
        })?;

        let frame = backend.alloc_frame().map_err(|e| {
            log::error!("cannot allocate temporary frame: {}", e);
            InitError::TempFrame(e)
        })?;

        Ok(Self {
            decoder,
            parser,
            frame,
            cache: ConversionCache::new(Arc::clone(backend)),
        })
    }

    fn free(self) {
        let Resources {
            decoder,
            parser,
            frame,
            mut cache,
        } = self;

        drop(decoder);
        drop(parser);
        drop(frame);
        cache.teardown();
    }
}

enum ContextState<B: Backend> {
    Released,
    Idle(Resources<B>),
    /// The resources are owned by the running task.
    Busy {
        release_pending: bool,
    },
}

type Callback = Box<dyn FnMut(DecodeOutcome) + Send>;

/// Single-flight H.264 to RGB24 decoding context.
pub struct DecoderContext<B: Backend> {
    backend: Arc<B>,
    config: DecoderConfig,
    state: ContextState<B>,
    callback: Option<Callback>,
    /// Handle last delivered to the callback.
    output_handle: Option<FrameHandle>,
    worker: Worker<B>,
}

impl<B: Backend> DecoderContext<B> {
    /// Creates a released context and its worker thread.
    pub fn new(backend: B, config: DecoderConfig) -> Result<Self> {
        let worker = Worker::spawn(&config.worker_name)?;

        Ok(Self {
            backend: Arc::new(backend),
            config,
            state: ContextState::Released,
            callback: None,
            output_handle: None,
            worker,
        })
    }

    /// Allocates the native resources. Does nothing if the context is already initialized.
    pub fn init(&mut self) -> Result<()> {
        match self.state {
            ContextState::Released => (),
            ContextState::Idle(_) | ContextState::Busy { release_pending: false } => return Ok(()),
            ContextState::Busy { release_pending: true } => return Err(Error::ReleasePending),
        }

        let resources = Resources::alloc(&self.backend, &self.config)?;
        self.state = ContextState::Idle(resources);
        log::debug!("decoder context initialized");

        Ok(())
    }

    /// Frees the native resources, or schedules their release for when the running task
    /// completes. Calling it on a released context does nothing.
    pub fn release(&mut self) {
        match self.state {
            ContextState::Released => (),
            ContextState::Idle(_) => self.release_now(),
            ContextState::Busy {
                ref mut release_pending,
            } => {
                if !*release_pending {
                    log::debug!("release deferred until the running task completes");
                }
                *release_pending = true;
            }
        }
    }

    fn release_now(&mut self) {
        if let ContextState::Idle(resources) =
            std::mem::replace(&mut self.state, ContextState::Released)
        {
            resources.free();
            log::debug!("decoder context released");
        }
        self.output_handle = None;
    }

    /// Registers the function receiving the outcome of every decode task, replacing any previous
    /// one. Not allowed while a task is running.
    pub fn set_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(DecodeOutcome) + Send + 'static,
    {
        match self.state {
            ContextState::Busy {
                release_pending: true,
            } => Err(Error::ReleasePending),
            ContextState::Busy { .. } => Err(Error::Busy),
            ContextState::Released | ContextState::Idle(_) => {
                self.callback = Some(Box::new(callback));
                Ok(())
            }
        }
    }

    /// Starts decoding `input[offset..offset + length]` on the worker thread.
    ///
    /// `input` is kept alive until the task completes. Exactly one outcome is delivered to the
    /// callback for every call returning `Ok`.
    pub fn decode_frames(&mut self, input: Arc<[u8]>, offset: usize, length: usize) -> Result<()> {
        match self.state {
            ContextState::Released => return Err(Error::NotInitialized),
            ContextState::Busy {
                release_pending: true,
            } => return Err(Error::ReleasePending),
            ContextState::Busy { .. } => return Err(Error::Busy),
            ContextState::Idle(_) => (),
        }

        let size = input.len();
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds {
                offset,
                length,
                size,
            });
        }

        let resources = match std::mem::replace(
            &mut self.state,
            ContextState::Busy {
                release_pending: false,
            },
        ) {
            ContextState::Idle(resources) => resources,
            other => {
                self.state = other;
                return Err(Error::NotInitialized);
            }
        };

        if let Err(task) = self
            .worker
            .submit(DecodeTask::new(resources, input, offset, length))
        {
            self.state = ContextState::Idle(task.into_resources());
            return Err(Error::WorkerGone);
        }
        log::debug!("decode task submitted for {} bytes at offset {}", length, offset);

        Ok(())
    }

    /// Applies the report of the finished task, if any, without blocking.
    ///
    /// Returns whether an outcome was delivered.
    pub fn dispatch_completion(&mut self) -> Result<bool> {
        if !self.is_busy() {
            return Ok(false);
        }

        match self.worker.try_take()? {
            Some(completion) => {
                self.complete(completion);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Waits for the running task to finish, for at most `timeout` if given, and applies its
    /// report.
    ///
    /// Returns whether an outcome was delivered. Returns `Ok(false)` immediately if no task is
    /// running.
    pub fn wait_for_completion(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if !self.is_busy() {
            return Ok(false);
        }

        match self.worker.wait(timeout)? {
            Some(completion) => {
                self.complete(completion);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn complete(&mut self, completion: Completion<B>) {
        let outcome = match completion {
            Completion::Finished(report) => self.finish(report),
            Completion::Panicked => {
                // The resources went down with the task.
                self.state = ContextState::Released;
                self.output_handle = None;
                log::error!("decode task panicked, decoder context released");
                DecodeOutcome::Failed(TaskError::Panicked)
            }
        };

        match self.callback.as_mut() {
            Some(callback) => callback(outcome),
            None => log::warn!("no callback registered, dropping outcome {:?}", outcome),
        }
    }

    /// Takes back the resources of a finished task, performs any pending release and maps the
    /// task's outcome.
    fn finish(&mut self, report: TaskReport<B>) -> DecodeOutcome {
        let TaskReport {
            resources,
            input,
            outcome,
        } = report;
        drop(input);

        let release_pending = matches!(
            self.state,
            ContextState::Busy {
                release_pending: true
            }
        );
        self.state = ContextState::Idle(resources);
        if release_pending {
            self.release_now();
        }

        match outcome {
            Ok(TaskOutcome::Decoded { width, height }) => self.frame_output(width, height),
            Ok(TaskOutcome::NeedsInput) => DecodeOutcome::Consumed,
            Err(e) => {
                log::debug!("decode task failed: {}", e);
                DecodeOutcome::Failed(e)
            }
        }
    }

    /// Builds the outcome of a task that decoded a `width`x`height` frame, refreshing the
    /// delivered handle if the output frame has been reallocated.
    fn frame_output(&mut self, width: u32, height: u32) -> DecodeOutcome {
        // Released while the task ran: the pixels are gone.
        let ContextState::Idle(resources) = &mut self.state else {
            return DecodeOutcome::Consumed;
        };

        if let Some(handle) = resources.cache.take_fresh_handle() {
            log::debug!("output handle refreshed for {}x{}", width, height);
            self.output_handle = Some(handle);
        }

        match &self.output_handle {
            Some(handle) => DecodeOutcome::Frame(FrameOutput {
                handle: handle.clone(),
                width,
                height,
            }),
            None => DecodeOutcome::Consumed,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, ContextState::Released)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, ContextState::Busy { .. })
    }

    pub fn is_release_pending(&self) -> bool {
        matches!(
            self.state,
            ContextState::Busy {
                release_pending: true
            }
        )
    }

    /// File descriptor that becomes readable when a task has completed and
    /// [`DecoderContext::dispatch_completion`] should be called.
    pub fn completion_fd(&self) -> BorrowedFd<'_> {
        self.worker.completion_fd()
    }
}

impl<B: Backend> Drop for DecoderContext<B> {
    fn drop(&mut self) {
        // A running task keeps its resources until the worker is joined, after which they are
        // dropped along with its unread report.
        self.release();
    }
}
