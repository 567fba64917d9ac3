// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A front-end that accepts any number of decode requests and feeds them to a
//! [`DecoderContext`] one at a time.

use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::config::DecoderConfig;
use crate::decoder::DecodeOutcome;
use crate::decoder::DecoderContext;
use crate::decoder::Error;
use crate::decoder::FrameOutput;
use crate::decoder::Result;
use crate::decoder::TaskError;

/// What a [`QueuedDecoder`] reports for the requests it processes.
///
/// Requests that decode without producing a frame are not reported.
#[derive(Debug)]
pub enum DecoderEvent {
    Frame(FrameOutput),
    Error(TaskError),
}

struct PendingRange {
    input: Arc<[u8]>,
    offset: usize,
    length: usize,
}

type EventHandler = Box<dyn FnMut(DecoderEvent) + Send>;

/// Serializes decode requests over a [`DecoderContext`].
///
/// Requests are queued in FIFO order. The next one is submitted from the completion path of the
/// previous one, right after its event has been delivered, so events come out in request order.
pub struct QueuedDecoder<B: Backend> {
    context: DecoderContext<B>,
    outcomes: mpsc::Receiver<DecodeOutcome>,
    pending: VecDeque<PendingRange>,
    handler: Option<EventHandler>,
}

impl<B: Backend> QueuedDecoder<B> {
    /// Creates the underlying context and initializes it.
    pub fn new(backend: B, config: DecoderConfig) -> Result<Self> {
        let mut context = DecoderContext::new(backend, config)?;
        context.init()?;

        let (sender, outcomes) = mpsc::channel();
        context.set_callback(move |outcome| {
            let _ = sender.send(outcome);
        })?;

        Ok(Self {
            context,
            outcomes,
            pending: VecDeque::new(),
            handler: None,
        })
    }

    /// Registers the function receiving every [`DecoderEvent`], replacing any previous one.
    pub fn set_event_handler<F>(&mut self, handler: F)
    where
        F: FnMut(DecoderEvent) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Queues the decoding of `input[offset..offset + length]`, and submits it right away if
    /// nothing else is in flight.
    pub fn decode_frames(&mut self, input: Arc<[u8]>, offset: usize, length: usize) -> Result<()> {
        let size = input.len();
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds {
                offset,
                length,
                size,
            });
        }

        if self.context.is_release_pending() {
            return Err(Error::ReleasePending);
        }
        if !self.context.is_initialized() {
            return Err(Error::NotInitialized);
        }

        self.pending.push_back(PendingRange {
            input,
            offset,
            length,
        });
        self.submit_next()
    }

    fn submit_next(&mut self) -> Result<()> {
        if self.context.is_busy() {
            return Ok(());
        }

        if !self.context.is_initialized() {
            if !self.pending.is_empty() {
                log::warn!(
                    "decoder context released, dropping {} queued requests",
                    self.pending.len()
                );
                self.pending.clear();
            }
            return Ok(());
        }

        match self.pending.pop_front() {
            Some(range) => self
                .context
                .decode_frames(range.input, range.offset, range.length),
            None => Ok(()),
        }
    }

    /// Delivers the event of the request that just completed, if any, then submits the next one.
    fn forward_outcome(&mut self) -> Result<()> {
        let event = match self.outcomes.try_recv() {
            Ok(DecodeOutcome::Frame(frame)) => Some(DecoderEvent::Frame(frame)),
            Ok(DecodeOutcome::Failed(err)) => Some(DecoderEvent::Error(err)),
            Ok(DecodeOutcome::Consumed) | Err(_) => None,
        };

        if let Some(event) = event {
            match self.handler.as_mut() {
                Some(handler) => handler(event),
                None => log::warn!("no event handler registered, dropping {:?}", event),
            }
        }

        self.submit_next()
    }

    /// Handles the completion of the running request without blocking.
    ///
    /// Returns whether a request completed.
    pub fn dispatch_completion(&mut self) -> Result<bool> {
        if !self.context.dispatch_completion()? {
            return Ok(false);
        }

        self.forward_outcome()?;
        Ok(true)
    }

    /// Waits for the running request to complete, for at most `timeout` if given.
    ///
    /// Returns whether a request completed.
    pub fn wait_for_completion(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if !self.context.wait_for_completion(timeout)? {
            return Ok(false);
        }

        self.forward_outcome()?;
        Ok(true)
    }

    /// Processes every queued request. `timeout` bounds the wait for each of them.
    ///
    /// Returns `false` if a request did not complete in time.
    pub fn flush(&mut self, timeout: Option<Duration>) -> Result<bool> {
        while self.context.is_busy() {
            if !self.wait_for_completion(timeout)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Drops the queued requests and releases the context. A running request still completes and
    /// reports its event.
    pub fn release(&mut self) {
        self.pending.clear();
        self.context.release();
    }

    /// Initializes the context again after a [`QueuedDecoder::release`].
    pub fn init(&mut self) -> Result<()> {
        self.context.init()
    }

    /// Number of requests waiting behind the running one.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_busy(&self) -> bool {
        self.context.is_busy()
    }

    /// File descriptor that becomes readable when a request has completed and
    /// [`QueuedDecoder::dispatch_completion`] should be called.
    pub fn completion_fd(&self) -> BorrowedFd<'_> {
        self.context.completion_fd()
    }
}
