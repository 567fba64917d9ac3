// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The thread decode tasks run on, and the handoff of their reports back to the context.

use std::any::Any;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::Backend;
use crate::decoder::task::DecodeTask;
use crate::decoder::task::TaskReport;
use crate::decoder::Error;
use crate::decoder::Result;

/// How a task submitted to the worker ended.
pub(crate) enum Completion<B: Backend> {
    Finished(TaskReport<B>),
    /// The task panicked. Its resources and input were dropped while unwinding.
    Panicked,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

pub(crate) struct Worker<B: Backend> {
    jobs: Option<mpsc::Sender<DecodeTask<B>>>,
    reports: mpsc::Receiver<Completion<B>>,
    /// Counts reports not yet taken. Signalled before the matching report is sent.
    completion_event: Arc<EventFd>,
    thread: Option<JoinHandle<()>>,
}

impl<B: Backend> Worker<B> {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let completion_event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)
                .map_err(Error::CompletionEvent)?,
        );

        let (jobs, job_queue) = mpsc::channel::<DecodeTask<B>>();
        let (report_sink, reports) = mpsc::channel();
        let event = Arc::clone(&completion_event);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = job_queue.recv() {
                    let report = match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
                        Ok(report) => Completion::Finished(report),
                        Err(payload) => {
                            log::error!("decode task panicked: {}", panic_message(&*payload));
                            Completion::Panicked
                        }
                    };

                    if let Err(e) = event.write(1) {
                        log::warn!("cannot signal task completion: {}", e);
                    }
                    if report_sink.send(report).is_err() {
                        break;
                    }
                }
                log::debug!("decode worker exiting");
            })
            .map_err(Error::Spawn)?;

        Ok(Self {
            jobs: Some(jobs),
            reports,
            completion_event,
            thread: Some(thread),
        })
    }

    /// Queues `task`, handing it back if the worker is gone.
    pub(crate) fn submit(&self, task: DecodeTask<B>) -> std::result::Result<(), DecodeTask<B>> {
        match &self.jobs {
            Some(jobs) => jobs.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Takes the completion of the finished task, if there is one.
    pub(crate) fn try_take(&self) -> Result<Option<Completion<B>>> {
        match self.reports.try_recv() {
            Ok(report) => {
                self.consume_event();
                Ok(Some(report))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::WorkerGone),
        }
    }

    /// Blocks until a task finishes or `timeout` expires.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Option<Completion<B>>> {
        let report = match timeout {
            None => self.reports.recv().map_err(|_| Error::WorkerGone)?,
            Some(timeout) => match self.reports.recv_timeout(timeout) {
                Ok(report) => report,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::WorkerGone),
            },
        };

        self.consume_event();
        Ok(Some(report))
    }

    fn consume_event(&self) {
        if let Err(e) = self.completion_event.read() {
            log::warn!("completion event out of sync with reports: {}", e);
        }
    }

    pub(crate) fn completion_fd(&self) -> BorrowedFd<'_> {
        self.completion_event.as_fd()
    }
}

impl<B: Backend> Drop for Worker<B> {
    fn drop(&mut self) {
        // Closing the queue stops the thread once the running task, if any, is done.
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("decode worker panicked");
            }
        }
    }
}
