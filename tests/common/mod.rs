// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use h264_rgb_decoder::backend::dummy::DummyBackend;
use h264_rgb_decoder::backend::dummy::DummyOptions;
use h264_rgb_decoder::backend::dummy::Faults;
use h264_rgb_decoder::backend::dummy::ResourceCounters;
use h264_rgb_decoder::DecodeOutcome;
use h264_rgb_decoder::DecoderConfig;
use h264_rgb_decoder::DecoderContext;
use h264_rgb_decoder::FrameOutput;

/// Upper bound for any single task of the dummy backend to complete.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// A context over a dummy backend, with its outcomes collected in a channel.
pub struct Harness {
    pub context: DecoderContext<DummyBackend>,
    pub outcomes: mpsc::Receiver<DecodeOutcome>,
    pub counters: Arc<ResourceCounters>,
    pub faults: Arc<Faults>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(Default::default(), Default::default())
    }

    pub fn with_options(options: DummyOptions, config: DecoderConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let backend = DummyBackend::with_options(options);
        let counters = backend.counters();
        let faults = backend.faults();

        let mut context = DecoderContext::new(backend, config).unwrap();
        let (sender, outcomes) = mpsc::channel();
        context
            .set_callback(move |outcome| {
                let _ = sender.send(outcome);
            })
            .unwrap();

        Self {
            context,
            outcomes,
            counters,
            faults,
        }
    }

    /// Same as `new`, with the context already initialized.
    pub fn initialized() -> Self {
        let mut harness = Self::new();
        harness.context.init().unwrap();
        harness
    }

    /// Waits for the running task and returns the outcome it delivered.
    pub fn complete(&mut self) -> DecodeOutcome {
        assert!(self.context.wait_for_completion(Some(TASK_TIMEOUT)).unwrap());
        self.outcomes
            .try_recv()
            .expect("task completed without delivering an outcome")
    }

    /// Decodes the whole of `data` and returns the outcome.
    pub fn decode(&mut self, data: &[u8]) -> DecodeOutcome {
        let len = data.len();
        self.context.decode_frames(Arc::from(data), 0, len).unwrap();
        self.complete()
    }

    /// Decodes the whole of `data` and returns the produced frame.
    pub fn decode_frame(&mut self, data: &[u8]) -> FrameOutput {
        match self.decode(data) {
            DecodeOutcome::Frame(output) => output,
            outcome => panic!("expected a frame, got {:?}", outcome),
        }
    }
}

/// Reads the pixels of a delivered frame.
pub fn read_pixels(output: &FrameOutput) -> Vec<u8> {
    let mut pixels = vec![0u8; output.handle.image_size()];
    output.handle.read(&mut pixels).unwrap();
    pixels
}
