// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod common;

use std::sync::Arc;

use h264_rgb_decoder::backend::dummy::DecodeGate;
use h264_rgb_decoder::backend::dummy::DummyBackend;
use h264_rgb_decoder::backend::dummy::DummyOptions;
use h264_rgb_decoder::backend::dummy::Fault;
use h264_rgb_decoder::backend::dummy::Resource;
use h264_rgb_decoder::codec::h264::synthesizer;
use h264_rgb_decoder::AccessUnitFraming;
use h264_rgb_decoder::DecodeOutcome;
use h264_rgb_decoder::DecodedFormat;
use h264_rgb_decoder::DecoderConfig;
use h264_rgb_decoder::DecoderContext;
use h264_rgb_decoder::TaskError;

use common::read_pixels;
use common::Harness;
use common::TASK_TIMEOUT;

/// SPS and PPS followed by an IDR slice that stops right after its NAL header.
fn truncated_access_unit() -> Vec<u8> {
    let mut stream = synthesizer::sps(64, 64).unwrap();
    stream.extend(synthesizer::pps().unwrap());
    stream.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
    stream
}

fn expect_failure(outcome: DecodeOutcome) -> TaskError {
    match outcome {
        DecodeOutcome::Failed(err) => err,
        outcome => panic!("expected a failure, got {:?}", outcome),
    }
}

#[test]
fn single_access_unit_decodes_to_rgb() {
    for format in [DecodedFormat::I420, DecodedFormat::NV12] {
        let mut harness = Harness::with_options(
            DummyOptions {
                format,
                ..Default::default()
            },
            Default::default(),
        );
        harness.context.init().unwrap();

        let output = harness.decode_frame(&synthesizer::idr_access_unit(64, 64).unwrap());

        assert_eq!((output.width, output.height), (64, 64));
        assert_eq!(output.handle.stride(), 64 * 3);
        assert_eq!(output.handle.image_size(), 64 * 64 * 3);
        // The first dummy frame is black.
        assert!(read_pixels(&output).iter().all(|&b| b == 0));
    }
}

#[test]
fn truncated_access_unit_fails() {
    let mut harness = Harness::initialized();

    let err = expect_failure(harness.decode(&truncated_access_unit()));
    assert!(matches!(err, TaskError::ParseIncomplete { remaining: 5 }));
    let message = err.to_string();
    assert!(message.starts_with("failed to decode frame:"), "{}", message);
    assert!(message.contains("incomplete frame"), "{}", message);

    // The context remains usable.
    assert!(harness.context.is_initialized());
    let output = harness.decode_frame(&synthesizer::idr_access_unit(64, 64).unwrap());
    assert_eq!((output.width, output.height), (64, 64));
}

#[test]
fn data_without_start_code_fails() {
    let mut harness = Harness::initialized();

    let err = expect_failure(harness.decode(&[0x12, 0x34, 0x56, 0x78]));
    assert!(matches!(err, TaskError::ParseIncomplete { remaining: 4 }));
}

#[test]
fn same_geometry_reuses_the_output_frame() {
    let mut harness = Harness::initialized();
    let access_unit = synthesizer::idr_access_unit(64, 64).unwrap();

    let first = harness.decode_frame(&access_unit);
    for _ in 0..3 {
        let next = harness.decode_frame(&access_unit);
        assert!(next.handle.ptr_eq(&first.handle));
        assert_eq!((next.width, next.height), (64, 64));
    }

    assert!(first.handle.is_valid());
    assert_eq!(harness.counters.created(Resource::Pipeline), 1);
}

#[test]
fn geometry_change_reallocates_the_output_frame() {
    let mut harness = Harness::initialized();

    let first = harness.decode_frame(&synthesizer::idr_access_unit(64, 64).unwrap());
    let second = harness.decode_frame(&synthesizer::idr_access_unit(32, 48).unwrap());

    assert!(!second.handle.ptr_eq(&first.handle));
    assert!(!first.handle.is_valid());
    assert!(second.handle.is_valid());
    assert_eq!((second.width, second.height), (32, 48));
    assert_eq!(second.handle.image_size(), 32 * 48 * 3);
    assert_eq!(read_pixels(&second).len(), 32 * 48 * 3);

    assert_eq!(harness.counters.created(Resource::Pipeline), 2);
    assert_eq!(harness.counters.live(Resource::Pipeline), 1);

    // Going back is another change.
    let third = harness.decode_frame(&synthesizer::idr_access_unit(64, 64).unwrap());
    assert!(!third.handle.ptr_eq(&first.handle));
    assert!(!second.handle.is_valid());
    assert_eq!(harness.counters.created(Resource::Pipeline), 3);
}

#[test]
fn input_is_held_exactly_for_the_task() {
    let gate = DecodeGate::closed();
    let mut harness = Harness::with_options(
        DummyOptions {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        Default::default(),
    );
    harness.context.init().unwrap();

    let inputs: [Arc<[u8]>; 3] = [
        Arc::from(synthesizer::idr_access_unit(64, 64).unwrap()),
        Arc::from(truncated_access_unit()),
        Arc::from(synthesizer::sps(64, 64).unwrap()),
    ];

    for input in inputs {
        harness
            .context
            .decode_frames(Arc::clone(&input), 0, input.len())
            .unwrap();
        assert_eq!(Arc::strong_count(&input), 2);

        gate.open();
        harness.complete();
        gate.close();

        assert_eq!(Arc::strong_count(&input), 1);
    }
}

#[test]
fn only_the_last_drained_frame_survives() {
    let mut harness = Harness::with_options(
        DummyOptions {
            frames_per_access_unit: 2,
            ..Default::default()
        },
        Default::default(),
    );
    harness.context.init().unwrap();

    let output = harness.decode_frame(&synthesizer::idr_access_unit(16, 16).unwrap());

    // Luma levels 16 and 17 were decoded; 17 converts to 1.
    assert!(read_pixels(&output).iter().all(|&b| b == 1));
}

#[test]
fn several_access_units_in_one_call() {
    let mut harness = Harness::initialized();
    let mut stream = synthesizer::idr_access_unit(16, 16).unwrap();
    stream.extend(synthesizer::p_slice(1, 0).unwrap());
    stream.extend(synthesizer::p_slice(2, 0).unwrap());

    let output = harness.decode_frame(&stream);

    assert_eq!(harness.counters.access_units(), 3);
    // Third frame, luma 18.
    assert!(read_pixels(&output).iter().all(|&b| b == 2));
}

#[test]
fn failure_discards_earlier_output_of_the_task() {
    let mut harness = Harness::initialized();

    // A good access unit, then one whose SPS has no payload.
    let mut stream = synthesizer::idr_access_unit(64, 64).unwrap();
    stream.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x67]);
    stream.extend(synthesizer::idr_slice(1).unwrap());

    let err = expect_failure(harness.decode(&stream));
    assert!(matches!(err, TaskError::SubmitFailed(_)));
    assert_eq!(harness.counters.access_units(), 2);

    // The frame converted before the failure is delivered by the next success.
    let output = harness.decode_frame(&synthesizer::idr_access_unit(64, 64).unwrap());
    assert!(output.handle.is_valid());
    assert_eq!(harness.counters.created(Resource::Pipeline), 1);
}

#[test]
fn drain_failure_is_reported() {
    let mut harness = Harness::initialized();
    let access_unit = synthesizer::idr_access_unit(64, 64).unwrap();

    harness.faults.set(Fault::Drain, true);
    let err = expect_failure(harness.decode(&access_unit));
    assert!(matches!(err, TaskError::DrainFailed(_)));
    assert!(err.to_string().starts_with("failed to decode frame:"));

    harness.faults.set(Fault::Drain, false);
    harness.decode_frame(&access_unit);
}

#[test]
fn conversion_setup_failure_is_recoverable() {
    let mut harness = Harness::initialized();
    let access_unit = synthesizer::idr_access_unit(64, 64).unwrap();

    harness.faults.set(Fault::CreatePipeline, true);
    let err = expect_failure(harness.decode(&access_unit));
    assert!(matches!(
        err,
        TaskError::ConversionSetupFailed {
            width: 64,
            height: 64,
            ..
        }
    ));
    assert_eq!(harness.counters.live(Resource::Pipeline), 0);

    // Same geometry again: the cache retries instead of reusing a half-built frame.
    harness.faults.set(Fault::CreatePipeline, false);
    let output = harness.decode_frame(&access_unit);
    assert!(output.handle.is_valid());
    assert_eq!(read_pixels(&output).len(), 64 * 64 * 3);
}

#[test]
fn parameter_sets_alone_are_consumed() {
    let mut harness = Harness::initialized();

    assert!(matches!(
        harness.decode(&synthesizer::sps(64, 32).unwrap()),
        DecodeOutcome::Consumed
    ));
    assert!(matches!(
        harness.decode(&synthesizer::pps().unwrap()),
        DecodeOutcome::Consumed
    ));
    assert_eq!(harness.counters.access_units(), 0);

    let output = harness.decode_frame(&synthesizer::idr_slice(0).unwrap());
    assert_eq!((output.width, output.height), (64, 32));
}

#[test]
fn next_access_unit_framing_delays_output_by_one_call() {
    let mut harness = Harness::with_options(
        Default::default(),
        DecoderConfig {
            framing: AccessUnitFraming::NextAccessUnit,
            ..Default::default()
        },
    );
    harness.context.init().unwrap();

    assert!(matches!(
        harness.decode(&synthesizer::idr_access_unit(64, 64).unwrap()),
        DecodeOutcome::Consumed
    ));

    let first = harness.decode_frame(&synthesizer::p_slice(1, 0).unwrap());
    assert_eq!((first.width, first.height), (64, 64));

    let second = harness.decode_frame(&synthesizer::end_of_stream());
    assert!(second.handle.ptr_eq(&first.handle));
    assert_eq!(harness.counters.access_units(), 2);
}

#[test]
fn outcome_without_callback_is_dropped() {
    let mut context = DecoderContext::new(DummyBackend::new(), Default::default()).unwrap();
    context.init().unwrap();

    let input: Arc<[u8]> = Arc::from(synthesizer::idr_access_unit(64, 64).unwrap());
    context
        .decode_frames(Arc::clone(&input), 0, input.len())
        .unwrap();

    assert!(context.wait_for_completion(Some(TASK_TIMEOUT)).unwrap());
    assert!(!context.is_busy());
    assert_eq!(Arc::strong_count(&input), 1);
}

#[test]
fn range_within_a_larger_buffer() {
    let mut harness = Harness::initialized();
    let access_unit = synthesizer::idr_access_unit(64, 64).unwrap();

    let mut buffer = vec![0xaa; 7];
    buffer.extend(&access_unit);
    buffer.extend([0xbb; 9]);
    let input: Arc<[u8]> = Arc::from(buffer);

    harness
        .context
        .decode_frames(input, 7, access_unit.len())
        .unwrap();
    assert!(matches!(harness.complete(), DecodeOutcome::Frame(_)));
}
