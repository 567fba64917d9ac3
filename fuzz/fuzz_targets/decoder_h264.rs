#![no_main]

use std::sync::Arc;

use h264_rgb_decoder::backend::dummy::DummyBackend;
use h264_rgb_decoder::AccessUnitFraming;
use h264_rgb_decoder::DecoderConfig;
use h264_rgb_decoder::DecoderContext;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for framing in [AccessUnitFraming::ChunkBoundary, AccessUnitFraming::NextAccessUnit] {
        let config = DecoderConfig {
            framing,
            ..Default::default()
        };
        let mut context = DecoderContext::new(DummyBackend::new(), config).unwrap();
        context.set_callback(|_| ()).unwrap();
        context.init().unwrap();

        // Feed the data twice, in two halves and then whole, so parser state carries over.
        let input: Arc<[u8]> = Arc::from(data);
        let half = data.len() / 2;
        for (offset, length) in [(0, half), (half, data.len() - half), (0, data.len())] {
            context
                .decode_frames(Arc::clone(&input), offset, length)
                .unwrap();
            assert!(context.wait_for_completion(None).unwrap());
        }
    }
});
