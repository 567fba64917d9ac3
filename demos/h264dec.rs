// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! h264dec, a simple program decoding an Annex B H.264 stream to RGB24 with a `QueuedDecoder`.
//! Capable of computing MD5 checksums of the output and writing the raw frames to a file.

use std::fs::File;
use std::io::Cursor;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;

use argh::FromArgs;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;

use h264_rgb_decoder::backend::Backend;
use h264_rgb_decoder::codec::h264::parser::Nalu;
use h264_rgb_decoder::codec::h264::synthesizer;
use h264_rgb_decoder::AccessUnitFraming;
use h264_rgb_decoder::DecoderConfig;
use h264_rgb_decoder::DecoderEvent;
use h264_rgb_decoder::FrameOutput;
use h264_rgb_decoder::QueuedDecoder;
use h264_rgb_decoder::OUTPUT_BYTES_PER_PIXEL;

#[derive(Debug, PartialEq, Eq)]
enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Decodes an Annex B H.264 stream into packed RGB24 frames
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the decoded RGB24 frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    compute_md5: Option<Md5Computation>,

    /// when an access unit is considered complete (chunk or next). Default: next
    #[argh(option, default = "AccessUnitFraming::NextAccessUnit")]
    framing: AccessUnitFraming,

    /// number of threads the decoder may use internally
    #[argh(option)]
    threads: Option<usize>,
}

/// Returns the (offset, length) of every NAL unit of `stream`, start codes included.
fn nal_ranges(stream: &[u8]) -> Vec<(usize, usize)> {
    let mut cursor = Cursor::new(stream);
    let mut ranges = Vec::new();

    while let Ok(nalu) = Nalu::next(&mut cursor) {
        ranges.push((nalu.sc_offset(), nalu.end() - nalu.sc_offset()));
    }

    ranges
}

struct FrameSink {
    output: Option<File>,
    compute_md5: Option<Md5Computation>,
    stream_md5: md5::Context,
    frames: usize,
}

impl FrameSink {
    fn write(&mut self, frame: &FrameOutput) {
        let mut pixels = vec![0u8; frame.handle.image_size()];
        frame.handle.read(&mut pixels).expect("error reading output frame");

        // Drop the stride padding, if any.
        let line_size = frame.width as usize * OUTPUT_BYTES_PER_PIXEL;
        let packed: Vec<u8> = pixels
            .chunks(frame.handle.stride())
            .take(frame.height as usize)
            .flat_map(|line| &line[..line_size])
            .copied()
            .collect();

        if let Some(output) = &mut self.output {
            output.write_all(&packed).expect("error writing output file");
        }

        match self.compute_md5 {
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&packed)),
            Some(Md5Computation::Stream) => self.stream_md5.consume(&packed),
            None => (),
        }

        self.frames += 1;
    }
}

fn decode<B: Backend>(backend: B, args: Args, stream: Vec<u8>) {
    let config = DecoderConfig {
        framing: args.framing,
        thread_count: args.threads,
        ..Default::default()
    };

    let mut decoder = QueuedDecoder::new(backend, config).expect("error creating decoder");

    let (sender, events) = mpsc::channel();
    decoder.set_event_handler(move |event| {
        let _ = sender.send(event);
    });

    let epoll = Epoll::new(EpollCreateFlags::empty()).expect("error creating epoll");
    epoll
        .add(decoder.completion_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
        .expect("error polling completion events");

    let mut sink = FrameSink {
        output: args
            .output
            .as_ref()
            .map(|p| File::create(p).expect("error creating output file")),
        compute_md5: args.compute_md5,
        stream_md5: md5::Context::new(),
        frames: 0,
    };

    let stream: Arc<[u8]> = Arc::from(stream);
    let end_of_stream: Arc<[u8]> = Arc::from(synthesizer::end_of_stream());

    for (offset, length) in nal_ranges(&stream) {
        decoder
            .decode_frames(Arc::clone(&stream), offset, length)
            .expect("error queuing input");
    }
    decoder
        .decode_frames(Arc::clone(&end_of_stream), 0, end_of_stream.len())
        .expect("error queuing end of stream");
    log::debug!("{} requests queued", decoder.pending() + 1);

    while decoder.is_busy() {
        if !decoder
            .dispatch_completion()
            .expect("error completing decode request")
        {
            let mut ready = [EpollEvent::empty()];
            epoll
                .wait(&mut ready, EpollTimeout::NONE)
                .expect("error waiting for decode request");
        }

        for event in events.try_iter() {
            match event {
                DecoderEvent::Frame(frame) => sink.write(&frame),
                DecoderEvent::Error(err) => log::warn!("{}", err),
            }
        }
    }

    decoder.release();

    if sink.compute_md5 == Some(Md5Computation::Stream) {
        println!("{:x}", sink.stream_md5.compute());
    }
    log::info!("decoded {} frames", sink.frames);
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let stream = std::fs::read(&args.input).expect("error reading input file");

    #[cfg(feature = "ffmpeg")]
    let backend = h264_rgb_decoder::backend::ffmpeg::FfmpegBackend::new()
        .expect("error initializing ffmpeg backend");
    #[cfg(not(feature = "ffmpeg"))]
    let backend = h264_rgb_decoder::backend::dummy::DummyBackend::new();

    decode(backend, args, stream);
}
