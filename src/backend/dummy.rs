// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoding context run so
//! we can test it in isolation.
//!
//! The decoder does not look at slice data: it learns the picture size from SPS NAL units and
//! produces flat synthetic frames for every access unit that carries a picture. Every resource
//! it hands out is tracked in [`ResourceCounters`], and failures can be injected through
//! [`Faults`].

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::Context;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::ConversionPipeline;
use crate::backend::DecodedFrame;
use crate::backend::ParseStep;
use crate::backend::ReceiveStatus;
use crate::backend::StreamParser;
use crate::backend::VideoDecoder;
use crate::codec::h264::access_unit::AccessUnitParser;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Sps;
use crate::config::DecoderConfig;
use crate::image_processing::i420_to_rgb24;
use crate::image_processing::nv12_to_rgb24;
use crate::DecodedFormat;
use crate::FrameGeometry;
use crate::OUTPUT_BYTES_PER_PIXEL;

/// Largest coded width or height the dummy decoder accepts.
const MAX_DIMENSION: u32 = 8192;

/// Kinds of resources handed out by [`DummyBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Decoder,
    Parser,
    Frame,
    Pipeline,
}

/// Live and total counts of the resources created by a [`DummyBackend`].
#[derive(Debug, Default)]
pub struct ResourceCounters {
    live: [AtomicUsize; 4],
    created: [AtomicUsize; 4],
    access_units: AtomicUsize,
}

impl ResourceCounters {
    /// Number of resources of kind `resource` currently alive.
    pub fn live(&self, resource: Resource) -> usize {
        self.live[resource as usize].load(Ordering::SeqCst)
    }

    /// Number of resources of kind `resource` created so far.
    pub fn created(&self, resource: Resource) -> usize {
        self.created[resource as usize].load(Ordering::SeqCst)
    }

    /// Number of resources of any kind currently alive.
    pub fn live_total(&self) -> usize {
        self.live
            .iter()
            .map(|count| count.load(Ordering::SeqCst))
            .sum()
    }

    /// Number of access units submitted to decoders so far.
    pub fn access_units(&self) -> usize {
        self.access_units.load(Ordering::SeqCst)
    }
}

/// Keeps a resource accounted as live until dropped.
#[derive(Debug)]
struct LiveGuard {
    counters: Arc<ResourceCounters>,
    resource: Resource,
}

impl LiveGuard {
    fn new(counters: &Arc<ResourceCounters>, resource: Resource) -> Self {
        counters.live[resource as usize].fetch_add(1, Ordering::SeqCst);
        counters.created[resource as usize].fetch_add(1, Ordering::SeqCst);

        Self {
            counters: Arc::clone(counters),
            resource,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.counters.live[self.resource as usize].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Failures that can be injected into a [`DummyBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    OpenDecoder,
    OpenParser,
    AllocFrame,
    CreatePipeline,
    Drain,
    /// The decoder panics when an access unit is submitted.
    Panic,
}

/// Switches for [`Fault`]s. They can be flipped while a context is running.
#[derive(Debug, Default)]
pub struct Faults([AtomicBool; 6]);

impl Faults {
    pub fn set(&self, fault: Fault, enabled: bool) {
        self.0[fault as usize].store(enabled, Ordering::SeqCst);
    }

    pub fn is_set(&self, fault: Fault) -> bool {
        self.0[fault as usize].load(Ordering::SeqCst)
    }
}

/// Blocks decoders inside [`VideoDecoder::send`] until opened, so a task can be held in flight.
#[derive(Debug, Clone, Default)]
pub struct DecodeGate(Arc<(Mutex<bool>, Condvar)>);

impl DecodeGate {
    pub fn closed() -> Self {
        Default::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn close(&self) {
        let (lock, _) = &*self.0;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = cvar.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DummyOptions {
    /// Layout of the frames produced by the decoder.
    pub format: DecodedFormat,
    /// Number of frames queued for every access unit carrying a picture.
    pub frames_per_access_unit: usize,
    pub gate: Option<DecodeGate>,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            format: DecodedFormat::I420,
            frames_per_access_unit: 1,
            gate: None,
        }
    }
}

/// Dummy backend that can be used to run a decoding context without any codec library.
#[derive(Debug, Default)]
pub struct DummyBackend {
    options: DummyOptions,
    faults: Arc<Faults>,
    counters: Arc<ResourceCounters>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_options(options: DummyOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn counters(&self) -> Arc<ResourceCounters> {
        Arc::clone(&self.counters)
    }

    pub fn faults(&self) -> Arc<Faults> {
        Arc::clone(&self.faults)
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// A 4:2:0 frame with padded planes.
#[derive(Debug)]
pub struct DummyFrame {
    width: u32,
    height: u32,
    format: DecodedFormat,
    data: Vec<u8>,
    strides: [usize; 3],
    offsets: [usize; 3],
    _live: LiveGuard,
}

impl DummyFrame {
    /// Turns the frame into a flat picture of luma `level` and neutral chroma.
    fn fill(&mut self, width: u32, height: u32, format: DecodedFormat, level: u8) {
        let (w, h) = (width as usize, height as usize);
        let y_stride = align_up(w, 16);
        let uv_height = (h + 1) / 2;
        let y_size = y_stride * h;

        match format {
            DecodedFormat::I420 => {
                let uv_stride = align_up((w + 1) / 2, 16);
                self.strides = [y_stride, uv_stride, uv_stride];
                self.offsets = [0, y_size, y_size + uv_stride * uv_height];
            }
            DecodedFormat::NV12 => {
                self.strides = [y_stride, y_stride, 0];
                self.offsets = [0, y_size, 0];
            }
        }

        let total = match format {
            DecodedFormat::I420 => self.offsets[2] + self.strides[2] * uv_height,
            DecodedFormat::NV12 => self.offsets[1] + self.strides[1] * uv_height,
        };

        self.data.clear();
        self.data.resize(total, 128);
        self.data[..y_size].fill(level);
        self.width = width;
        self.height = height;
        self.format = format;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn strides(&self) -> [usize; 3] {
        self.strides
    }

    pub fn offsets(&self) -> [usize; 3] {
        self.offsets
    }
}

impl DecodedFrame for DummyFrame {
    type Format = DecodedFormat;

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> DecodedFormat {
        self.format
    }
}

struct QueuedFrame {
    width: u32,
    height: u32,
    level: u8,
}

pub struct DummyDecoder {
    options: DummyOptions,
    faults: Arc<Faults>,
    counters: Arc<ResourceCounters>,
    /// Display size from the last SPS.
    size: Option<(u32, u32)>,
    ready: VecDeque<QueuedFrame>,
    produced: usize,
    _live: LiveGuard,
}

impl VideoDecoder for DummyDecoder {
    type Frame = DummyFrame;

    fn send(&mut self, access_unit: &[u8]) -> BackendResult<()> {
        if let Some(gate) = &self.options.gate {
            gate.wait();
        }

        self.counters.access_units.fetch_add(1, Ordering::SeqCst);
        if self.faults.is_set(Fault::Panic) {
            panic!("dummy decoder panicked on a {} bytes access unit", access_unit.len());
        }

        let mut cursor = Cursor::new(access_unit);
        let mut has_picture = false;

        while let Ok(nalu) = Nalu::next(&mut cursor) {
            match nalu.header.type_ {
                NaluType::Sps => {
                    let sps = Sps::parse(&nalu).context("while parsing SPS")?;
                    if sps.coded_width() > MAX_DIMENSION || sps.coded_height() > MAX_DIMENSION {
                        return Err(BackendError::Unsupported(format!(
                            "{}x{} stream",
                            sps.coded_width(),
                            sps.coded_height()
                        )));
                    }
                    self.size = Some((sps.width(), sps.height()));
                }
                type_ if type_.is_vcl() => has_picture = true,
                _ => (),
            }
        }

        if !has_picture {
            return Ok(());
        }

        let (width, height) = self
            .size
            .ok_or_else(|| anyhow!("picture data received before any SPS"))?;

        for _ in 0..self.options.frames_per_access_unit {
            let level = 16 + (self.produced % 220) as u8;
            self.produced += 1;
            self.ready.push_back(QueuedFrame {
                width,
                height,
                level,
            });
        }

        Ok(())
    }

    fn receive(&mut self, frame: &mut DummyFrame) -> BackendResult<ReceiveStatus> {
        if self.faults.is_set(Fault::Drain) {
            return Err(anyhow!("dummy decoder failed to output a frame").into());
        }

        match self.ready.pop_front() {
            Some(queued) => {
                frame.fill(queued.width, queued.height, self.options.format, queued.level);
                Ok(ReceiveStatus::Ready)
            }
            None => Ok(ReceiveStatus::Again),
        }
    }
}

pub struct DummyParser {
    inner: AccessUnitParser,
    _live: LiveGuard,
}

impl StreamParser for DummyParser {
    fn parse<'a>(&'a mut self, data: &'a [u8]) -> ParseStep<'a> {
        self.inner.parse(data)
    }
}

/// Converts I420 or NV12 frames of a fixed geometry in software.
pub struct SoftwarePipeline {
    geometry: FrameGeometry<DecodedFormat>,
    _live: LiveGuard,
}

impl ConversionPipeline for SoftwarePipeline {
    type Frame = DummyFrame;

    fn convert(&mut self, src: &DummyFrame, dst: &mut [u8], stride: usize) -> BackendResult<()> {
        if src.geometry() != self.geometry {
            return Err(BackendError::Unsupported(format!(
                "pipeline built for {:?} cannot convert {:?}",
                self.geometry,
                src.geometry()
            )));
        }

        let (width, height) = (src.width as usize, src.height as usize);
        let line_size = width * OUTPUT_BYTES_PER_PIXEL;
        if height == 0 || stride < line_size || dst.len() < stride * (height - 1) + line_size {
            return Err(anyhow!(
                "output buffer of {} bytes with stride {} is too small for {}x{}",
                dst.len(),
                stride,
                width,
                height
            )
            .into());
        }

        let (strides, offsets) = (src.strides, src.offsets);
        match src.format {
            DecodedFormat::I420 => {
                i420_to_rgb24(&src.data, dst, width, height, strides, offsets, stride)
            }
            DecodedFormat::NV12 => nv12_to_rgb24(
                &src.data,
                dst,
                width,
                height,
                [strides[0], strides[1]],
                [offsets[0], offsets[1]],
                stride,
            ),
        }

        Ok(())
    }
}

impl Backend for DummyBackend {
    type Frame = DummyFrame;
    type Decoder = DummyDecoder;
    type Parser = DummyParser;
    type Pipeline = SoftwarePipeline;

    fn open_decoder(&self, _config: &DecoderConfig) -> BackendResult<DummyDecoder> {
        if self.faults.is_set(Fault::OpenDecoder) {
            return Err(BackendError::OutOfMemory("decoder context"));
        }

        Ok(DummyDecoder {
            options: self.options.clone(),
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
            size: None,
            ready: VecDeque::new(),
            produced: 0,
            _live: LiveGuard::new(&self.counters, Resource::Decoder),
        })
    }

    fn open_parser(&self, config: &DecoderConfig) -> BackendResult<DummyParser> {
        if self.faults.is_set(Fault::OpenParser) {
            return Err(BackendError::OutOfMemory("parser"));
        }

        Ok(DummyParser {
            inner: AccessUnitParser::new(config.framing),
            _live: LiveGuard::new(&self.counters, Resource::Parser),
        })
    }

    fn alloc_frame(&self) -> BackendResult<DummyFrame> {
        if self.faults.is_set(Fault::AllocFrame) {
            return Err(BackendError::OutOfMemory("frame"));
        }

        Ok(DummyFrame {
            width: 0,
            height: 0,
            format: self.options.format,
            data: Vec::new(),
            strides: [0; 3],
            offsets: [0; 3],
            _live: LiveGuard::new(&self.counters, Resource::Frame),
        })
    }

    fn create_pipeline(
        &self,
        geometry: &FrameGeometry<DecodedFormat>,
    ) -> BackendResult<SoftwarePipeline> {
        if self.faults.is_set(Fault::CreatePipeline) {
            return Err(BackendError::OutOfMemory("conversion pipeline"));
        }

        if geometry.width == 0 || geometry.height == 0 {
            return Err(BackendError::Unsupported(format!(
                "cannot convert empty frames ({}x{})",
                geometry.width, geometry.height
            )));
        }

        Ok(SoftwarePipeline {
            geometry: *geometry,
            _live: LiveGuard::new(&self.counters, Resource::Pipeline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::synthesizer;

    fn decode_one(backend: &DummyBackend, access_unit: &[u8]) -> DummyFrame {
        let mut decoder = backend.open_decoder(&Default::default()).unwrap();
        let mut frame = backend.alloc_frame().unwrap();

        decoder.send(access_unit).unwrap();
        assert_eq!(decoder.receive(&mut frame).unwrap(), ReceiveStatus::Ready);
        assert_eq!(decoder.receive(&mut frame).unwrap(), ReceiveStatus::Again);
        frame
    }

    #[test]
    fn decoder_follows_sps_geometry() {
        let backend = DummyBackend::new();
        let frame = decode_one(&backend, &synthesizer::idr_access_unit(100, 50).unwrap());

        assert_eq!(frame.geometry(), FrameGeometry::new(100, 50, DecodedFormat::I420));
        assert_eq!(frame.strides(), [112, 64, 64]);
        assert_eq!(frame.data()[0], 16);
        assert_eq!(backend.counters().access_units(), 1);
    }

    #[test]
    fn slice_without_sps_is_rejected() {
        let backend = DummyBackend::new();
        let mut decoder = backend.open_decoder(&Default::default()).unwrap();

        assert!(decoder.send(&synthesizer::idr_slice(0).unwrap()).is_err());
    }

    #[test]
    fn parameter_sets_alone_produce_nothing() {
        let backend = DummyBackend::new();
        let mut decoder = backend.open_decoder(&Default::default()).unwrap();
        let mut frame = backend.alloc_frame().unwrap();

        decoder.send(&synthesizer::sps(64, 64).unwrap()).unwrap();
        assert_eq!(decoder.receive(&mut frame).unwrap(), ReceiveStatus::Again);
    }

    #[test]
    fn live_resources_are_counted() {
        let backend = DummyBackend::new();
        let counters = backend.counters();

        let decoder = backend.open_decoder(&Default::default()).unwrap();
        let parser = backend.open_parser(&Default::default()).unwrap();
        assert_eq!(counters.live_total(), 2);

        drop(decoder);
        assert_eq!(counters.live(Resource::Decoder), 0);
        assert_eq!(counters.created(Resource::Decoder), 1);
        drop(parser);
        assert_eq!(counters.live_total(), 0);
    }

    #[test]
    fn injected_faults() {
        let backend = DummyBackend::new();
        let faults = backend.faults();

        faults.set(Fault::AllocFrame, true);
        assert!(matches!(
            backend.alloc_frame(),
            Err(BackendError::OutOfMemory(_))
        ));
        faults.set(Fault::AllocFrame, false);
        assert!(backend.alloc_frame().is_ok());

        faults.set(Fault::Drain, true);
        let mut decoder = backend.open_decoder(&Default::default()).unwrap();
        let mut frame = backend.alloc_frame().unwrap();
        assert!(decoder.receive(&mut frame).is_err());
    }

    #[test]
    fn software_pipeline_converts_both_layouts() {
        for format in [DecodedFormat::I420, DecodedFormat::NV12] {
            let backend = DummyBackend::with_options(DummyOptions {
                format,
                ..Default::default()
            });
            let frame = decode_one(&backend, &synthesizer::idr_access_unit(32, 16).unwrap());
            let mut pipeline = backend.create_pipeline(&frame.geometry()).unwrap();

            let stride = backend.output_stride(32);
            let mut rgb = vec![0xffu8; stride * 16];
            pipeline.convert(&frame, &mut rgb, stride).unwrap();

            // Luma 16 with neutral chroma is black.
            assert!(rgb.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn pipeline_rejects_other_geometries() {
        let backend = DummyBackend::new();
        let frame = decode_one(&backend, &synthesizer::idr_access_unit(32, 16).unwrap());
        let mut pipeline = backend
            .create_pipeline(&FrameGeometry::new(64, 64, DecodedFormat::I420))
            .unwrap();

        let mut rgb = vec![0u8; 64 * 64 * 3];
        assert!(matches!(
            pipeline.convert(&frame, &mut rgb, 64 * 3),
            Err(BackendError::Unsupported(_))
        ));
    }
}
