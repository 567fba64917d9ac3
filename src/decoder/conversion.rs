// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The RGB24 output frame and the conversion pipeline feeding it.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::anyhow;
use thiserror::Error;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::ConversionPipeline;
use crate::backend::FormatOf;
use crate::FrameGeometry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("the output frame has been reallocated or released")]
    Invalidated,
    #[error("buffer of {actual} bytes given, {expected} bytes required")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("the output frame lock is poisoned")]
    Poisoned,
}

/// Packed RGB24 pixels of one frame geometry.
pub struct FrameBuffer {
    data: RwLock<Vec<u8>>,
    stride: usize,
    width: u32,
    height: u32,
    valid: AtomicBool,
}

impl FrameBuffer {
    fn alloc(width: u32, height: u32, stride: usize) -> BackendResult<Self> {
        let size = stride
            .checked_mul(height as usize)
            .ok_or(BackendError::OutOfMemory("output frame"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| BackendError::OutOfMemory("output frame"))?;
        data.resize(size, 0);

        Ok(Self {
            data: RwLock::new(data),
            stride,
            width,
            height,
            valid: AtomicBool::new(true),
        })
    }

    /// Frees the pixels. Handles still pointing to this buffer will refuse to read from it.
    fn invalidate(&self) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        self.valid.store(false, Ordering::SeqCst);
        *data = Vec::new();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("valid", &self.valid.load(Ordering::SeqCst))
            .finish()
    }
}

/// Caller-visible handle to the output frame.
///
/// Cloning is cheap and all clones refer to the same buffer. A handle stays readable until the
/// output frame is reallocated for a new geometry or the context is released.
#[derive(Clone, Debug)]
pub struct FrameHandle(Arc<FrameBuffer>);

impl FrameHandle {
    fn new(buffer: &Arc<FrameBuffer>) -> Self {
        Self(Arc::clone(buffer))
    }

    /// Read the contents of the frame into `buffer`.
    ///
    /// The size of `buffer` must be equal to `image_size()`, or an error will be returned.
    pub fn read(&self, buffer: &mut [u8]) -> Result<(), HandleError> {
        let data = self.0.data.read().map_err(|_| HandleError::Poisoned)?;
        if !self.0.valid.load(Ordering::SeqCst) {
            return Err(HandleError::Invalidated);
        }

        if buffer.len() != data.len() {
            return Err(HandleError::SizeMismatch {
                expected: data.len(),
                actual: buffer.len(),
            });
        }

        buffer.copy_from_slice(&data);
        Ok(())
    }

    /// Returns the size of the `buffer` argument required to call `read` on this handle.
    pub fn image_size(&self) -> usize {
        self.0.stride * self.0.height as usize
    }

    /// Distance in bytes between two lines of the frame.
    pub fn stride(&self) -> usize {
        self.0.stride
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn is_valid(&self) -> bool {
        self.0.valid.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &FrameHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Output frame and conversion pipeline, kept as long as the frame geometry does not change.
pub(crate) struct ConversionCache<B: Backend> {
    backend: Arc<B>,
    /// `None` until the first frame, and after teardown or a failed reallocation.
    geometry: Option<FrameGeometry<FormatOf<B>>>,
    pipeline: Option<B::Pipeline>,
    buffer: Option<Arc<FrameBuffer>>,
    /// Set on every reallocation, until a handle to the new buffer has been handed out.
    handle_stale: bool,
}

impl<B: Backend> ConversionCache<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            geometry: None,
            pipeline: None,
            buffer: None,
            handle_stale: false,
        }
    }

    /// Makes sure the output frame and pipeline match `geometry`, rebuilding both otherwise.
    ///
    /// Returns whether a reallocation took place. On failure the cache is left empty so the next
    /// frame retries from scratch.
    pub(crate) fn ensure_output_frame(
        &mut self,
        geometry: FrameGeometry<FormatOf<B>>,
    ) -> BackendResult<bool> {
        if self.geometry == Some(geometry) {
            return Ok(false);
        }

        self.teardown();

        let pipeline = self.backend.create_pipeline(&geometry)?;
        let stride = self.backend.output_stride(geometry.width);
        let buffer = FrameBuffer::alloc(geometry.width, geometry.height, stride)?;

        log::debug!("output frame reallocated for {:?}", geometry);
        self.geometry = Some(geometry);
        self.pipeline = Some(pipeline);
        self.buffer = Some(Arc::new(buffer));
        self.handle_stale = true;

        Ok(true)
    }

    /// Converts `frame` into the output buffer.
    pub(crate) fn convert(&mut self, frame: &B::Frame) -> BackendResult<()> {
        let (Some(pipeline), Some(buffer)) = (self.pipeline.as_mut(), self.buffer.as_ref()) else {
            return Err(anyhow!("no output frame allocated").into());
        };

        let mut data = buffer
            .data
            .write()
            .map_err(|_| anyhow!("output frame lock is poisoned"))?;
        pipeline.convert(frame, &mut data, buffer.stride)
    }

    /// Returns a new handle to the output frame if it was reallocated since the last call.
    pub(crate) fn take_fresh_handle(&mut self) -> Option<FrameHandle> {
        if !std::mem::take(&mut self.handle_stale) {
            return None;
        }

        self.buffer.as_ref().map(FrameHandle::new)
    }

    /// Frees the pipeline and the output frame and invalidates outstanding handles.
    pub(crate) fn teardown(&mut self) {
        self.pipeline = None;
        if let Some(buffer) = self.buffer.take() {
            buffer.invalidate();
        }
        self.geometry = None;
        self.handle_stale = false;
    }
}

impl<B: Backend> Drop for ConversionCache<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::Fault;
    use crate::backend::dummy::Resource;
    use crate::DecodedFormat;

    fn cache() -> (ConversionCache<DummyBackend>, Arc<DummyBackend>) {
        let backend = Arc::new(DummyBackend::new());
        (ConversionCache::new(Arc::clone(&backend)), backend)
    }

    #[test]
    fn unchanged_geometry_reuses_everything() {
        let (mut cache, backend) = cache();
        let counters = backend.counters();
        let geometry = FrameGeometry::new(64, 64, DecodedFormat::I420);

        assert!(cache.ensure_output_frame(geometry).unwrap());
        let handle = cache.take_fresh_handle().unwrap();

        for _ in 0..3 {
            assert!(!cache.ensure_output_frame(geometry).unwrap());
        }

        assert_eq!(counters.created(Resource::Pipeline), 1);
        assert!(cache.take_fresh_handle().is_none());
        assert!(handle.is_valid());
        assert_eq!(handle.image_size(), 64 * 64 * 3);
    }

    #[test]
    fn any_change_reallocates() {
        let (mut cache, backend) = cache();
        let counters = backend.counters();

        let geometries = [
            FrameGeometry::new(64, 64, DecodedFormat::I420),
            FrameGeometry::new(80, 64, DecodedFormat::I420),
            FrameGeometry::new(80, 48, DecodedFormat::I420),
            FrameGeometry::new(80, 48, DecodedFormat::NV12),
        ];

        let mut previous: Option<FrameHandle> = None;
        for geometry in geometries {
            assert!(cache.ensure_output_frame(geometry).unwrap());
            let handle = cache.take_fresh_handle().unwrap();
            if let Some(previous) = previous {
                assert!(!previous.is_valid());
                assert!(!previous.ptr_eq(&handle));
            }
            previous = Some(handle);
        }

        assert_eq!(counters.created(Resource::Pipeline), 4);
        assert_eq!(counters.live(Resource::Pipeline), 1);
    }

    #[test]
    fn failed_reallocation_resets_the_cache() {
        let (mut cache, backend) = cache();
        let faults = backend.faults();
        let geometry = FrameGeometry::new(64, 64, DecodedFormat::I420);

        assert!(cache.ensure_output_frame(geometry).unwrap());
        let handle = cache.take_fresh_handle().unwrap();

        faults.set(Fault::CreatePipeline, true);
        assert!(cache
            .ensure_output_frame(FrameGeometry::new(32, 32, DecodedFormat::I420))
            .is_err());
        assert!(!handle.is_valid());

        // The same geometry as before is not mistaken for a cache hit.
        faults.set(Fault::CreatePipeline, false);
        assert!(cache.ensure_output_frame(geometry).unwrap());
    }

    #[test]
    fn teardown_invalidates_handles() {
        let (mut cache, backend) = cache();
        let counters = backend.counters();

        cache
            .ensure_output_frame(FrameGeometry::new(16, 16, DecodedFormat::I420))
            .unwrap();
        let handle = cache.take_fresh_handle().unwrap();
        cache.teardown();

        assert_eq!(counters.live(Resource::Pipeline), 0);
        let mut buf = vec![0u8; handle.image_size()];
        assert_eq!(handle.read(&mut buf), Err(HandleError::Invalidated));
        assert!(cache.take_fresh_handle().is_none());
    }

    #[test]
    fn read_checks_the_buffer_size() {
        let (mut cache, _backend) = cache();

        cache
            .ensure_output_frame(FrameGeometry::new(4, 2, DecodedFormat::I420))
            .unwrap();
        let handle = cache.take_fresh_handle().unwrap();

        let mut buf = vec![0u8; 10];
        assert_eq!(
            handle.read(&mut buf),
            Err(HandleError::SizeMismatch {
                expected: 24,
                actual: 10
            })
        );

        let mut buf = vec![0xffu8; handle.image_size()];
        handle.read(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
