// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Zoom transforms between the hardware ring and the consumer ring.
//!
//! When the sensor already frames the requested output the capture hardware
//! writes straight into consumer buffers ([`PassthroughZoom`]). Otherwise the
//! hardware writes into a fixed pool of backing buffers and every completed
//! frame is cropped and scaled into a consumer buffer by the hardware scaler
//! ([`ScalingZoom`]).

use std::{io, sync::Arc};

use log::debug;

use crate::{
    buffer::{BufferAllocator, BufferHandle, GraphicBuffer, Rect},
    fourcc::{FourCC, Layout},
    Error,
};

/// Active pixel array of the sensor and the region currently cropped from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    pub base_width: u32,
    pub base_height: u32,
    /// Crop in base coordinates
    pub crop: Rect,
}

impl SensorGeometry {
    /// Geometry of a `base_width` x `base_height` sensor with no crop.
    pub fn new(base_width: u32, base_height: u32) -> Self {
        SensorGeometry {
            base_width,
            base_height,
            crop: Rect::full(base_width, base_height),
        }
    }

    /// Replace the crop, which must lie within the base area.
    pub fn with_crop(mut self, crop: Rect) -> Result<Self, Error> {
        ScalingZoom::check_crop(self.base_width, self.base_height, crop)?;
        self.crop = crop;
        Ok(self)
    }
}

impl Default for SensorGeometry {
    fn default() -> Self {
        SensorGeometry::new(1920, 1080)
    }
}

/// Crop and scale step applied to each captured frame.
///
/// The capture engine's steady-state loop is written once against this trait
/// and only branches on [`ZoomTransform::uses_transform`].
pub trait ZoomTransform: Send {
    /// True when captured frames go through a backing pool and
    /// [`ZoomTransform::apply`].
    fn uses_transform(&self) -> bool;

    /// Allocate `count` backing buffers of the given geometry. The pool is
    /// allocated at most once and never resized.
    fn allocate_backing_pool(
        &mut self,
        count: usize,
        width: u32,
        height: u32,
        format: FourCC,
    ) -> Result<(), Error>;

    fn backing_pool_size(&self) -> usize;

    /// Backing buffer for hardware ring slot `index`.
    fn backing_buffer(&self, index: usize) -> Option<BufferHandle>;

    /// Crop and scale `source` into `destination`.
    fn apply(&mut self, source: &BufferHandle, destination: &BufferHandle) -> Result<(), Error>;

    /// Free the backing pool.
    fn release_backing_pool(&mut self);

    /// Source crop in sensor base coordinates, if the transform crops.
    fn crop(&self) -> Option<Rect>;

    /// Replace the source crop, given in sensor base coordinates.
    fn set_crop(&mut self, crop: Rect) -> Result<(), Error>;
}

/// Transform used when the hardware already produces the target geometry.
#[derive(Debug, Default)]
pub struct PassthroughZoom;

impl PassthroughZoom {
    pub fn new() -> Self {
        PassthroughZoom
    }
}

impl ZoomTransform for PassthroughZoom {
    fn uses_transform(&self) -> bool {
        false
    }

    fn allocate_backing_pool(
        &mut self,
        _count: usize,
        _width: u32,
        _height: u32,
        _format: FourCC,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn backing_pool_size(&self) -> usize {
        0
    }

    fn backing_buffer(&self, _index: usize) -> Option<BufferHandle> {
        None
    }

    fn apply(&mut self, _source: &BufferHandle, _destination: &BufferHandle) -> Result<(), Error> {
        Err(Error::InvalidState(
            "passthrough zoom has no transform".to_string(),
        ))
    }

    fn release_backing_pool(&mut self) {}

    fn crop(&self) -> Option<Rect> {
        None
    }

    fn set_crop(&mut self, _crop: Rect) -> Result<(), Error> {
        Ok(())
    }
}

/// Hardware scaler interface.
pub trait Scaler: Send + Sync {
    fn run(&self, job: &ScaleJob) -> io::Result<()>;
}

/// One crop and scale operation for the hardware scaler.
///
/// Source plane addresses are already advanced to the crop origin, so the
/// scaler reads `src_width` x `src_height` pixels starting at `src_phys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleJob {
    pub src_phys: Vec<u64>,
    pub src_stride: Vec<u32>,
    pub src_width: u32,
    pub src_height: u32,
    pub src_format: FourCC,
    pub dst_phys: Vec<u64>,
    pub dst_stride: Vec<u32>,
    pub dst_width: u32,
    pub dst_height: u32,
    pub dst_format: FourCC,
}

const fn align16(value: u64) -> u64 {
    (value + 15) & !15
}

impl ScaleJob {
    /// Build the job scaling the `crop` region of `source` onto the whole of
    /// `destination`.
    ///
    /// ```
    /// use camstream::buffer::{GraphicBuffer, Rect};
    /// use camstream::fourcc;
    /// use camstream::zoom::ScaleJob;
    ///
    /// let src = GraphicBuffer::contiguous(1, 1280, 720, fourcc::YV12, 0x1000_0000);
    /// let dst = GraphicBuffer::contiguous(2, 640, 360, fourcc::YV12, 0x2000_0000);
    /// let job = ScaleJob::new(&src, &dst, Rect::new(0, 0, 1280, 720));
    /// assert_eq!(job.src_phys[0], 0x1000_0000);
    /// assert_eq!(job.dst_width, 640);
    /// ```
    pub fn new(source: &GraphicBuffer, destination: &GraphicBuffer, crop: Rect) -> Self {
        let layout = source.format.layout();
        let shifted = crop.x > 0 || crop.y > 0;
        let left = crop.x as u64;
        let top = crop.y as u64;

        let src_phys = source
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| {
                if !shifted {
                    return plane.phys;
                }
                let stride = plane.stride as u64;
                let offset = match (layout, i) {
                    (Layout::Packed422, _) => top * stride + (left << 1),
                    (Layout::Packed32, _) => top * stride + (left << 2),
                    (_, 0) => top * stride + left,
                    (Layout::Planar420, _) => (top >> 1) * stride + (left >> 1),
                    (Layout::SemiPlanar420, _) => (top >> 1) * stride + left,
                    (Layout::Blob, _) => top * stride + left,
                };
                align16(plane.phys + offset)
            })
            .collect();

        ScaleJob {
            src_phys,
            src_stride: source.planes.iter().map(|p| p.stride).collect(),
            src_width: crop.width,
            src_height: crop.height,
            src_format: source.format,
            dst_phys: destination.planes.iter().map(|p| p.phys).collect(),
            dst_stride: destination.planes.iter().map(|p| p.stride).collect(),
            dst_width: destination.width,
            dst_height: destination.height,
            dst_format: destination.format,
        }
    }
}

/// Transform which crops and scales from a backing pool into consumer buffers.
pub struct ScalingZoom {
    allocator: Arc<dyn BufferAllocator>,
    scaler: Arc<dyn Scaler>,
    base_width: u32,
    base_height: u32,
    crop: Rect,
    pool: Vec<BufferHandle>,
}

impl ScalingZoom {
    /// Create a scaling transform for a sensor of `base_width` x
    /// `base_height` pixels, cropping `crop` (in base coordinates).
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        scaler: Arc<dyn Scaler>,
        base_width: u32,
        base_height: u32,
        crop: Rect,
    ) -> Result<Self, Error> {
        Self::check_crop(base_width, base_height, crop)?;
        Ok(ScalingZoom {
            allocator,
            scaler,
            base_width,
            base_height,
            crop,
            pool: Vec::new(),
        })
    }

    fn check_crop(base_width: u32, base_height: u32, crop: Rect) -> Result<(), Error> {
        if base_width == 0 || base_height == 0 {
            return Err(Error::InvalidState(format!(
                "sensor base {}x{} is empty",
                base_width, base_height
            )));
        }
        if crop.is_empty() || !crop.fits(base_width, base_height) {
            return Err(Error::InvalidState(format!(
                "{} outside sensor base {}x{}",
                crop, base_width, base_height
            )));
        }
        Ok(())
    }

    pub fn base_width(&self) -> u32 {
        self.base_width
    }

    pub fn base_height(&self) -> u32 {
        self.base_height
    }

    /// Map the crop from sensor base coordinates onto a `width` x `height`
    /// captured image.
    pub fn mapped_crop(&self, width: u32, height: u32) -> Rect {
        let sx = |v: u32| (v as u64 * width as u64 / self.base_width as u64) as u32;
        let sy = |v: u32| (v as u64 * height as u64 / self.base_height as u64) as u32;
        Rect::new(
            sx(self.crop.x),
            sy(self.crop.y),
            sx(self.crop.width).max(1),
            sy(self.crop.height).max(1),
        )
    }
}

impl ZoomTransform for ScalingZoom {
    fn uses_transform(&self) -> bool {
        true
    }

    fn allocate_backing_pool(
        &mut self,
        count: usize,
        width: u32,
        height: u32,
        format: FourCC,
    ) -> Result<(), Error> {
        if !self.pool.is_empty() {
            return Err(Error::InvalidState(format!(
                "backing pool already holds {} buffers",
                self.pool.len()
            )));
        }
        if count == 0 {
            return Err(Error::NoMemory("empty backing pool".to_string()));
        }

        let mut pool = Vec::with_capacity(count);
        for index in 0..count {
            let buffer = self
                .allocator
                .allocate(width, height, format)
                .map_err(|e| {
                    Error::NoMemory(format!("backing buffer {} of {}: {}", index, count, e))
                })?;
            pool.push(buffer);
        }
        self.pool = pool;

        debug!(
            "allocated backing pool: {} x {}x{} {}",
            count, width, height, format
        );
        Ok(())
    }

    fn backing_pool_size(&self) -> usize {
        self.pool.len()
    }

    fn backing_buffer(&self, index: usize) -> Option<BufferHandle> {
        self.pool.get(index).cloned()
    }

    fn apply(&mut self, source: &BufferHandle, destination: &BufferHandle) -> Result<(), Error> {
        let crop = self.mapped_crop(source.width, source.height);
        let job = ScaleJob::new(source, destination, crop);
        self.scaler
            .run(&job)
            .map_err(|e| Error::hardware("scale", e))
    }

    fn release_backing_pool(&mut self) {
        if !self.pool.is_empty() {
            debug!("releasing backing pool of {} buffers", self.pool.len());
        }
        self.pool.clear();
    }

    fn crop(&self) -> Option<Rect> {
        Some(self.crop)
    }

    fn set_crop(&mut self, crop: Rect) -> Result<(), Error> {
        Self::check_crop(self.base_width, self.base_height, crop)?;
        self.crop = crop;
        Ok(())
    }
}
