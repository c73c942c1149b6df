// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Graphic buffer descriptors and the contiguous memory allocator seam.
//!
//! Buffers are shared between the consumer, the capture engine and the
//! hardware as reference counted [`BufferHandle`]s. A buffer is identified by
//! its id; the handle is only a descriptor of physically contiguous planes and
//! never maps pixel memory.

use std::{fmt, io, sync::Arc};

use crate::fourcc::FourCC;

/// Rectangle region used for sensor and zoom crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// The left-most pixel offset for the rectangle
    pub x: u32,
    /// The top-most pixel offset for the rectangle
    pub y: u32,
    /// The width in pixels of the rectangle (end position is x+width)
    pub width: u32,
    /// The height in pixels of the rectangle (end position is y+height)
    pub height: u32,
}

impl Rect {
    /// Creates a new rectangle region.
    ///
    /// # Example
    ///
    /// ```
    /// use camstream::buffer::Rect;
    ///
    /// let rect = Rect::new(0, 0, 640, 480);
    /// assert_eq!(rect.x, 0);
    /// assert_eq!(rect.width, 640);
    /// ```
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Rect::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when the rectangle lies within a `width` x `height` image.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect({}, {}, {}x{})",
            self.x, self.y, self.width, self.height
        )
    }
}

impl From<(u32, u32, u32, u32)> for Rect {
    fn from((x, y, width, height): (u32, u32, u32, u32)) -> Self {
        Rect::new(x, y, width, height)
    }
}

/// One physically contiguous plane of a graphic buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Physical (bus) address of the first byte of the plane
    pub phys: u64,
    /// Row stride in bytes
    pub stride: u32,
    /// Plane size in bytes
    pub size: usize,
}

/// Descriptor of a buffer shared between the consumer and the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicBuffer {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: FourCC,
    pub planes: Vec<Plane>,
}

/// Shared handle to a [`GraphicBuffer`].
pub type BufferHandle = Arc<GraphicBuffer>;

impl GraphicBuffer {
    /// Describes a buffer whose planes are laid out back to back starting at
    /// physical address `phys`, using the strides of `format`.
    ///
    /// ```
    /// use camstream::buffer::GraphicBuffer;
    /// use camstream::fourcc;
    ///
    /// let buf = GraphicBuffer::contiguous(7, 640, 480, fourcc::NV21, 0x1000_0000);
    /// assert_eq!(buf.planes.len(), 2);
    /// assert_eq!(buf.planes[1].phys, 0x1000_0000 + 640 * 480);
    /// ```
    pub fn contiguous(id: u64, width: u32, height: u32, format: FourCC, phys: u64) -> Self {
        let mut offset = phys;
        let planes = (0..format.plane_count())
            .map(|plane| {
                let stride = format.stride(plane, width);
                let size = stride as usize * format.plane_height(plane, height) as usize;
                let desc = Plane {
                    phys: offset,
                    stride,
                    size,
                };
                offset += size as u64;
                desc
            })
            .collect();
        GraphicBuffer {
            id,
            width,
            height,
            format,
            planes,
        }
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Total bytes across all planes.
    pub fn size(&self) -> usize {
        self.planes.iter().map(|p| p.size).sum()
    }
}

impl fmt::Display for GraphicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer#{} {}x{} {}",
            self.id, self.width, self.height, self.format
        )
    }
}

/// Physically contiguous buffer allocator.
///
/// Used by the scaling zoom transform to allocate its backing pool. Memory is
/// released when the last [`BufferHandle`] is dropped.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, width: u32, height: u32, format: FourCC) -> io::Result<BufferHandle>;
}
