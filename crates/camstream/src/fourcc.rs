// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Hardware pixel codes and their memory layout.
//!
//! Capture devices and the hardware scaler are programmed with V4L2 style
//! four character codes. Besides conversion to and from the packed `u32`
//! representation this module describes how many planes a code uses and
//! the stride and height of each plane, which is what buffer allocation and
//! crop offset calculation need.
#![forbid(unsafe_code)]

use core::fmt;

/// Luma rows are aligned to this many bytes.
pub const LUMA_ALIGN: u32 = 32;

/// Planar chroma rows are aligned to this many bytes.
pub const CHROMA_ALIGN: u32 = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

/// YUV 4:2:0 three plane, Y then Cb then Cr
pub const YU12: FourCC = FourCC(*b"YU12");

/// YUV 4:2:0 three plane, Y then Cr then Cb
pub const YV12: FourCC = FourCC(*b"YV12");

/// YUV 4:2:0 two plane, interleaved CbCr
pub const NV12: FourCC = FourCC(*b"NV12");

/// YUV 4:2:0 two plane, interleaved CrCb
pub const NV21: FourCC = FourCC(*b"NV21");

/// YUV 4:2:2 packed
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// Compressed still image, laid out as a single byte plane
pub const JPEG: FourCC = FourCC(*b"JPEG");

/// RGBA 32-bit
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// Memory organisation of a pixel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Separate Y, U and V planes with half-resolution chroma
    Planar420,
    /// Y plane followed by one interleaved half-height chroma plane
    SemiPlanar420,
    /// Single plane with two bytes per pixel
    Packed422,
    /// Single plane with four bytes per pixel
    Packed32,
    /// Single opaque byte plane
    Blob,
}

const fn align(value: u32, base: u32) -> u32 {
    (value + (base - 1)) & !(base - 1)
}

impl FourCC {
    const fn to_u32(self) -> u32 {
        #[cfg(target_endian = "little")]
        {
            ((self.0[3] as u32) << 24 & 0xff000000)
                | ((self.0[2] as u32) << 16 & 0x00ff0000)
                | ((self.0[1] as u32) << 8 & 0x0000ff00)
                | ((self.0[0] as u32) & 0x000000ff)
        }
        #[cfg(target_endian = "big")]
        {
            ((self.0[0] as u32) << 24 & 0xff000000)
                | ((self.0[1] as u32) << 16 & 0x00ff0000)
                | ((self.0[2] as u32) << 8 & 0x0000ff00)
                | ((self.0[3] as u32) & 0x000000ff)
        }
    }

    pub fn layout(&self) -> Layout {
        match *self {
            YU12 | YV12 => Layout::Planar420,
            NV12 | NV21 => Layout::SemiPlanar420,
            YUYV => Layout::Packed422,
            RGBA => Layout::Packed32,
            _ => Layout::Blob,
        }
    }

    /// Number of memory planes the hardware expects for this code.
    pub fn plane_count(&self) -> usize {
        match self.layout() {
            Layout::Planar420 => 3,
            Layout::SemiPlanar420 => 2,
            Layout::Packed422 | Layout::Packed32 | Layout::Blob => 1,
        }
    }

    /// Row stride in bytes of plane `plane` for an image `width` pixels wide.
    pub fn stride(&self, plane: usize, width: u32) -> u32 {
        match (self.layout(), plane) {
            (Layout::Planar420, 0) | (Layout::SemiPlanar420, _) => align(width, LUMA_ALIGN),
            (Layout::Planar420, _) => align(width / 2, CHROMA_ALIGN),
            (Layout::Packed422, _) => width * 2,
            (Layout::Packed32, _) => width * 4,
            (Layout::Blob, _) => width,
        }
    }

    /// Number of rows of plane `plane` for an image `height` pixels high.
    pub fn plane_height(&self, plane: usize, height: u32) -> u32 {
        match (self.layout(), plane) {
            (Layout::Planar420, 0) | (Layout::SemiPlanar420, 0) => height,
            (Layout::Planar420, _) | (Layout::SemiPlanar420, _) => height.div_ceil(2),
            _ => height,
        }
    }

    /// Total bytes needed for all planes of a `width` x `height` image.
    pub fn image_size(&self, width: u32, height: u32) -> usize {
        (0..self.plane_count())
            .map(|plane| {
                self.stride(plane, width) as usize * self.plane_height(plane, height) as usize
            })
            .sum()
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(buf: &[u8; 4]) -> FourCC {
        FourCC(*buf)
    }
}

impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        #[cfg(target_endian = "little")]
        {
            FourCC(val.to_le_bytes())
        }
        #[cfg(target_endian = "big")]
        {
            FourCC(val.to_be_bytes())
        }
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        val.to_u32()
    }
}

impl std::str::FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(format!("FOURCC must be exactly 4 characters: {}", s));
        }
        Ok(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                // Returning fmt::Error would make format!() panic
                let b = &self.0;
                write!(
                    f,
                    "{}{}{}{}",
                    core::ascii::escape_default(b[0]),
                    core::ascii::escape_default(b[1]),
                    core::ascii::escape_default(b[2]),
                    core::ascii::escape_default(b[3])
                )
            }
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FourCC")
            .field(&format_args!("{}", self))
            .finish()
    }
}
