// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Consumer pixel formats and buffer usage hints.
//!
//! Stream allocation is requested in terms of the graphics HAL pixel formats
//! the framework speaks. Each format is mapped to the [`FourCC`] layout its
//! buffers are allocated with.

use std::fmt;

use crate::fourcc::{self, FourCC};

const HAL_PIXEL_FORMAT_RGBA_8888: i32 = 0x1;
const HAL_PIXEL_FORMAT_YCRCB_420_SP: i32 = 0x11;
const HAL_PIXEL_FORMAT_BLOB: i32 = 0x21;
const HAL_PIXEL_FORMAT_IMPLEMENTATION_DEFINED: i32 = 0x22;
const HAL_PIXEL_FORMAT_YCBCR_420_888: i32 = 0x23;
const HAL_PIXEL_FORMAT_YV12: i32 = 0x3231_5659;
const CAMERA2_HAL_PIXEL_FORMAT_ZSL: i32 = -1;

/// Pixel format requested by, or reported to, a stream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Opaque format chosen by the HAL, used for hardware preview
    ImplementationDefined,
    /// Planar YUV 4:2:0, Y then Cr then Cb
    Yv12,
    /// Semi-planar YUV 4:2:0 with interleaved CrCb (NV21)
    YCrCb420Sp,
    /// Flexible YUV 4:2:0
    YCbCr420Flexible,
    /// Compressed data such as JPEG
    Blob,
    /// Zero-shutter-lag tagged format
    Zsl,
    /// RGBA 8888
    Rgba8888,
    /// Any other raw format value
    Other(i32),
}

impl PixelFormat {
    /// Convert from the raw HAL value
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            HAL_PIXEL_FORMAT_IMPLEMENTATION_DEFINED => PixelFormat::ImplementationDefined,
            HAL_PIXEL_FORMAT_YV12 => PixelFormat::Yv12,
            HAL_PIXEL_FORMAT_YCRCB_420_SP => PixelFormat::YCrCb420Sp,
            HAL_PIXEL_FORMAT_YCBCR_420_888 => PixelFormat::YCbCr420Flexible,
            HAL_PIXEL_FORMAT_BLOB => PixelFormat::Blob,
            CAMERA2_HAL_PIXEL_FORMAT_ZSL => PixelFormat::Zsl,
            HAL_PIXEL_FORMAT_RGBA_8888 => PixelFormat::Rgba8888,
            other => PixelFormat::Other(other),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            PixelFormat::ImplementationDefined => HAL_PIXEL_FORMAT_IMPLEMENTATION_DEFINED,
            PixelFormat::Yv12 => HAL_PIXEL_FORMAT_YV12,
            PixelFormat::YCrCb420Sp => HAL_PIXEL_FORMAT_YCRCB_420_SP,
            PixelFormat::YCbCr420Flexible => HAL_PIXEL_FORMAT_YCBCR_420_888,
            PixelFormat::Blob => HAL_PIXEL_FORMAT_BLOB,
            PixelFormat::Zsl => CAMERA2_HAL_PIXEL_FORMAT_ZSL,
            PixelFormat::Rgba8888 => HAL_PIXEL_FORMAT_RGBA_8888,
            PixelFormat::Other(raw) => *raw,
        }
    }

    /// True for planar or semi-planar YUV formats software can read.
    pub fn is_software_yuv(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yv12 | PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420Flexible
        )
    }

    /// Memory layout used when allocating buffers of this format.
    ///
    /// Opaque and ZSL buffers are laid out as planar YUV, which is what the
    /// capture hardware writes for preview.
    pub fn fourcc(&self) -> FourCC {
        match self {
            PixelFormat::ImplementationDefined | PixelFormat::Zsl | PixelFormat::Yv12 => {
                fourcc::YV12
            }
            PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420Flexible => fourcc::NV21,
            PixelFormat::Rgba8888 => fourcc::RGBA,
            PixelFormat::Blob | PixelFormat::Other(_) => fourcc::JPEG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::ImplementationDefined => "IMPLEMENTATION_DEFINED",
            PixelFormat::Yv12 => "YV12",
            PixelFormat::YCrCb420Sp => "YCrCb_420_SP",
            PixelFormat::YCbCr420Flexible => "YCbCr_420_888",
            PixelFormat::Blob => "BLOB",
            PixelFormat::Zsl => "ZSL",
            PixelFormat::Rgba8888 => "RGBA_8888",
            PixelFormat::Other(_) => "OTHER",
        }
    }

    /// Every named format, in role table order.
    pub fn known() -> &'static [PixelFormat] {
        &[
            PixelFormat::ImplementationDefined,
            PixelFormat::Yv12,
            PixelFormat::YCrCb420Sp,
            PixelFormat::YCbCr420Flexible,
            PixelFormat::Blob,
            PixelFormat::Zsl,
            PixelFormat::Rgba8888,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Other(raw) => write!(f, "OTHER(0x{:x})", raw),
            named => write!(f, "{}", named.name()),
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    /// Parses a format name (case-insensitive) or a raw `0x` prefixed value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        if let Some(hex) = upper.strip_prefix("0X") {
            return i32::from_str_radix(hex, 16)
                .map(PixelFormat::from_raw)
                .map_err(|_| format!("Invalid raw pixel format: {}", s));
        }
        let format = match upper.as_str() {
            "IMPLEMENTATION_DEFINED" | "OPAQUE" => PixelFormat::ImplementationDefined,
            "YV12" => PixelFormat::Yv12,
            "YCRCB_420_SP" | "NV21" => PixelFormat::YCrCb420Sp,
            "YCBCR_420_888" => PixelFormat::YCbCr420Flexible,
            "BLOB" | "JPEG" => PixelFormat::Blob,
            "ZSL" => PixelFormat::Zsl,
            "RGBA_8888" | "RGBA" => PixelFormat::Rgba8888,
            _ => return Err(format!("Unknown pixel format: {}", s)),
        };
        Ok(format)
    }
}

/// Gralloc style buffer usage bits reported back to the consumer.
pub mod usage {
    pub const SW_READ_OFTEN: u32 = 0x0000_0003;
    pub const SW_WRITE_OFTEN: u32 = 0x0000_0030;
    pub const HW_TEXTURE: u32 = 0x0000_0100;
    pub const HW_COMPOSER: u32 = 0x0000_0800;
    pub const HW_VIDEO_ENCODER: u32 = 0x0001_0000;
    pub const HW_CAMERA_WRITE: u32 = 0x0002_0000;
}
