// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-role capture policy.
//!
//! The four capture engines share one state machine and differ only in the
//! pixel formats they produce, the usage reported to the consumer, the size
//! of their buffer rings and where frame timestamps come from.

use crate::{
    format::{usage, PixelFormat},
    fourcc::FourCC,
    role::StreamRole,
};

use super::TimestampSource;

/// Policy hooks of one concrete capture engine.
pub trait CaptureVariant: Send + Sync {
    fn role(&self) -> StreamRole;

    /// Format of the buffers the consumer receives.
    fn pixel_format(&self) -> PixelFormat;

    /// Pixel code the capture hardware is programmed with.
    fn hardware_format(&self) -> FourCC {
        self.pixel_format().fourcc()
    }

    /// Usage bits reported to the consumer for its buffers.
    fn usage(&self) -> u32;

    /// Size of the consumer buffer ring.
    fn max_buffers(&self) -> usize;

    /// Timestamp source used when the configuration does not choose one.
    fn timestamp_source(&self) -> TimestampSource {
        TimestampSource::Monotonic
    }
}

/// Continuous preview for the display.
#[derive(Debug, Default)]
pub struct PreviewVariant;

impl CaptureVariant for PreviewVariant {
    fn role(&self) -> StreamRole {
        StreamRole::Preview
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Yv12
    }

    fn usage(&self) -> u32 {
        usage::HW_CAMERA_WRITE | usage::HW_TEXTURE | usage::HW_COMPOSER
    }

    fn max_buffers(&self) -> usize {
        6
    }
}

/// Video recording feeding an encoder.
#[derive(Debug, Default)]
pub struct RecordVariant;

impl CaptureVariant for RecordVariant {
    fn role(&self) -> StreamRole {
        StreamRole::Record
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Yv12
    }

    fn usage(&self) -> u32 {
        usage::HW_CAMERA_WRITE | usage::HW_VIDEO_ENCODER
    }

    fn max_buffers(&self) -> usize {
        6
    }

    // Encoders need sensor time to keep audio and video in sync
    fn timestamp_source(&self) -> TimestampSource {
        TimestampSource::Hardware
    }
}

/// Still image capture.
#[derive(Debug, Default)]
pub struct StillVariant;

impl CaptureVariant for StillVariant {
    fn role(&self) -> StreamRole {
        StreamRole::Capture
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Blob
    }

    fn usage(&self) -> u32 {
        usage::HW_CAMERA_WRITE | usage::SW_READ_OFTEN | usage::SW_WRITE_OFTEN
    }

    fn max_buffers(&self) -> usize {
        2
    }
}

/// Software-readable YUV frames for application callbacks.
#[derive(Debug)]
pub struct CallbackVariant {
    format: PixelFormat,
}

impl CallbackVariant {
    /// Flexible YUV is delivered as NV21, the other YUV formats as requested.
    pub fn new(requested: PixelFormat) -> Self {
        let format = match requested {
            PixelFormat::Yv12 => PixelFormat::Yv12,
            _ => PixelFormat::YCrCb420Sp,
        };
        CallbackVariant { format }
    }
}

impl CaptureVariant for CallbackVariant {
    fn role(&self) -> StreamRole {
        StreamRole::Callback
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn usage(&self) -> u32 {
        usage::HW_CAMERA_WRITE | usage::SW_READ_OFTEN
    }

    fn max_buffers(&self) -> usize {
        4
    }
}

/// Capture policy for a role which owns an engine. ZSL and invalid roles
/// have none.
pub fn variant_for(role: StreamRole, requested: PixelFormat) -> Option<Box<dyn CaptureVariant>> {
    match role {
        StreamRole::Preview => Some(Box::new(PreviewVariant)),
        StreamRole::Record => Some(Box::new(RecordVariant)),
        StreamRole::Capture => Some(Box::new(StillVariant)),
        StreamRole::Callback => Some(Box::new(CallbackVariant::new(requested))),
        StreamRole::Zsl | StreamRole::Invalid => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc;

    #[test]
    fn test_variant_for_roles() {
        for role in StreamRole::engine_roles() {
            let variant = variant_for(role, PixelFormat::ImplementationDefined).unwrap();
            assert_eq!(variant.role(), role);
            assert!(variant.max_buffers() > 0);
            assert_ne!(variant.usage() & usage::HW_CAMERA_WRITE, 0);
        }
        assert!(variant_for(StreamRole::Zsl, PixelFormat::Zsl).is_none());
        assert!(variant_for(StreamRole::Invalid, PixelFormat::Rgba8888).is_none());
    }

    #[test]
    fn test_timestamp_defaults() {
        assert_eq!(
            PreviewVariant.timestamp_source(),
            TimestampSource::Monotonic
        );
        assert_eq!(RecordVariant.timestamp_source(), TimestampSource::Hardware);
    }

    #[test]
    fn test_callback_formats() {
        let yv12 = CallbackVariant::new(PixelFormat::Yv12);
        assert_eq!(yv12.pixel_format(), PixelFormat::Yv12);
        assert_eq!(yv12.hardware_format(), fourcc::YV12);

        let flex = CallbackVariant::new(PixelFormat::YCbCr420Flexible);
        assert_eq!(flex.pixel_format(), PixelFormat::YCrCb420Sp);
        assert_eq!(flex.hardware_format(), fourcc::NV21);
        assert_ne!(flex.usage() & usage::SW_READ_OFTEN, 0);
    }
}
