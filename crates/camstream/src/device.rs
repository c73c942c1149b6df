// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Hardware capture device interface
//!
//! A capture device is a V4L2 style video node with a ring of hardware
//! buffers. Each capture engine opens exactly one device through a
//! [`DeviceProvider`] and is the only code which drives its ioctl sequence:
//!
//! 1. [`CaptureDevice::set_format`] and [`CaptureDevice::set_crop`]
//! 2. [`CaptureDevice::request_buffers`] followed by one
//!    [`CaptureDevice::submit_buffer`] per ring slot
//! 3. [`CaptureDevice::start_streaming`]
//! 4. [`CaptureDevice::wait_completed_buffer`] / re-submit, repeated
//! 5. [`CaptureDevice::stop_streaming`]
//!
//! Every method returns [`std::io::Result`] in the manner of an ioctl
//! wrapper; the capture engine decides which failures are fatal.

use std::{fmt, io, time::Duration};

use crate::{
    buffer::{BufferHandle, Rect},
    fourcc::FourCC,
};

/// Identifier of a capture device node, `/dev/video{N}` on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn path(&self) -> String {
        format!("/dev/video{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "video{}", self.0)
    }
}

/// One open hardware capture device.
///
/// The device is moved into its capture engine's thread and is never shared.
pub trait CaptureDevice: Send {
    /// Program the output geometry and pixel code.
    fn set_format(&mut self, width: u32, height: u32, format: FourCC) -> io::Result<()>;

    /// Program the sensor region the device captures from.
    fn set_crop(&mut self, crop: Rect) -> io::Result<()>;

    /// Size the hardware buffer ring.
    fn request_buffers(&mut self, count: usize) -> io::Result<()>;

    /// Queue `buffer` into ring slot `index`.
    ///
    /// `fence` is an optional acquire fence file descriptor which must signal
    /// before the hardware may write the buffer.
    fn submit_buffer(
        &mut self,
        plane_count: usize,
        index: usize,
        buffer: &BufferHandle,
        fence: Option<i32>,
    ) -> io::Result<()>;

    /// Wait up to `timeout` for the hardware to complete a buffer.
    ///
    /// Returns the ring slot of the completed buffer, or `None` when the
    /// timeout elapsed first.
    fn wait_completed_buffer(
        &mut self,
        plane_count: usize,
        timeout: Duration,
    ) -> io::Result<Option<usize>>;

    fn start_streaming(&mut self) -> io::Result<()>;

    fn stop_streaming(&mut self) -> io::Result<()>;

    /// Capture timestamp in nanoseconds of the most recently completed
    /// buffer, as reported by the hardware on the [`crate::timestamp`]
    /// clock.
    fn capture_timestamp(&mut self) -> io::Result<i64>;
}

/// Opens capture devices by id.
pub trait DeviceProvider: Send + Sync {
    fn open(&self, id: DeviceId) -> io::Result<Box<dyn CaptureDevice>>;
}
