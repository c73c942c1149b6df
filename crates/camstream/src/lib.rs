// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camera Stream Manager for Rust
//!
//! This library turns a requested output format into a running hardware video
//! stream. Each active stream owns a dedicated capture thread which drives the
//! handshake between a capture device's buffer ring and a consumer-side buffer
//! queue, optionally inserting a crop and scale ("zoom") step between the two.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use camstream::format::PixelFormat;
//! use camstream::manager::{CaptureRequest, CaptureSettings, ManagerConfig, StreamManager};
//! use camstream::sim::{VirtualAllocator, VirtualConsumer, VirtualDeviceProvider, VirtualScaler};
//!
//! let manager = StreamManager::new(
//!     ManagerConfig::default(),
//!     Arc::new(VirtualDeviceProvider::new()),
//!     Arc::new(VirtualAllocator::new()),
//!     Arc::new(VirtualScaler::new()),
//! );
//!
//! let (consumer, probe) = VirtualConsumer::new();
//! let preview = manager.allocate_stream(
//!     1280,
//!     720,
//!     PixelFormat::ImplementationDefined,
//!     Box::new(consumer),
//!     false,
//! )?;
//!
//! manager.submit_request(&CaptureRequest::new(
//!     Some(CaptureSettings::default()),
//!     vec![preview.stream_id],
//! ))?;
//! println!("delivered {} frames", probe.frame_count());
//! # Ok::<(), camstream::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`manager::StreamManager`] maps formats to [`role::StreamRole`]s and owns
//!   the live set of capture engines.
//! - [`engine::CaptureEngine`] owns one hardware device, one zoom transform and
//!   one bound [`queue::BufferQueue`], and runs the capture thread.
//! - [`zoom`] provides the passthrough and scaling transforms.
//! - [`device`], [`queue::ConsumerOps`], [`buffer::BufferAllocator`] and
//!   [`zoom::Scaler`] are the seams to the hardware and the consumer.
//! - [`sim`] implements every seam in memory for tests and simulation.

use std::{
    error, fmt, io,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use role::StreamRole;

/// Error type for camera stream operations
#[derive(Debug)]
pub enum Error {
    /// The requested pixel format does not map to any stream role
    UnsupportedFormat(i32),

    /// A capture engine already owns the stream id
    AlreadyExists(StreamRole),

    /// A buffer, backing pool or queue allocation failed
    NoMemory(String),

    /// A required binding or prerequisite is missing
    NotInitialized(String),

    /// A hardware capture device operation failed
    Hardware {
        /// Name of the device operation which failed
        op: &'static str,
        /// Error reported by the device
        source: io::Error,
    },

    /// The consumer had no free buffer when the producer needed one
    ConsumerStarved(io::Error),

    /// The consumer buffer protocol was violated
    Consumer(String),

    /// The operation is not valid in the current engine state
    InvalidState(String),

    /// I/O error from a collaborator which is not otherwise classified
    Io(io::Error),
}

/// Classification of [`Error`] values by how the failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unrecognised format, duplicate stream or invalid request
    Configuration,
    /// Backing pool or queue allocation failure
    ResourceExhaustion,
    /// Device programming or steady-state ioctl failure
    HardwareIo,
    /// Consumer ring starved or misused
    ConsumerProtocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::ResourceExhaustion => write!(f, "resource exhaustion"),
            ErrorKind::HardwareIo => write!(f, "hardware I/O"),
            ErrorKind::ConsumerProtocol => write!(f, "consumer protocol"),
        }
    }
}

/// Status codes reported to the HAL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidOperation,
    AlreadyExists,
    NoMemory,
    NoInit,
}

impl Status {
    /// Negative errno value as used by camera HAL entry points.
    pub fn code(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::InvalidOperation => -38,
            Status::AlreadyExists => -17,
            Status::NoMemory => -12,
            Status::NoInit => -19,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::InvalidOperation => write!(f, "INVALID_OPERATION"),
            Status::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            Status::NoMemory => write!(f, "NO_MEMORY"),
            Status::NoInit => write!(f, "NO_INIT"),
        }
    }
}

impl Error {
    /// Wraps a device error with the name of the failing operation.
    pub fn hardware(op: &'static str, source: io::Error) -> Self {
        Error::Hardware { op, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedFormat(_) | Error::AlreadyExists(_) | Error::InvalidState(_) => {
                ErrorKind::Configuration
            }
            Error::NoMemory(_) => ErrorKind::ResourceExhaustion,
            Error::NotInitialized(_) | Error::Hardware { .. } | Error::Io(_) => {
                ErrorKind::HardwareIo
            }
            Error::ConsumerStarved(_) | Error::Consumer(_) => ErrorKind::ConsumerProtocol,
        }
    }

    /// Status code to report for this error at the allocation boundary.
    pub fn status(&self) -> Status {
        match self {
            Error::UnsupportedFormat(_) | Error::InvalidState(_) => Status::InvalidOperation,
            Error::AlreadyExists(_) => Status::AlreadyExists,
            Error::NoMemory(_) => Status::NoMemory,
            Error::NotInitialized(_)
            | Error::Hardware { .. }
            | Error::ConsumerStarved(_)
            | Error::Consumer(_)
            | Error::Io(_) => Status::NoInit,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnsupportedFormat(raw) => {
                write!(f, "unsupported pixel format: 0x{:x}", raw)
            }
            Error::AlreadyExists(role) => write!(f, "{} stream already exists", role),
            Error::NoMemory(msg) => write!(f, "out of memory: {}", msg),
            Error::NotInitialized(msg) => write!(f, "not initialized: {}", msg),
            Error::Hardware { op, source } => write!(f, "device {} failed: {}", op, source),
            Error::ConsumerStarved(err) => write!(f, "consumer ring starved: {}", err),
            Error::Consumer(msg) => write!(f, "consumer protocol error: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Hardware { source, .. } => Some(source),
            Error::ConsumerStarved(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// The fourcc module provides portable handling of hardware pixel codes.
pub mod fourcc;

/// The format module maps consumer pixel formats and usage hints.
pub mod format;

/// The role module resolves requested formats to stream roles.
pub mod role;

/// The buffer module provides graphic buffer descriptors and allocation.
pub mod buffer;

/// The device module defines the hardware capture device interface.
pub mod device;

/// The queue module provides the consumer-facing buffer queue.
pub mod queue;

/// The zoom module provides the passthrough and scaling transforms.
pub mod zoom;

/// The engine module provides the per-stream capture thread.
pub mod engine;

/// The manager module owns the live set of streams.
pub mod manager;

/// The sim module provides virtual hardware for tests and simulation.
pub mod sim;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start of the monotonic clock and the wall-clock time it was read at, in
/// nanoseconds since the Unix epoch.
static CLOCK_EPOCH: OnceLock<(Instant, i64)> = OnceLock::new();

fn clock_epoch() -> &'static (Instant, i64) {
    CLOCK_EPOCH.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        (Instant::now(), wall)
    })
}

/// Get the current monotonic timestamp in nanoseconds
///
/// The clock starts at the first call within the process and never goes
/// backwards.
pub fn timestamp() -> i64 {
    let (epoch, _) = clock_epoch();
    i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Convert a [`timestamp()`] reading into wall-clock Unix time.
///
/// The monotonic clock is anchored to the system clock once, when it
/// starts, so later wall-clock adjustments do not move converted values.
pub fn to_timestamp(ns: i64) -> unix_ts::Timestamp {
    let (_, wall_epoch) = clock_epoch();
    let unix_ns = wall_epoch.saturating_add(ns);
    let secs = unix_ns.div_euclid(1_000_000_000);
    let nanos = unix_ns.rem_euclid(1_000_000_000) as u32;
    unix_ts::Timestamp::new(secs, nanos)
}
