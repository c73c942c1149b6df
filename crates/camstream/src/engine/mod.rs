// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-stream capture engine
//!
//! A [`CaptureEngine`] owns one hardware capture device, one
//! [`ZoomTransform`] and exactly one bound [`BufferQueue`]. It moves through
//! the states
//!
//! ```text
//! Created --ready_to_run--> Ready --start--> Running --> Stopped | Failed
//! ```
//!
//! Setup ([`CaptureEngine::ready_to_run`]) runs on the caller's thread and
//! reports failures synchronously. Once running, a dedicated thread waits for
//! completed hardware buffers, hands each frame to the consumer (through the
//! zoom transform when it scales) and re-submits a buffer to the hardware, so
//! the number of buffers in flight stays constant. Steady-state failures end
//! only that thread and are reported to the owning manager as a
//! [`StreamEvent::Failed`].

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};

use crate::{
    buffer::{BufferHandle, Rect},
    device::{CaptureDevice, DeviceId},
    format::PixelFormat,
    fourcc::FourCC,
    lock,
    manager::{ManagerShared, StreamEvent},
    queue::BufferQueue,
    role::StreamRole,
    zoom::{SensorGeometry, ZoomTransform},
    Error,
};

pub mod variant;

use variant::CaptureVariant;

/// Default bound on each hardware completion wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default number of consecutive failed completion waits tolerated.
pub const DEFAULT_MAX_WAIT_ERRORS: u32 = 8;

/// Where frame timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampSource {
    /// The process monotonic clock, read when the frame is delivered
    Monotonic,
    /// The capture time reported by the device
    Hardware,
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampSource::Monotonic => write!(f, "monotonic"),
            TimestampSource::Hardware => write!(f, "hardware"),
        }
    }
}

impl std::str::FromStr for TimestampSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monotonic" | "system" => Ok(TimestampSource::Monotonic),
            "hardware" | "sensor" => Ok(TimestampSource::Hardware),
            _ => Err(format!("Unknown timestamp source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Created,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopConfig {
    timestamp_source: TimestampSource,
    poll_timeout: Duration,
    max_wait_errors: u32,
}

enum Step {
    Frame(i64),
    Idle,
}

/// State shared between the engine handle and its capture thread.
struct EngineStatus {
    state: Mutex<EngineState>,
    stop: AtomicBool,
    frames: AtomicU64,
    last_timestamp: AtomicI64,
    zoom_crop: Mutex<Option<Rect>>,
}

impl EngineStatus {
    fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    fn set_state(&self, role: StreamRole, state: EngineState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("{} engine {} -> {}", role, *current, state);
            *current = state;
        }
    }
}

/// Everything the capture thread owns while it runs.
struct EngineCore {
    role: StreamRole,
    width: u32,
    height: u32,
    format: FourCC,
    plane_count: usize,
    device: Box<dyn CaptureDevice>,
    zoom: Box<dyn ZoomTransform>,
    queue: Option<BufferQueue>,
    ring: usize,
    slots: Vec<Option<BufferHandle>>,
    streaming: bool,
    wait_errors: u32,
}

impl EngineCore {
    fn ready_to_run(&mut self, sensor: &SensorGeometry) -> Result<(), Error> {
        let role = self.role;
        let queue = self
            .queue
            .as_mut()
            .ok_or_else(|| Error::NotInitialized(format!("{} has no bound buffer queue", role)))?;
        queue.init_buffer()?;

        let zoomed = self.zoom.uses_transform();
        let hardware_crop = if zoomed {
            self.zoom.set_crop(sensor.crop)?;
            Rect::full(sensor.base_width, sensor.base_height)
        } else {
            sensor.crop
        };

        self.device
            .set_format(self.width, self.height, self.format)
            .map_err(|e| Error::hardware("set_format", e))?;
        self.device
            .set_crop(hardware_crop)
            .map_err(|e| Error::hardware("set_crop", e))?;

        if zoomed {
            let count = queue.max_buffers();
            self.zoom
                .allocate_backing_pool(count, self.width, self.height, self.format)?;
            self.device
                .request_buffers(count)
                .map_err(|e| Error::hardware("request_buffers", e))?;
            for index in 0..count {
                let buffer = self.zoom.backing_buffer(index).ok_or_else(|| {
                    Error::NoMemory(format!("backing buffer {} of {} missing", index, count))
                })?;
                self.device
                    .submit_buffer(self.plane_count, index, &buffer, None)
                    .map_err(|e| Error::hardware("submit_buffer", e))?;
            }
            self.ring = count;
            self.slots = vec![None; count];
        } else {
            let count = queue.queued_count();
            self.device
                .request_buffers(count)
                .map_err(|e| Error::hardware("request_buffers", e))?;
            self.slots = vec![None; count];
            // Submitted last to first; slot i still maps to queued buffer i
            for index in (0..count).rev() {
                let buffer = queue.queued_buffer(index).ok_or_else(|| {
                    Error::NotInitialized(format!("{} queued buffer {} missing", role, index))
                })?;
                self.device
                    .submit_buffer(self.plane_count, index, &buffer, None)
                    .map_err(|e| Error::hardware("submit_buffer", e))?;
                self.slots[index] = Some(buffer);
            }
            self.ring = count;
        }

        self.device
            .start_streaming()
            .map_err(|e| Error::hardware("start_streaming", e))?;
        self.streaming = true;
        Ok(())
    }

    fn thread_loop(&mut self, config: &LoopConfig) -> Result<Step, Error> {
        let role = self.role;
        let index = match self
            .device
            .wait_completed_buffer(self.plane_count, config.poll_timeout)
        {
            Ok(Some(index)) => {
                self.wait_errors = 0;
                index
            }
            Ok(None) => return Ok(Step::Idle),
            Err(err) => {
                self.wait_errors += 1;
                if self.wait_errors > config.max_wait_errors {
                    return Err(Error::hardware("wait_completed_buffer", err));
                }
                warn!(
                    "{} completion wait failed ({} of {}): {}",
                    role, self.wait_errors, config.max_wait_errors, err
                );
                return Ok(Step::Idle);
            }
        };

        if index >= self.ring {
            return Err(Error::hardware(
                "wait_completed_buffer",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("ring slot {} out of {}", index, self.ring),
                ),
            ));
        }

        let queue = self
            .queue
            .as_mut()
            .ok_or_else(|| Error::NotInitialized(format!("{} has no bound buffer queue", role)))?;

        let zoomed = self.zoom.uses_transform();
        if zoomed {
            let destination = queue.next_free_buffer()?;
            let source = self.zoom.backing_buffer(index).ok_or_else(|| {
                Error::InvalidState(format!("{} backing buffer {} missing", role, index))
            })?;
            self.zoom.apply(&source, &destination)?;
        } else {
            let buffer = self.slots[index].take().ok_or_else(|| {
                Error::InvalidState(format!("{} ring slot {} was not submitted", role, index))
            })?;
            queue.claim(&buffer)?;
        }

        let timestamp = match config.timestamp_source {
            TimestampSource::Monotonic => crate::timestamp(),
            TimestampSource::Hardware => self
                .device
                .capture_timestamp()
                .map_err(|e| Error::hardware("capture_timestamp", e))?,
        };
        queue.mark_ready(timestamp)?;

        let freed = queue.return_buffer()?;
        let resubmit = if zoomed {
            self.zoom.backing_buffer(index).ok_or_else(|| {
                Error::InvalidState(format!("{} backing buffer {} missing", role, index))
            })?
        } else {
            freed
        };
        self.device
            .submit_buffer(self.plane_count, index, &resubmit, None)
            .map_err(|e| Error::hardware("submit_buffer", e))?;
        if !zoomed {
            self.slots[index] = Some(resubmit);
        }

        trace!("{} frame from slot {} ts={}", role, index, queue.timestamp());
        Ok(Step::Frame(queue.timestamp()))
    }

    fn in_flight(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.in_flight())
    }

    fn teardown(&mut self) {
        if self.streaming {
            if let Err(err) = self.device.stop_streaming() {
                warn!("{} stop_streaming: {}", self.role, err);
            }
            self.streaming = false;
        }
        self.zoom.release_backing_pool();
        self.slots.clear();
        self.ring = 0;
        if let Some(mut queue) = self.queue.take() {
            queue.release();
        }
    }
}

struct EngineInner {
    core: Option<EngineCore>,
    thread: Option<JoinHandle<EngineCore>>,
}

/// One hardware stream and the thread which drives it.
pub struct CaptureEngine {
    role: StreamRole,
    device_id: DeviceId,
    width: u32,
    height: u32,
    format: FourCC,
    pixel_format: PixelFormat,
    usage: u32,
    max_buffers: usize,
    uses_transform: bool,
    config: LoopConfig,
    inner: Mutex<EngineInner>,
    status: Arc<EngineStatus>,
    manager: Weak<ManagerShared>,
}

impl CaptureEngine {
    /// Create an engine for `variant` capturing `width` x `height` frames
    /// from `device`.
    ///
    /// The engine starts in [`EngineState::Created`] with no bound queue.
    pub fn new(
        variant: &dyn CaptureVariant,
        device_id: DeviceId,
        device: Box<dyn CaptureDevice>,
        width: u32,
        height: u32,
        zoom: Box<dyn ZoomTransform>,
    ) -> Self {
        let format = variant.hardware_format();
        let uses_transform = zoom.uses_transform();
        let zoom_crop = zoom.crop();
        let core = EngineCore {
            role: variant.role(),
            width,
            height,
            format,
            plane_count: format.plane_count(),
            device,
            zoom,
            queue: None,
            ring: 0,
            slots: Vec::new(),
            streaming: false,
            wait_errors: 0,
        };

        CaptureEngine {
            role: variant.role(),
            device_id,
            width,
            height,
            format,
            pixel_format: variant.pixel_format(),
            usage: variant.usage(),
            max_buffers: variant.max_buffers(),
            uses_transform,
            config: LoopConfig {
                timestamp_source: variant.timestamp_source(),
                poll_timeout: DEFAULT_POLL_TIMEOUT,
                max_wait_errors: DEFAULT_MAX_WAIT_ERRORS,
            },
            inner: Mutex::new(EngineInner {
                core: Some(core),
                thread: None,
            }),
            status: Arc::new(EngineStatus {
                state: Mutex::new(EngineState::Created),
                stop: AtomicBool::new(false),
                frames: AtomicU64::new(0),
                last_timestamp: AtomicI64::new(0),
                zoom_crop: Mutex::new(zoom_crop),
            }),
            manager: Weak::new(),
        }
    }

    /// Override the variant's timestamp source. `None` keeps the default.
    pub fn with_timestamp_source(mut self, source: Option<TimestampSource>) -> Self {
        if let Some(source) = source {
            self.config.timestamp_source = source;
        }
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn with_max_wait_errors(mut self, count: u32) -> Self {
        self.config.max_wait_errors = count;
        self
    }

    pub(crate) fn with_manager(mut self, manager: Weak<ManagerShared>) -> Self {
        self.manager = manager;
        self
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel code the hardware is programmed with.
    pub fn format(&self) -> FourCC {
        self.format
    }

    /// Format of the buffers delivered to the consumer.
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn usage(&self) -> u32 {
        self.usage
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn state(&self) -> EngineState {
        self.status.state()
    }

    pub fn uses_transform(&self) -> bool {
        self.uses_transform
    }

    /// Crop of the scaling transform in sensor base coordinates.
    pub fn zoom_crop(&self) -> Option<Rect> {
        *lock(&self.status.zoom_crop)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.status.frames.load(Ordering::Acquire)
    }

    /// Timestamp in nanoseconds of the last delivered frame.
    pub fn last_timestamp(&self) -> i64 {
        self.status.last_timestamp.load(Ordering::Acquire)
    }

    pub fn timestamp_source(&self) -> TimestampSource {
        self.config.timestamp_source
    }

    pub fn poll_timeout(&self) -> Duration {
        self.config.poll_timeout
    }

    /// Bind the engine's buffer queue. Valid once, before setup.
    pub fn add_stream(&self, queue: BufferQueue) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        let state = self.state();
        if state != EngineState::Created {
            return Err(Error::InvalidState(format!(
                "cannot bind a queue to a {} {} engine",
                state, self.role
            )));
        }
        let core = inner
            .core
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} engine is running", self.role)))?;
        if core.queue.is_some() {
            return Err(Error::InvalidState(format!(
                "{} engine already has a bound queue",
                self.role
            )));
        }
        debug!(
            "{} engine bound queue {}x{} max={}",
            self.role,
            queue.width(),
            queue.height(),
            queue.max_buffers()
        );
        core.queue = Some(queue);
        Ok(())
    }

    /// Prepare the queue, program the device and start hardware streaming.
    ///
    /// Does nothing if the engine is already ready or running. On failure
    /// the engine ends in [`EngineState::Failed`] and everything prepared so
    /// far is released.
    pub fn ready_to_run(&self, sensor: &SensorGeometry) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        match self.state() {
            EngineState::Created => {}
            EngineState::Ready | EngineState::Running => return Ok(()),
            state => {
                return Err(Error::InvalidState(format!(
                    "{} engine is {}",
                    self.role, state
                )))
            }
        }
        let core = inner
            .core
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} engine is running", self.role)))?;

        match core.ready_to_run(sensor) {
            Ok(()) => {
                *lock(&self.status.zoom_crop) = core.zoom.crop();
                self.status.set_state(self.role, EngineState::Ready);
                debug!(
                    "{} engine ready: {}x{} {} ring={} in_flight={}",
                    self.role,
                    self.width,
                    self.height,
                    self.format,
                    core.ring,
                    core.in_flight()
                );
                Ok(())
            }
            Err(err) => {
                core.teardown();
                self.status.set_state(self.role, EngineState::Failed);
                error!("{} engine setup failed: {}", self.role, err);
                Err(err)
            }
        }
    }

    /// Run setup if needed and spawn the capture thread.
    ///
    /// Starting a running engine is a no-op, which is what happens when a
    /// request lists both an aliased ZSL stream and its preview.
    pub fn start(&self, sensor: &SensorGeometry) -> Result<(), Error> {
        self.ready_to_run(sensor)?;

        let mut inner = lock(&self.inner);
        match self.state() {
            EngineState::Ready => {}
            EngineState::Running => return Ok(()),
            state => {
                return Err(Error::InvalidState(format!(
                    "{} engine is {}",
                    self.role, state
                )))
            }
        }
        if self.status.stop.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "{} engine is stopping",
                self.role
            )));
        }
        let core = inner
            .core
            .take()
            .ok_or_else(|| Error::InvalidState(format!("{} engine is running", self.role)))?;

        let status = self.status.clone();
        let manager = self.manager.clone();
        let config = self.config;
        let role = self.role;
        status.set_state(role, EngineState::Running);

        let spawned = thread::Builder::new()
            .name(format!("camstream-{}", role))
            .spawn(move || capture_thread(core, status, config, manager));
        match spawned {
            Ok(handle) => {
                inner.thread = Some(handle);
                info!(
                    "{} stream running on {} ({} timestamps)",
                    role, self.device_id, config.timestamp_source
                );
                Ok(())
            }
            Err(err) => {
                self.status.set_state(role, EngineState::Failed);
                Err(Error::Io(err))
            }
        }
    }

    /// Stop the capture thread and release the hardware.
    ///
    /// Blocks until the thread has exited, which takes at most one poll
    /// timeout. Stopping a stopped or failed engine is a no-op.
    pub fn stop(&self) {
        // The flag is raised under the engine lock so a concurrent start
        // either spawns before it or sees it and refuses.
        let handle = {
            let mut inner = lock(&self.inner);
            self.status.stop.store(true, Ordering::Release);
            let handle = inner.thread.take();
            if handle.is_none()
                && matches!(self.state(), EngineState::Created | EngineState::Ready)
            {
                if let Some(core) = inner.core.as_mut() {
                    core.teardown();
                }
                self.status.set_state(self.role, EngineState::Stopped);
            }
            handle
        };

        if let Some(handle) = handle {
            match handle.join() {
                Ok(core) => lock(&self.inner).core = Some(core),
                Err(_) => {
                    error!("{} capture thread panicked", self.role);
                    self.status.set_state(self.role, EngineState::Failed);
                }
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("role", &self.role)
            .field("device", &self.device_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("state", &self.state())
            .field("uses_transform", &self.uses_transform)
            .finish()
    }
}

fn capture_thread(
    mut core: EngineCore,
    status: Arc<EngineStatus>,
    config: LoopConfig,
    manager: Weak<ManagerShared>,
) -> EngineCore {
    let role = core.role;
    debug!("{} capture thread started", role);

    let result = loop {
        if status.stop.load(Ordering::Acquire) {
            break Ok(());
        }
        match core.thread_loop(&config) {
            Ok(Step::Frame(timestamp)) => {
                status.frames.fetch_add(1, Ordering::AcqRel);
                status.last_timestamp.store(timestamp, Ordering::Release);
            }
            Ok(Step::Idle) => {}
            Err(err) => break Err(err),
        }
    };

    core.teardown();
    let frames = status.frames.load(Ordering::Acquire);
    let event = match result {
        Ok(()) => {
            status.set_state(role, EngineState::Stopped);
            info!("{} stream stopped after {} frames", role, frames);
            StreamEvent::Stopped {
                stream: role.id(),
                frames,
            }
        }
        Err(err) => {
            status.set_state(role, EngineState::Failed);
            error!("{} stream failed after {} frames: {}", role, frames, err);
            StreamEvent::Failed {
                stream: role.id(),
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    };

    if let Some(manager) = manager.upgrade() {
        manager.notify(event);
    }
    core
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::BufferAllocator,
        device::DeviceProvider,
        sim::{
            ConsumerProbe, DeviceCall, VirtualAllocator, VirtualConsumer, VirtualDeviceProvider,
            VirtualScaler,
        },
        zoom::{PassthroughZoom, ScalingZoom},
        ErrorKind,
    };
    use serial_test::serial;
    use variant::{variant_for, PreviewVariant, RecordVariant};

    const DEV: DeviceId = DeviceId(0);

    fn engine(
        provider: &VirtualDeviceProvider,
        variant: &dyn CaptureVariant,
        zoom: Box<dyn ZoomTransform>,
    ) -> CaptureEngine {
        let device = provider.open(DEV).unwrap();
        CaptureEngine::new(variant, DEV, device, 1280, 720, zoom)
            .with_poll_timeout(Duration::from_millis(5))
    }

    fn bind(engine: &CaptureEngine) -> ConsumerProbe {
        let (consumer, probe) = VirtualConsumer::new();
        let queue = BufferQueue::new(
            engine.role(),
            engine.width(),
            engine.height(),
            engine.pixel_format(),
            engine.usage(),
            engine.max_buffers(),
            Box::new(consumer),
        );
        engine.add_stream(queue).unwrap();
        probe
    }

    fn scaling(sensor: &SensorGeometry) -> Box<dyn ZoomTransform> {
        let allocator: Arc<dyn BufferAllocator> = Arc::new(VirtualAllocator::new());
        Box::new(
            ScalingZoom::new(
                allocator,
                Arc::new(VirtualScaler::new()),
                sensor.base_width,
                sensor.base_height,
                sensor.crop,
            )
            .unwrap(),
        )
    }

    /// Drives the steady-state loop on the test thread.
    fn step(engine: &CaptureEngine) -> Result<Step, Error> {
        let mut inner = lock(&engine.inner);
        let core = inner.core.as_mut().unwrap();
        core.thread_loop(&engine.config)
    }

    fn in_flight(engine: &CaptureEngine) -> usize {
        lock(&engine.inner).core.as_ref().unwrap().in_flight()
    }

    #[test]
    fn test_ready_without_queue_touches_no_hardware() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));

        let err = engine.ready_to_run(&SensorGeometry::default()).unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
        assert_eq!(err.status(), crate::Status::NoInit);
        assert!(provider.calls_for(DEV).is_empty());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn test_add_stream_only_once() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        bind(&engine);
        let (consumer, _probe) = VirtualConsumer::new();
        let second = BufferQueue::new(
            StreamRole::Preview,
            1280,
            720,
            PixelFormat::Yv12,
            0,
            6,
            Box::new(consumer),
        );
        assert!(matches!(
            engine.add_stream(second),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_passthrough_setup_submits_in_reverse() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        let probe = bind(&engine);
        let sensor = SensorGeometry::new(2560, 1440)
            .with_crop(Rect::new(0, 180, 2560, 1080))
            .unwrap();

        engine.ready_to_run(&sensor).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        let calls = provider.calls_for(DEV);
        assert_eq!(
            calls[0],
            DeviceCall::SetFormat {
                width: 1280,
                height: 720,
                format: crate::fourcc::YV12
            }
        );
        assert_eq!(calls[1], DeviceCall::SetCrop(sensor.crop));
        let lent = engine.max_buffers();
        assert_eq!(probe.buffer_count(), lent + probe.min_undequeued());
        assert_eq!(calls[2], DeviceCall::RequestBuffers(lent));
        let indices: Vec<usize> = calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Submit { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        let expected: Vec<usize> = (0..lent).rev().collect();
        assert_eq!(indices, expected);
        assert_eq!(calls.last(), Some(&DeviceCall::StartStreaming));
    }

    #[test]
    fn test_scaling_setup_uses_backing_pool() {
        let provider = VirtualDeviceProvider::new();
        let sensor = SensorGeometry::new(2560, 1440);
        let engine = engine(&provider, &PreviewVariant, scaling(&sensor));
        bind(&engine);
        assert!(engine.uses_transform());

        engine.ready_to_run(&sensor).unwrap();
        let calls = provider.calls_for(DEV);
        assert_eq!(calls[1], DeviceCall::SetCrop(Rect::full(2560, 1440)));
        assert_eq!(calls[2], DeviceCall::RequestBuffers(6));
        let indices: Vec<usize> = calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Submit { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, (0..6).collect::<Vec<_>>());
        assert_eq!(engine.zoom_crop(), Some(Rect::full(2560, 1440)));
    }

    #[test]
    fn test_setup_failure_is_synchronous() {
        let provider = VirtualDeviceProvider::new();
        provider.fail_op("set_crop");
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        let probe = bind(&engine);

        let err = engine.ready_to_run(&SensorGeometry::default()).unwrap_err();
        assert!(matches!(err, Error::Hardware { op: "set_crop", .. }));
        assert_eq!(err.kind(), ErrorKind::HardwareIo);
        assert_eq!(engine.state(), EngineState::Failed);
        // Lent buffers went back to the consumer
        assert_eq!(probe.dequeued_count(), 0);
        assert!(engine.start(&SensorGeometry::default()).is_err());
    }

    fn run_steps(engine: &CaptureEngine, probe: &ConsumerProbe, frames: usize) {
        let lent = in_flight(engine);
        let mut delivered = 0;
        while delivered < frames {
            if let Step::Frame(_) = step(engine).unwrap() {
                delivered += 1;
            }
            assert_eq!(in_flight(engine), lent);
        }
        assert_eq!(probe.frame_count(), frames);
        let stamps: Vec<i64> = probe.frames().iter().map(|f| f.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_passthrough_steady_state() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        let probe = bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        run_steps(&engine, &probe, 25);

        let calls = provider.calls_for(DEV);
        let completed = calls
            .iter()
            .filter(|c| matches!(c, DeviceCall::Complete { .. }))
            .count();
        let submitted = calls
            .iter()
            .filter(|c| matches!(c, DeviceCall::Submit { .. }))
            .count();
        assert_eq!(completed, 25);
        assert_eq!(submitted, 25 + engine.max_buffers());
        assert_eq!(probe.dequeued_count(), engine.max_buffers());
    }

    #[test]
    fn test_scaling_steady_state() {
        let provider = VirtualDeviceProvider::new();
        let sensor = SensorGeometry::new(2560, 1440)
            .with_crop(Rect::new(640, 360, 1280, 720))
            .unwrap();
        let engine = engine(&provider, &PreviewVariant, scaling(&sensor));
        let probe = bind(&engine);
        engine.ready_to_run(&sensor).unwrap();

        run_steps(&engine, &probe, 20);

        // Each completed slot is resubmitted with its own backing buffer
        let calls = provider.calls_for(DEV);
        let mut backing = std::collections::HashMap::new();
        for call in calls {
            if let DeviceCall::Submit { index, buffer_id } = call {
                let first = *backing.entry(index).or_insert(buffer_id);
                assert_eq!(first, buffer_id);
            }
        }
        assert_eq!(backing.len(), 6);
    }

    #[test]
    fn test_hardware_timestamps() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &RecordVariant, Box::new(PassthroughZoom::new()));
        assert_eq!(engine.timestamp_source(), TimestampSource::Hardware);
        let probe = bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        run_steps(&engine, &probe, 5);
        assert!(provider
            .calls_for(DEV)
            .iter()
            .any(|c| matches!(c, DeviceCall::CaptureTimestamp)));
    }

    #[test]
    fn test_timestamp_source_override() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &RecordVariant, Box::new(PassthroughZoom::new()))
            .with_timestamp_source(Some(TimestampSource::Monotonic));
        assert_eq!(engine.timestamp_source(), TimestampSource::Monotonic);
        let engine = engine.with_timestamp_source(None);
        assert_eq!(engine.timestamp_source(), TimestampSource::Monotonic);
    }

    #[test]
    fn test_wait_errors_tolerated_then_fatal() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()))
            .with_max_wait_errors(2);
        bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        provider.fail_op_times("wait_completed_buffer", 2);
        assert!(matches!(step(&engine), Ok(Step::Idle)));
        assert!(matches!(step(&engine), Ok(Step::Idle)));
        assert!(matches!(step(&engine), Ok(Step::Frame(_))));

        provider.fail_op("wait_completed_buffer");
        assert!(step(&engine).is_ok());
        assert!(step(&engine).is_ok());
        let err = step(&engine).err().unwrap();
        assert!(matches!(
            err,
            Error::Hardware {
                op: "wait_completed_buffer",
                ..
            }
        ));
    }

    #[test]
    fn test_starved_consumer_is_fatal() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        let probe = bind(&engine);
        probe.hold_frames(true);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        let err = step(&engine).err().unwrap();
        assert!(matches!(err, Error::ConsumerStarved(_)));
        assert_eq!(err.kind(), ErrorKind::ConsumerProtocol);
    }

    #[test]
    #[serial]
    fn test_thread_runs_and_stops() {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider = VirtualDeviceProvider::new().with_frame_interval(Duration::from_millis(1));
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        let probe = bind(&engine);

        engine.start(&SensorGeometry::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.start(&SensorGeometry::default()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while probe.frame_count() < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.frames_delivered() >= 10);
        assert_eq!(engine.frames_delivered() as usize, probe.frame_count());
        assert_eq!(provider.calls_for(DEV).last(), Some(&DeviceCall::StopStreaming));
        // Teardown gave every lent buffer back
        assert_eq!(probe.dequeued_count(), 0);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    #[serial]
    fn test_every_role_starts_on_default_consumer() {
        let _ = env_logger::builder().is_test(true).try_init();

        for role in StreamRole::engine_roles() {
            let provider =
                VirtualDeviceProvider::new().with_frame_interval(Duration::from_millis(1));
            let variant = variant_for(role, PixelFormat::YCbCr420Flexible).unwrap();
            let engine = engine(&provider, variant.as_ref(), Box::new(PassthroughZoom::new()));
            let probe = bind(&engine);

            engine
                .start(&SensorGeometry::default())
                .unwrap_or_else(|e| panic!("{} failed to start: {}", role, e));
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while probe.frame_count() < 5 && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            engine.stop();

            assert!(probe.frame_count() >= 5, "{} delivered no frames", role);
            assert_eq!(engine.state(), EngineState::Stopped, "{}", role);
            assert_eq!(probe.dequeued_count(), 0, "{}", role);
        }
    }

    #[test]
    fn test_stop_after_setup_blocks_start() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        engine.stop();
        assert!(matches!(
            engine.start(&SensorGeometry::default()),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(lock(&engine.inner).thread.is_none());
    }

    #[test]
    fn test_start_refuses_pending_stop() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();

        engine.status.stop.store(true, Ordering::Release);
        assert!(matches!(
            engine.start(&SensorGeometry::default()),
            Err(Error::InvalidState(_))
        ));
        assert!(lock(&engine.inner).thread.is_none());
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    #[serial]
    fn test_concurrent_start_and_stop_never_hang() {
        let _ = env_logger::builder().is_test(true).try_init();

        for _ in 0..50 {
            let provider =
                VirtualDeviceProvider::new().with_frame_interval(Duration::from_millis(1));
            let engine = Arc::new(engine(
                &provider,
                &PreviewVariant,
                Box::new(PassthroughZoom::new()),
            ));
            bind(&engine);

            let starter = {
                let engine = engine.clone();
                thread::spawn(move || engine.start(&SensorGeometry::default()))
            };
            engine.stop();
            let _ = starter.join().unwrap();
            // A start that won the race left a thread for this stop to join
            engine.stop();
            assert!(matches!(
                engine.state(),
                EngineState::Stopped | EngineState::Failed
            ));
            assert!(lock(&engine.inner).thread.is_none());
        }
    }

    #[test]
    fn test_stop_before_start() {
        let provider = VirtualDeviceProvider::new();
        let engine = engine(&provider, &PreviewVariant, Box::new(PassthroughZoom::new()));
        bind(&engine);
        engine.ready_to_run(&SensorGeometry::default()).unwrap();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(provider.calls_for(DEV).last(), Some(&DeviceCall::StopStreaming));
    }

    #[test]
    fn test_timestamp_source_parse() {
        assert_eq!("hardware".parse(), Ok(TimestampSource::Hardware));
        assert_eq!("Monotonic".parse(), Ok(TimestampSource::Monotonic));
        assert!("gps".parse::<TimestampSource>().is_err());
    }
}
