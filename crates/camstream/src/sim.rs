// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Virtual hardware
//!
//! In-process implementations of every collaborator the stream manager
//! drives: capture devices, consumer buffer rings, the contiguous allocator
//! and the hardware scaler. They keep enough bookkeeping to observe what the
//! engines did and support failure injection, which makes them suitable for
//! tests and for simulating a camera pipeline without hardware.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use camstream::buffer::Rect;
//! use camstream::device::{DeviceId, DeviceProvider};
//! use camstream::fourcc;
//! use camstream::sim::{DeviceCall, VirtualDeviceProvider};
//!
//! let provider = VirtualDeviceProvider::new();
//! let mut device = provider.open(DeviceId(0))?;
//! device.set_format(640, 480, fourcc::YV12)?;
//! device.set_crop(Rect::full(640, 480))?;
//! assert_eq!(provider.open_count(), 1);
//! assert_eq!(provider.calls_for(DeviceId(0)).len(), 2);
//! # Ok::<(), std::io::Error>(())
//! ```

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use log::trace;

use crate::{
    buffer::{BufferAllocator, BufferHandle, GraphicBuffer, Rect},
    device::{CaptureDevice, DeviceId, DeviceProvider},
    format::PixelFormat,
    fourcc::FourCC,
    lock,
    queue::ConsumerOps,
    zoom::{ScaleJob, Scaler},
};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PHYS: AtomicU64 = AtomicU64::new(0x4000_0000);

const PAGE_SIZE: u64 = 4096;

/// Describe a new buffer at a fresh, page aligned physical address.
fn new_buffer(width: u32, height: u32, format: FourCC) -> BufferHandle {
    let size = format.image_size(width, height) as u64;
    let span = (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let phys = NEXT_PHYS.fetch_add(span, Ordering::Relaxed);
    let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
    Arc::new(GraphicBuffer::contiguous(id, width, height, format, phys))
}

fn injected(op: &str) -> io::Error {
    io::Error::other(format!("injected {} failure", op))
}

/// A device operation as observed by [`VirtualDeviceProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    SetFormat {
        width: u32,
        height: u32,
        format: FourCC,
    },
    SetCrop(Rect),
    RequestBuffers(usize),
    Submit {
        index: usize,
        buffer_id: u64,
    },
    Complete {
        index: usize,
    },
    StartStreaming,
    StopStreaming,
    CaptureTimestamp,
}

#[derive(Default)]
struct Faults {
    /// Remaining failures per operation, `None` fails forever
    ops: HashMap<String, Option<u32>>,
    open: bool,
}

impl Faults {
    fn trip(&mut self, op: &str) -> bool {
        match self.ops.get_mut(op) {
            Some(None) => true,
            Some(Some(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.ops.remove(op);
                }
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct ProviderState {
    calls: Vec<(DeviceId, DeviceCall)>,
    opens: HashMap<DeviceId, usize>,
    faults: Faults,
}

/// Opens [`VirtualDevice`]s and records every call made on them.
pub struct VirtualDeviceProvider {
    state: Arc<Mutex<ProviderState>>,
    frame_interval: Duration,
    frame_limit: Option<u64>,
}

impl Default for VirtualDeviceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDeviceProvider {
    /// Devices complete a frame every millisecond with no frame limit.
    pub fn new() -> Self {
        VirtualDeviceProvider {
            state: Arc::new(Mutex::new(ProviderState::default())),
            frame_interval: Duration::from_millis(1),
            frame_limit: None,
        }
    }

    /// Time each device takes to complete a queued buffer.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Each device completes at most `frames` buffers, then only times out.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Make every later call of `op` fail, e.g. `"set_crop"`.
    pub fn fail_op(&self, op: &str) {
        lock(&self.state).faults.ops.insert(op.to_string(), None);
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_op_times(&self, op: &str, times: u32) {
        if times > 0 {
            lock(&self.state)
                .faults
                .ops
                .insert(op.to_string(), Some(times));
        }
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).faults.open = fail;
    }

    pub fn clear_faults(&self) {
        let mut state = lock(&self.state);
        state.faults.ops.clear();
        state.faults.open = false;
    }

    /// Number of devices opened so far.
    pub fn open_count(&self) -> usize {
        lock(&self.state).opens.values().sum()
    }

    pub fn opens(&self, id: DeviceId) -> usize {
        lock(&self.state).opens.get(&id).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<(DeviceId, DeviceCall)> {
        lock(&self.state).calls.clone()
    }

    /// Calls made on device `id`, in order.
    pub fn calls_for(&self, id: DeviceId) -> Vec<DeviceCall> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(device, _)| *device == id)
            .map(|(_, call)| call.clone())
            .collect()
    }
}

impl DeviceProvider for VirtualDeviceProvider {
    fn open(&self, id: DeviceId) -> io::Result<Box<dyn CaptureDevice>> {
        let mut state = lock(&self.state);
        if state.faults.open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", id.path()),
            ));
        }
        *state.opens.entry(id).or_insert(0) += 1;
        Ok(Box::new(VirtualDevice {
            id,
            state: self.state.clone(),
            frame_interval: self.frame_interval,
            frame_limit: self.frame_limit,
            ring_size: 0,
            pending: VecDeque::new(),
            streaming: false,
            completed: 0,
            last_capture: 0,
        }))
    }
}

/// A capture device which completes submitted buffers in FIFO order.
pub struct VirtualDevice {
    id: DeviceId,
    state: Arc<Mutex<ProviderState>>,
    frame_interval: Duration,
    frame_limit: Option<u64>,
    ring_size: usize,
    pending: VecDeque<usize>,
    streaming: bool,
    completed: u64,
    last_capture: i64,
}

impl VirtualDevice {
    fn check(&self, op: &str) -> io::Result<()> {
        if lock(&self.state).faults.trip(op) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn record(&self, call: DeviceCall) {
        lock(&self.state).calls.push((self.id, call));
    }

    fn exhausted(&self) -> bool {
        self.frame_limit.is_some_and(|limit| self.completed >= limit)
    }
}

impl CaptureDevice for VirtualDevice {
    fn set_format(&mut self, width: u32, height: u32, format: FourCC) -> io::Result<()> {
        self.check("set_format")?;
        if width == 0 || height == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid size {}x{}", width, height),
            ));
        }
        self.record(DeviceCall::SetFormat {
            width,
            height,
            format,
        });
        Ok(())
    }

    fn set_crop(&mut self, crop: Rect) -> io::Result<()> {
        self.check("set_crop")?;
        self.record(DeviceCall::SetCrop(crop));
        Ok(())
    }

    fn request_buffers(&mut self, count: usize) -> io::Result<()> {
        self.check("request_buffers")?;
        if self.streaming {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request_buffers while streaming",
            ));
        }
        self.ring_size = count;
        self.pending.clear();
        self.record(DeviceCall::RequestBuffers(count));
        Ok(())
    }

    fn submit_buffer(
        &mut self,
        plane_count: usize,
        index: usize,
        buffer: &BufferHandle,
        _fence: Option<i32>,
    ) -> io::Result<()> {
        self.check("submit_buffer")?;
        if index >= self.ring_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot {} outside ring of {}", index, self.ring_size),
            ));
        }
        if plane_count == 0 || plane_count > buffer.plane_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} planes requested from {}", plane_count, buffer),
            ));
        }
        if self.pending.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot {} already queued", index),
            ));
        }
        self.pending.push_back(index);
        self.record(DeviceCall::Submit {
            index,
            buffer_id: buffer.id,
        });
        Ok(())
    }

    fn wait_completed_buffer(
        &mut self,
        _plane_count: usize,
        timeout: Duration,
    ) -> io::Result<Option<usize>> {
        self.check("wait_completed_buffer")?;
        if !self.streaming || self.pending.is_empty() || self.exhausted() {
            thread::sleep(timeout);
            return Ok(None);
        }
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }
        let Some(index) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.completed += 1;
        self.last_capture = crate::timestamp();
        trace!("{} completed slot {}", self.id, index);
        self.record(DeviceCall::Complete { index });
        Ok(Some(index))
    }

    fn start_streaming(&mut self) -> io::Result<()> {
        self.check("start_streaming")?;
        if self.ring_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no buffers requested",
            ));
        }
        self.streaming = true;
        self.record(DeviceCall::StartStreaming);
        Ok(())
    }

    fn stop_streaming(&mut self) -> io::Result<()> {
        self.check("stop_streaming")?;
        self.streaming = false;
        self.pending.clear();
        self.record(DeviceCall::StopStreaming);
        Ok(())
    }

    fn capture_timestamp(&mut self) -> io::Result<i64> {
        self.check("capture_timestamp")?;
        self.record(DeviceCall::CaptureTimestamp);
        Ok(self.last_capture)
    }
}

/// A frame handed to a [`VirtualConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredFrame {
    pub buffer_id: u64,
    pub timestamp: i64,
}

struct ConsumerState {
    count: usize,
    geometry: Option<(u32, u32, PixelFormat)>,
    usage: u32,
    min_undequeued: usize,
    buffers: Vec<BufferHandle>,
    free: VecDeque<BufferHandle>,
    dequeued: Vec<BufferHandle>,
    held: Vec<BufferHandle>,
    frames: Vec<DeliveredFrame>,
    hold: bool,
}

impl ConsumerState {
    fn ensure_buffers(&mut self) {
        if !self.buffers.is_empty() || self.count == 0 {
            return;
        }
        let (width, height, format) = self.geometry.unwrap_or((0, 0, PixelFormat::Yv12));
        let fourcc = format.fourcc();
        self.buffers = (0..self.count)
            .map(|_| new_buffer(width, height, fourcc))
            .collect();
        self.free = self.buffers.iter().cloned().collect();
    }

    fn take_dequeued(&mut self, buffer: &BufferHandle) -> io::Result<BufferHandle> {
        let pos = self
            .dequeued
            .iter()
            .position(|b| b.id == buffer.id)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} was not dequeued", buffer),
                )
            })?;
        Ok(self.dequeued.swap_remove(pos))
    }
}

/// A consumer buffer ring which records delivered frames.
///
/// Delivered buffers are recycled immediately unless the probe asks the
/// consumer to hold them, in which case the producer soon runs out of free
/// buffers.
pub struct VirtualConsumer {
    state: Arc<Mutex<ConsumerState>>,
}

/// Observer and control handle for a [`VirtualConsumer`].
#[derive(Clone)]
pub struct ConsumerProbe {
    state: Arc<Mutex<ConsumerState>>,
}

impl VirtualConsumer {
    /// A consumer which keeps two buffers for itself.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (VirtualConsumer, ConsumerProbe) {
        Self::with_min_undequeued(2)
    }

    pub fn with_min_undequeued(min_undequeued: usize) -> (VirtualConsumer, ConsumerProbe) {
        let state = Arc::new(Mutex::new(ConsumerState {
            count: 0,
            geometry: None,
            usage: 0,
            min_undequeued,
            buffers: Vec::new(),
            free: VecDeque::new(),
            dequeued: Vec::new(),
            held: Vec::new(),
            frames: Vec::new(),
            hold: false,
        }));
        (
            VirtualConsumer {
                state: state.clone(),
            },
            ConsumerProbe { state },
        )
    }
}

impl ConsumerOps for VirtualConsumer {
    fn set_buffer_count(&mut self, count: usize) -> io::Result<()> {
        let mut state = lock(&self.state);
        if count == 0 || !state.dequeued.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot set buffer count {}", count),
            ));
        }
        state.count = count;
        state.buffers.clear();
        state.free.clear();
        Ok(())
    }

    fn set_buffers_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.geometry = Some((width, height, format));
        state.buffers.clear();
        state.free.clear();
        Ok(())
    }

    fn set_usage(&mut self, usage: u32) -> io::Result<()> {
        lock(&self.state).usage = usage;
        Ok(())
    }

    fn min_undequeued_buffer_count(&self) -> usize {
        lock(&self.state).min_undequeued
    }

    fn dequeue_buffer(&mut self) -> io::Result<BufferHandle> {
        let mut state = lock(&self.state);
        state.ensure_buffers();
        if state.free.len() <= state.min_undequeued {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no free consumer buffer",
            ));
        }
        let buffer = state
            .free
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no free consumer buffer"))?;
        state.dequeued.push(buffer.clone());
        Ok(buffer)
    }

    fn enqueue_buffer(&mut self, buffer: &BufferHandle, timestamp: i64) -> io::Result<()> {
        let mut state = lock(&self.state);
        let buffer = state.take_dequeued(buffer)?;
        state.frames.push(DeliveredFrame {
            buffer_id: buffer.id,
            timestamp,
        });
        if state.hold {
            state.held.push(buffer);
        } else {
            state.free.push_back(buffer);
        }
        Ok(())
    }

    fn cancel_buffer(&mut self, buffer: &BufferHandle) -> io::Result<()> {
        let mut state = lock(&self.state);
        let buffer = state.take_dequeued(buffer)?;
        state.free.push_back(buffer);
        Ok(())
    }
}

impl ConsumerProbe {
    pub fn frame_count(&self) -> usize {
        lock(&self.state).frames.len()
    }

    pub fn frames(&self) -> Vec<DeliveredFrame> {
        lock(&self.state).frames.clone()
    }

    pub fn last_frame(&self) -> Option<DeliveredFrame> {
        lock(&self.state).frames.last().copied()
    }

    pub fn min_undequeued(&self) -> usize {
        lock(&self.state).min_undequeued
    }

    /// Keep delivered buffers instead of recycling them.
    pub fn hold_frames(&self, hold: bool) {
        lock(&self.state).hold = hold;
    }

    /// Recycle every held buffer.
    pub fn release_held(&self) {
        let mut state = lock(&self.state);
        let held: Vec<BufferHandle> = state.held.drain(..).collect();
        state.free.extend(held);
    }

    /// Buffers the consumer owns and could hand out.
    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }

    /// Buffers currently lent to the producer.
    pub fn dequeued_count(&self) -> usize {
        lock(&self.state).dequeued.len()
    }

    pub fn buffer_count(&self) -> usize {
        lock(&self.state).count
    }

    pub fn usage(&self) -> u32 {
        lock(&self.state).usage
    }

    pub fn geometry(&self) -> Option<(u32, u32, PixelFormat)> {
        lock(&self.state).geometry
    }
}

/// Contiguous allocator handing out fresh physical ranges.
pub struct VirtualAllocator {
    allocated: AtomicUsize,
    remaining: Mutex<Option<usize>>,
}

impl Default for VirtualAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualAllocator {
    pub fn new() -> Self {
        VirtualAllocator {
            allocated: AtomicUsize::new(0),
            remaining: Mutex::new(None),
        }
    }

    /// Allow `count` more allocations, then fail every later one.
    pub fn fail_after(&self, count: usize) {
        *lock(&self.remaining) = Some(count);
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for VirtualAllocator {
    fn allocate(&self, width: u32, height: u32, format: FourCC) -> io::Result<BufferHandle> {
        let mut remaining = lock(&self.remaining);
        match remaining.as_mut() {
            Some(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("cannot allocate {}x{} {}", width, height, format),
                ))
            }
            Some(count) => *count -= 1,
            None => {}
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(new_buffer(width, height, format))
    }
}

const SCALER_HISTORY: usize = 64;

/// Scaler which records the jobs it is given.
pub struct VirtualScaler {
    history: Mutex<VecDeque<ScaleJob>>,
    count: AtomicU64,
    fail: AtomicBool,
}

impl Default for VirtualScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualScaler {
    pub fn new() -> Self {
        VirtualScaler {
            history: Mutex::new(VecDeque::new()),
            count: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Most recent jobs, oldest first.
    pub fn jobs(&self) -> Vec<ScaleJob> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Jobs run since creation.
    pub fn job_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl Scaler for VirtualScaler {
    fn run(&self, job: &ScaleJob) -> io::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(injected("scale"));
        }
        let mut history = lock(&self.history);
        if history.len() == SCALER_HISTORY {
            history.pop_front();
        }
        history.push_back(job.clone());
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
