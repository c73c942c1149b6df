// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Consumer-facing buffer queue
//!
//! A [`BufferQueue`] is the producer's view of one output stream. The consumer
//! owns a bounded ring of buffers and lends some of them to the producer
//! through [`ConsumerOps`]. The queue tracks which buffers are currently lent
//! ("in flight"), which one is being filled, and the timestamp of the last
//! delivered frame.
//!
//! Geometry fields are fixed at construction and may be read from any
//! thread. Everything else is driven only by the owning capture engine.

use std::{collections::VecDeque, fmt, io};

use log::{debug, trace, warn};

use crate::{buffer::BufferHandle, format::PixelFormat, role::StreamRole, Error};

/// Operations the consumer side of a stream exposes to the producer.
///
/// This mirrors a window or surface buffer queue: the producer dequeues empty
/// buffers, fills them and enqueues them back with a timestamp.
pub trait ConsumerOps: Send {
    fn set_buffer_count(&mut self, count: usize) -> io::Result<()>;

    fn set_buffers_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> io::Result<()>;

    fn set_usage(&mut self, usage: u32) -> io::Result<()>;

    /// Number of buffers the consumer keeps for itself at all times.
    fn min_undequeued_buffer_count(&self) -> usize;

    /// Take an empty buffer from the consumer. Fails when none is free.
    fn dequeue_buffer(&mut self) -> io::Result<BufferHandle>;

    /// Hand a filled buffer to the consumer.
    fn enqueue_buffer(&mut self, buffer: &BufferHandle, timestamp: i64) -> io::Result<()>;

    /// Give an unfilled buffer back to the consumer.
    fn cancel_buffer(&mut self, buffer: &BufferHandle) -> io::Result<()>;
}

/// Producer side of one consumer buffer ring.
pub struct BufferQueue {
    role: StreamRole,
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: u32,
    max_buffers: usize,
    consumer: Box<dyn ConsumerOps>,
    queued: Vec<BufferHandle>,
    lent: VecDeque<BufferHandle>,
    current: Option<BufferHandle>,
    timestamp: i64,
    delivered: u64,
    initialized: bool,
}

impl BufferQueue {
    pub fn new(
        role: StreamRole,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: u32,
        max_buffers: usize,
        consumer: Box<dyn ConsumerOps>,
    ) -> Self {
        BufferQueue {
            role,
            width,
            height,
            format,
            usage,
            max_buffers,
            consumer,
            queued: Vec::new(),
            lent: VecDeque::new(),
            current: None,
            timestamp: 0,
            delivered: 0,
            initialized: false,
        }
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> u32 {
        self.usage
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Configure the consumer ring and dequeue the buffers lent to the
    /// producer before streaming starts.
    ///
    /// The consumer ring holds `max_buffers` plus the buffers the consumer
    /// keeps for itself, and the producer is lent exactly `max_buffers`.
    pub fn init_buffer(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::InvalidState(format!(
                "{} queue already initialized",
                self.role
            )));
        }

        if self.max_buffers == 0 {
            return Err(Error::NoMemory(format!("{} queue has no buffers", self.role)));
        }

        let min_undequeued = self.consumer.min_undequeued_buffer_count();
        self.consumer
            .set_buffer_count(self.max_buffers + min_undequeued)
            .map_err(|e| Error::NotInitialized(format!("set_buffer_count: {}", e)))?;
        self.consumer
            .set_buffers_geometry(self.width, self.height, self.format)
            .map_err(|e| Error::NotInitialized(format!("set_buffers_geometry: {}", e)))?;
        self.consumer
            .set_usage(self.usage)
            .map_err(|e| Error::NotInitialized(format!("set_usage: {}", e)))?;

        for _ in 0..self.max_buffers {
            match self.consumer.dequeue_buffer() {
                Ok(buffer) => self.queued.push(buffer),
                Err(err) => {
                    self.release();
                    return Err(Error::NoMemory(format!(
                        "{} dequeue during init: {}",
                        self.role, err
                    )));
                }
            }
        }
        self.lent = self.queued.iter().cloned().collect();
        self.initialized = true;

        debug!(
            "{} queue initialized: {}x{} {} lent={} consumer_min={}",
            self.role,
            self.width,
            self.height,
            self.format,
            self.queued.len(),
            min_undequeued
        );
        Ok(())
    }

    /// Number of buffers handed to the producer by [`Self::init_buffer`].
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// The `index`th buffer handed to the producer by [`Self::init_buffer`].
    pub fn queued_buffer(&self, index: usize) -> Option<BufferHandle> {
        self.queued.get(index).cloned()
    }

    /// Take the oldest lent buffer as the one to fill next.
    ///
    /// Used when the producer fills consumer buffers itself, such as through
    /// a scaling transform.
    pub fn next_free_buffer(&mut self) -> Result<BufferHandle, Error> {
        if self.current.is_some() {
            return Err(Error::Consumer(format!(
                "{} buffer already being filled",
                self.role
            )));
        }
        let buffer = self
            .lent
            .pop_front()
            .ok_or_else(|| Error::Consumer(format!("{} has no free lent buffer", self.role)))?;
        self.current = Some(buffer.clone());
        Ok(buffer)
    }

    /// Mark the lent buffer `buffer`, filled directly by the hardware, as the
    /// one being delivered next.
    pub fn claim(&mut self, buffer: &BufferHandle) -> Result<(), Error> {
        if self.current.is_some() {
            return Err(Error::Consumer(format!(
                "{} buffer already being filled",
                self.role
            )));
        }
        let pos = self
            .lent
            .iter()
            .position(|b| b.id == buffer.id)
            .ok_or_else(|| {
                Error::Consumer(format!("{} is not lent by {}", buffer, self.role))
            })?;
        self.current = self.lent.remove(pos);
        Ok(())
    }

    /// Deliver the buffer being filled to the consumer, stamped with
    /// `timestamp`.
    ///
    /// Timestamps delivered to the consumer never decrease; an earlier value
    /// is raised to the last delivered one.
    pub fn mark_ready(&mut self, timestamp: i64) -> Result<(), Error> {
        let buffer = self
            .current
            .take()
            .ok_or_else(|| Error::Consumer(format!("{} has no buffer to deliver", self.role)))?;

        if timestamp < self.timestamp {
            warn!(
                "{} timestamp went backwards: {} < {}",
                self.role, timestamp, self.timestamp
            );
        } else {
            self.set_timestamp(timestamp);
        }

        if let Err(err) = self.consumer.enqueue_buffer(&buffer, self.timestamp) {
            return Err(Error::Consumer(format!(
                "{} enqueue {}: {}",
                self.role, buffer, err
            )));
        }
        self.delivered += 1;
        trace!(
            "{} delivered {} ts={} frame={}",
            self.role,
            buffer,
            self.timestamp,
            self.delivered
        );
        Ok(())
    }

    /// Take the next buffer the consumer has freed for reuse and lend it to
    /// the producer.
    ///
    /// Fails with [`Error::ConsumerStarved`] if the consumer has none free,
    /// and with [`Error::Consumer`] if lending another buffer would exceed
    /// the maximum buffer count.
    pub fn return_buffer(&mut self) -> Result<BufferHandle, Error> {
        if self.in_flight() + 1 > self.max_buffers {
            return Err(Error::Consumer(format!(
                "{} would have {} of {} buffers in flight",
                self.role,
                self.in_flight() + 1,
                self.max_buffers
            )));
        }
        let buffer = self
            .consumer
            .dequeue_buffer()
            .map_err(Error::ConsumerStarved)?;
        self.lent.push_back(buffer.clone());
        Ok(buffer)
    }

    /// Record the timestamp of the most recently completed frame.
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Frames delivered to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Buffers lent to the producer and not yet given back.
    pub fn in_flight(&self) -> usize {
        self.lent.len() + usize::from(self.current.is_some())
    }

    /// Give every lent buffer back to the consumer unfilled.
    pub fn release(&mut self) {
        let pending = self.current.take().into_iter().chain(self.lent.drain(..));
        for buffer in pending {
            if let Err(err) = self.consumer.cancel_buffer(&buffer) {
                warn!("{} cancel {}: {}", self.role, buffer, err);
            }
        }
        self.queued.clear();
        self.initialized = false;
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("role", &self.role)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("max_buffers", &self.max_buffers)
            .field("in_flight", &self.in_flight())
            .field("delivered", &self.delivered)
            .finish()
    }
}
