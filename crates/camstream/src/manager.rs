// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Stream manager
//!
//! The [`StreamManager`] resolves a requested pixel format to a
//! [`StreamRole`], builds the capture engine, zoom transform and buffer queue
//! for it, and owns the live set of engines keyed by role.
//!
//! The live map sits behind a mutex which is held for the whole of an
//! allocation, so role resolution (including the preview to record fallback)
//! and registration are atomic with respect to concurrent callers. Engine
//! threads never take this lock.
//!
//! A ZSL stream owns no engine: its entry is a second reference to the live
//! preview engine. An engine is stopped when the last entry referring to it
//! is removed.

use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    buffer::{BufferAllocator, Rect},
    device::{DeviceId, DeviceProvider},
    engine::{
        variant::variant_for, CaptureEngine, TimestampSource, DEFAULT_MAX_WAIT_ERRORS,
        DEFAULT_POLL_TIMEOUT,
    },
    format::PixelFormat,
    lock,
    queue::{BufferQueue, ConsumerOps},
    role::StreamRole,
    zoom::{PassthroughZoom, ScalingZoom, Scaler, SensorGeometry, ZoomTransform},
    Error, ErrorKind, Status,
};

/// Stream manager configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use camstream::device::DeviceId;
/// use camstream::engine::TimestampSource;
/// use camstream::manager::ManagerConfig;
/// use camstream::role::StreamRole;
///
/// let config = ManagerConfig::default()
///     .with_device(StreamRole::Record, DeviceId(5))
///     .with_timestamp_source(TimestampSource::Hardware)
///     .with_poll_timeout(Duration::from_millis(20));
/// assert_eq!(config.device_for(StreamRole::Record), Some(DeviceId(5)));
/// assert_eq!(config.device_for(StreamRole::Zsl), None);
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    preview_device: DeviceId,
    record_device: DeviceId,
    capture_device: DeviceId,
    callback_device: DeviceId,
    timestamp_source: Option<TimestampSource>,
    poll_timeout: Duration,
    max_wait_errors: u32,
    sensor: SensorGeometry,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            preview_device: DeviceId(0),
            record_device: DeviceId(1),
            capture_device: DeviceId(2),
            callback_device: DeviceId(3),
            timestamp_source: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_wait_errors: DEFAULT_MAX_WAIT_ERRORS,
            sensor: SensorGeometry::default(),
        }
    }
}

impl ManagerConfig {
    /// Select the capture device used for `role`. Roles without an engine of
    /// their own are ignored.
    pub fn with_device(mut self, role: StreamRole, device: DeviceId) -> Self {
        match role {
            StreamRole::Preview => self.preview_device = device,
            StreamRole::Record => self.record_device = device,
            StreamRole::Capture => self.capture_device = device,
            StreamRole::Callback => self.callback_device = device,
            StreamRole::Zsl | StreamRole::Invalid => {}
        }
        self
    }

    /// Use `source` for every stream instead of each role's default.
    pub fn with_timestamp_source(mut self, source: TimestampSource) -> Self {
        self.timestamp_source = Some(source);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_wait_errors(mut self, count: u32) -> Self {
        self.max_wait_errors = count;
        self
    }

    pub fn with_sensor(mut self, sensor: SensorGeometry) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn device_for(&self, role: StreamRole) -> Option<DeviceId> {
        match role {
            StreamRole::Preview => Some(self.preview_device),
            StreamRole::Record => Some(self.record_device),
            StreamRole::Capture => Some(self.capture_device),
            StreamRole::Callback => Some(self.callback_device),
            StreamRole::Zsl | StreamRole::Invalid => None,
        }
    }

    pub fn timestamp_source(&self) -> Option<TimestampSource> {
        self.timestamp_source
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn max_wait_errors(&self) -> u32 {
        self.max_wait_errors
    }

    pub fn sensor(&self) -> SensorGeometry {
        self.sensor
    }
}

/// Per-request capture settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Sensor crop in base coordinates
    pub crop: Option<Rect>,
}

impl CaptureSettings {
    pub fn with_crop(mut self, crop: Rect) -> Self {
        self.crop = Some(crop);
        self
    }
}

/// A capture request naming the streams to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Settings for this request, `None` to repeat the previous ones
    pub settings: Option<CaptureSettings>,
    /// Stream ids the request targets
    pub streams: Vec<u32>,
}

impl CaptureRequest {
    pub fn new(settings: Option<CaptureSettings>, streams: Vec<u32>) -> Self {
        CaptureRequest { settings, streams }
    }
}

/// Result of a successful [`StreamManager::allocate_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAllocation {
    pub stream_id: u32,
    pub role: StreamRole,
    /// Format the consumer's buffers must be allocated in
    pub format: PixelFormat,
    /// Usage bits the consumer's buffers must be allocated with
    pub usage: u32,
    pub max_buffers: usize,
}

impl StreamAllocation {
    fn of(engine: &CaptureEngine, role: StreamRole) -> Self {
        StreamAllocation {
            stream_id: role.id(),
            role,
            format: engine.pixel_format(),
            usage: engine.usage(),
            max_buffers: engine.max_buffers(),
        }
    }
}

/// Asynchronous notification about a stream's capture thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The thread ended on a steady-state error
    Failed {
        stream: u32,
        kind: ErrorKind,
        message: String,
    },
    /// The thread was stopped
    Stopped { stream: u32, frames: u64 },
}

impl StreamEvent {
    pub fn stream(&self) -> u32 {
        match self {
            StreamEvent::Failed { stream, .. } | StreamEvent::Stopped { stream, .. } => *stream,
        }
    }
}

/// State shared by the manager handle and, weakly, by its engines.
pub(crate) struct ManagerShared {
    config: ManagerConfig,
    provider: Arc<dyn DeviceProvider>,
    allocator: Arc<dyn BufferAllocator>,
    scaler: Arc<dyn Scaler>,
    streams: Mutex<HashMap<StreamRole, Arc<CaptureEngine>>>,
    sensor: RwLock<SensorGeometry>,
    settings: Mutex<Option<CaptureSettings>>,
    listeners: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

impl ManagerShared {
    pub(crate) fn notify(&self, event: StreamEvent) {
        debug!("stream event: {:?}", event);
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Owner of the live set of capture engines.
pub struct StreamManager {
    shared: Arc<ManagerShared>,
}

impl StreamManager {
    pub fn new(
        config: ManagerConfig,
        provider: Arc<dyn DeviceProvider>,
        allocator: Arc<dyn BufferAllocator>,
        scaler: Arc<dyn Scaler>,
    ) -> Self {
        let sensor = config.sensor;
        StreamManager {
            shared: Arc::new(ManagerShared {
                config,
                provider,
                allocator,
                scaler,
                streams: Mutex::new(HashMap::new()),
                sensor: RwLock::new(sensor),
                settings: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Role `format` would be allocated as right now.
    pub fn resolve_role(&self, format: PixelFormat) -> StreamRole {
        let streams = lock(&self.shared.streams);
        StreamRole::resolve(format, streams.contains_key(&StreamRole::Preview))
    }

    /// Allocate a stream of `width` x `height` pixels in `format`.
    ///
    /// With `use_sensor_zoom` the hardware is trusted to frame the output
    /// itself; otherwise frames are cropped and scaled from a backing pool
    /// using the current sensor geometry.
    ///
    /// A ZSL allocation binds to the live preview engine and ignores
    /// `consumer`. Its allocation reports the preview stream's format.
    pub fn allocate_stream(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        consumer: Box<dyn ConsumerOps>,
        use_sensor_zoom: bool,
    ) -> Result<StreamAllocation, Error> {
        let shared = &self.shared;
        let mut streams = lock(&shared.streams);

        let role = StreamRole::resolve(format, streams.contains_key(&StreamRole::Preview));
        match role {
            StreamRole::Invalid => {
                warn!("no stream role for format {}", format);
                return Err(Error::UnsupportedFormat(format.raw()));
            }
            StreamRole::Zsl => {
                let preview = streams.get(&StreamRole::Preview).cloned().ok_or_else(|| {
                    Error::NotInitialized("zsl stream needs a live preview stream".to_string())
                })?;
                let allocation = StreamAllocation::of(&preview, StreamRole::Zsl);
                streams.insert(StreamRole::Zsl, preview);
                info!("zsl stream aliases preview");
                return Ok(allocation);
            }
            _ => {}
        }

        if streams.values().any(|engine| engine.role() == role) {
            return Err(Error::AlreadyExists(role));
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidState(format!(
                "{} stream of {}x{}",
                role, width, height
            )));
        }

        let variant =
            variant_for(role, format).ok_or(Error::UnsupportedFormat(format.raw()))?;
        let device_id = shared
            .config
            .device_for(role)
            .ok_or_else(|| Error::NotInitialized(format!("no device for {}", role)))?;

        let sensor = self.sensor_geometry();
        let zoom: Box<dyn ZoomTransform> = if use_sensor_zoom {
            Box::new(PassthroughZoom::new())
        } else {
            Box::new(ScalingZoom::new(
                shared.allocator.clone(),
                shared.scaler.clone(),
                sensor.base_width,
                sensor.base_height,
                sensor.crop,
            )?)
        };

        let device = shared
            .provider
            .open(device_id)
            .map_err(|e| Error::NotInitialized(format!("open {}: {}", device_id, e)))?;

        let engine = CaptureEngine::new(variant.as_ref(), device_id, device, width, height, zoom)
            .with_timestamp_source(shared.config.timestamp_source)
            .with_poll_timeout(shared.config.poll_timeout)
            .with_max_wait_errors(shared.config.max_wait_errors)
            .with_manager(Arc::downgrade(&self.shared));

        let queue = BufferQueue::new(
            role,
            width,
            height,
            variant.pixel_format(),
            variant.usage(),
            variant.max_buffers(),
            consumer,
        );
        engine
            .add_stream(queue)
            .map_err(|e| Error::NotInitialized(format!("bind {} queue: {}", role, e)))?;

        let allocation = StreamAllocation::of(&engine, role);
        info!(
            "allocated {} stream: {}x{} {} on {} ({})",
            role,
            width,
            height,
            allocation.format,
            device_id,
            if engine.uses_transform() {
                "scaling"
            } else {
                "passthrough"
            }
        );
        streams.insert(role, Arc::new(engine));
        Ok(allocation)
    }

    /// Remove a stream.
    ///
    /// Always succeeds: unknown ids are ignored, so "already removed" and
    /// "never allocated" look the same to the caller.
    pub fn remove_stream(&self, stream_id: u32) -> Status {
        let Some(role) = StreamRole::from_id(stream_id) else {
            debug!("remove of unknown stream id {}", stream_id);
            return Status::Ok;
        };

        let orphaned = {
            let mut streams = lock(&self.shared.streams);
            let removed = streams.remove(&role);
            if removed.is_some() {
                info!("removed {} stream", role);
            }
            removed.filter(|engine| !streams.values().any(|other| Arc::ptr_eq(other, engine)))
        };

        if let Some(engine) = orphaned {
            engine.stop();
        }
        Status::Ok
    }

    /// Apply the request's settings and start every stream it names.
    ///
    /// The first request must carry settings; later requests without them
    /// reuse the last ones.
    pub fn submit_request(&self, request: &CaptureRequest) -> Result<(), Error> {
        let settings = match &request.settings {
            Some(settings) => settings.clone(),
            None => lock(&self.shared.settings).clone().ok_or_else(|| {
                Error::NotInitialized("first capture request carries no settings".to_string())
            })?,
        };

        let sensor = match settings.crop {
            Some(crop) => {
                let sensor = self.sensor_geometry().with_crop(crop)?;
                self.set_sensor_geometry(sensor);
                sensor
            }
            None => self.sensor_geometry(),
        };
        *lock(&self.shared.settings) = Some(settings);

        let engines = {
            let streams = lock(&self.shared.streams);
            request
                .streams
                .iter()
                .map(|id| {
                    StreamRole::from_id(*id)
                        .and_then(|role| streams.get(&role).cloned())
                        .ok_or_else(|| {
                            Error::InvalidState(format!("stream {} is not allocated", id))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for engine in engines {
            engine.start(&sensor)?;
        }
        Ok(())
    }

    /// Start one stream with the current sensor geometry.
    pub fn start_stream(&self, stream_id: u32) -> Result<(), Error> {
        let engine = self.engine_for(stream_id)?;
        engine.start(&self.sensor_geometry())
    }

    /// Stop one stream's engine, leaving it allocated.
    pub fn stop_stream(&self, stream_id: u32) -> Result<(), Error> {
        let engine = self.engine_for(stream_id)?;
        engine.stop();
        Ok(())
    }

    fn engine_for(&self, stream_id: u32) -> Result<Arc<CaptureEngine>, Error> {
        self.stream(stream_id)
            .ok_or_else(|| Error::InvalidState(format!("stream {} is not allocated", stream_id)))
    }

    /// Receive [`StreamEvent`]s for every engine of this manager.
    pub fn subscribe(&self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    pub fn stream(&self, stream_id: u32) -> Option<Arc<CaptureEngine>> {
        let role = StreamRole::from_id(stream_id)?;
        lock(&self.shared.streams).get(&role).cloned()
    }

    /// Ids of the live streams in ascending order.
    pub fn stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.shared.streams)
            .keys()
            .map(|role| role.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.streams).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sensor_geometry(&self) -> SensorGeometry {
        *self
            .shared
            .sensor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the sensor geometry used by later allocations and starts.
    pub fn set_sensor_geometry(&self, sensor: SensorGeometry) {
        debug!(
            "sensor {}x{} crop {}",
            sensor.base_width, sensor.base_height, sensor.crop
        );
        *self
            .shared
            .sensor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sensor;
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        let engines: Vec<Arc<CaptureEngine>> = lock(&self.shared.streams)
            .drain()
            .map(|(_, engine)| engine)
            .collect();
        for engine in engines {
            engine.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineState,
        sim::{ConsumerProbe, VirtualAllocator, VirtualConsumer, VirtualDeviceProvider, VirtualScaler},
    };
    use serial_test::serial;

    const OPAQUE: PixelFormat = PixelFormat::ImplementationDefined;

    struct Rig {
        manager: StreamManager,
        provider: Arc<VirtualDeviceProvider>,
        allocator: Arc<VirtualAllocator>,
    }

    fn rig() -> Rig {
        let provider = Arc::new(VirtualDeviceProvider::new());
        let allocator = Arc::new(VirtualAllocator::new());
        let config = ManagerConfig::default()
            .with_poll_timeout(Duration::from_millis(5))
            .with_sensor(SensorGeometry::new(2560, 1440));
        let manager = StreamManager::new(
            config,
            provider.clone(),
            allocator.clone(),
            Arc::new(VirtualScaler::new()),
        );
        Rig {
            manager,
            provider,
            allocator,
        }
    }

    fn allocate(
        manager: &StreamManager,
        format: PixelFormat,
        sensor_zoom: bool,
    ) -> (Result<StreamAllocation, Error>, ConsumerProbe) {
        let (consumer, probe) = VirtualConsumer::new();
        let result = manager.allocate_stream(1280, 720, format, Box::new(consumer), sensor_zoom);
        (result, probe)
    }

    fn request(streams: Vec<u32>) -> CaptureRequest {
        CaptureRequest::new(Some(CaptureSettings::default()), streams)
    }

    #[test]
    fn test_preview_then_record_fallback() {
        let rig = rig();
        let (first, _p1) = allocate(&rig.manager, OPAQUE, false);
        let first = first.unwrap();
        assert_eq!(first.role, StreamRole::Preview);
        assert_eq!(first.stream_id, 0);
        assert!(rig.manager.stream(0).unwrap().uses_transform());

        let (second, _p2) = allocate(&rig.manager, OPAQUE, false);
        let second = second.unwrap();
        assert_eq!(second.role, StreamRole::Record);
        assert_eq!(second.stream_id, 1);

        let preview = rig.manager.stream(0).unwrap();
        let record = rig.manager.stream(1).unwrap();
        assert!(!Arc::ptr_eq(&preview, &record));
        assert_ne!(preview.device_id(), record.device_id());

        let (third, _p3) = allocate(&rig.manager, OPAQUE, false);
        let err = third.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(StreamRole::Record)));
        assert_eq!(err.status(), Status::AlreadyExists);
        assert_eq!(rig.manager.len(), 2);
    }

    #[test]
    fn test_role_table_through_allocation() {
        let rig = rig();
        let cases = [
            (PixelFormat::Blob, StreamRole::Capture),
            (PixelFormat::YCrCb420Sp, StreamRole::Callback),
            (OPAQUE, StreamRole::Preview),
        ];
        for (format, role) in cases {
            assert_eq!(rig.manager.resolve_role(format), role);
            let (allocation, _probe) = allocate(&rig.manager, format, true);
            assert_eq!(allocation.unwrap().stream_id, role.id());
        }
        // Duplicates of non-opaque roles are rejected
        let (dup, _probe) = allocate(&rig.manager, PixelFormat::Yv12, true);
        assert!(matches!(dup, Err(Error::AlreadyExists(StreamRole::Callback))));
        let (dup, _probe) = allocate(&rig.manager, PixelFormat::Blob, true);
        assert!(matches!(dup, Err(Error::AlreadyExists(StreamRole::Capture))));
        assert_eq!(rig.manager.stream_ids(), vec![0, 2, 3]);
    }

    #[test]
    fn test_unsupported_format_leaves_map_unchanged() {
        let rig = rig();
        let (_ok, _probe) = allocate(&rig.manager, OPAQUE, true);
        let before = rig.manager.stream_ids();

        let (result, _probe) = allocate(&rig.manager, PixelFormat::Rgba8888, true);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(1)));
        assert_eq!(err.status(), Status::InvalidOperation);
        assert_eq!(rig.manager.stream_ids(), before);
        assert_eq!(rig.provider.open_count(), 1);
    }

    #[test]
    fn test_zoom_choice() {
        let rig = rig();
        let crop = Rect::new(640, 360, 1280, 720);
        rig.manager.set_sensor_geometry(
            rig.manager.sensor_geometry().with_crop(crop).unwrap(),
        );

        allocate(&rig.manager, OPAQUE, true).0.unwrap();
        let preview = rig.manager.stream(0).unwrap();
        assert!(!preview.uses_transform());
        assert_eq!(preview.zoom_crop(), None);

        allocate(&rig.manager, OPAQUE, false).0.unwrap();
        let record = rig.manager.stream(1).unwrap();
        assert!(record.uses_transform());
        assert_eq!(record.zoom_crop(), Some(crop));
    }

    #[test]
    fn test_zsl_aliases_preview() {
        let rig = rig();
        let preview = allocate(&rig.manager, OPAQUE, false).0.unwrap();
        let zsl = allocate(&rig.manager, PixelFormat::Zsl, false).0.unwrap();
        assert_eq!(zsl.stream_id, StreamRole::Zsl.id());
        assert_eq!(zsl.format, preview.format);
        assert_eq!(zsl.max_buffers, preview.max_buffers);

        let a = rig.manager.stream(0).unwrap();
        let b = rig.manager.stream(4).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rig.provider.open_count(), 1);
        assert_eq!(rig.manager.stream_ids(), vec![0, 4]);
    }

    #[test]
    fn test_zsl_without_preview() {
        let rig = rig();
        let (result, _probe) = allocate(&rig.manager, PixelFormat::Zsl, false);
        let err = result.unwrap_err();
        assert_eq!(err.status(), Status::NoInit);
        assert!(rig.manager.is_empty());
        assert_eq!(rig.provider.open_count(), 0);
    }

    #[test]
    fn test_device_open_failure() {
        let rig = rig();
        rig.provider.fail_open(true);
        let (result, _probe) = allocate(&rig.manager, PixelFormat::Blob, true);
        assert_eq!(result.unwrap_err().status(), Status::NoInit);
        assert!(rig.manager.is_empty());
    }

    #[test]
    fn test_remove_stream() {
        let rig = rig();
        allocate(&rig.manager, OPAQUE, true).0.unwrap();
        allocate(&rig.manager, PixelFormat::Blob, true).0.unwrap();

        assert_eq!(rig.manager.remove_stream(99), Status::Ok);
        assert_eq!(rig.manager.remove_stream(StreamRole::Record.id()), Status::Ok);
        assert_eq!(rig.manager.stream_ids(), vec![0, 2]);

        let capture = rig.manager.stream(2).unwrap();
        assert_eq!(rig.manager.remove_stream(2), Status::Ok);
        assert_eq!(rig.manager.stream_ids(), vec![0]);
        assert_eq!(capture.state(), EngineState::Stopped);

        assert_eq!(rig.manager.remove_stream(2), Status::Ok);
        assert_eq!(rig.manager.stream_ids(), vec![0]);
    }

    #[test]
    #[serial]
    fn test_zsl_removal_keeps_preview_running() {
        let rig = rig();
        allocate(&rig.manager, OPAQUE, true).0.unwrap();
        allocate(&rig.manager, PixelFormat::Zsl, true).0.unwrap();
        rig.manager.submit_request(&request(vec![0, 4])).unwrap();
        let engine = rig.manager.stream(0).unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        rig.manager.remove_stream(4);
        assert_eq!(engine.state(), EngineState::Running);

        allocate(&rig.manager, PixelFormat::Zsl, true).0.unwrap();
        rig.manager.remove_stream(0);
        assert_eq!(engine.state(), EngineState::Running);
        // The orphaned alias still owns the preview engine
        let (again, _probe) = allocate(&rig.manager, OPAQUE, true);
        assert!(matches!(again, Err(Error::AlreadyExists(StreamRole::Preview))));

        rig.manager.remove_stream(4);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(rig.manager.is_empty());
    }

    #[test]
    fn test_first_request_needs_settings() {
        let rig = rig();
        allocate(&rig.manager, PixelFormat::Blob, true).0.unwrap();

        let bare = CaptureRequest::new(None, vec![]);
        let err = rig.manager.submit_request(&bare).unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));

        rig.manager.submit_request(&request(vec![])).unwrap();
        rig.manager.submit_request(&bare).unwrap();

        let unknown = CaptureRequest::new(None, vec![1]);
        assert!(rig.manager.submit_request(&unknown).is_err());
    }

    #[test]
    fn test_request_crop_updates_sensor() {
        let rig = rig();
        let crop = Rect::new(320, 180, 1920, 1080);
        let settings = CaptureSettings::default().with_crop(crop);
        rig.manager
            .submit_request(&CaptureRequest::new(Some(settings), vec![]))
            .unwrap();
        assert_eq!(rig.manager.sensor_geometry().crop, crop);

        let bad = CaptureSettings::default().with_crop(Rect::new(2000, 0, 1280, 720));
        assert!(rig
            .manager
            .submit_request(&CaptureRequest::new(Some(bad), vec![]))
            .is_err());
        assert_eq!(rig.manager.sensor_geometry().crop, crop);
    }

    #[test]
    #[serial]
    fn test_backing_pool_failure_is_no_memory() {
        let rig = rig();
        rig.allocator.fail_after(0);
        allocate(&rig.manager, OPAQUE, false).0.unwrap();

        let err = rig.manager.submit_request(&request(vec![0])).unwrap_err();
        assert_eq!(err.status(), Status::NoMemory);
        assert_eq!(rig.manager.stream(0).unwrap().state(), EngineState::Failed);
        assert!(rig.provider.calls_for(DeviceId(0)).iter().all(|c| !matches!(
            c,
            crate::sim::DeviceCall::StartStreaming
        )));
    }

    #[test]
    #[serial]
    fn test_steady_state_failure_is_reported() {
        let rig = rig();
        let events = rig.manager.subscribe();
        let (allocation, probe) = allocate(&rig.manager, OPAQUE, true);
        let allocation = allocation.unwrap();
        probe.hold_frames(true);

        rig.manager
            .submit_request(&request(vec![allocation.stream_id]))
            .unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        match event {
            StreamEvent::Failed { stream, kind, .. } => {
                assert_eq!(stream, 0);
                assert_eq!(kind, ErrorKind::ConsumerProtocol);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rig.manager.stream(0).unwrap().state(), EngineState::Failed);
        // The failed stream stays allocated until removed
        assert_eq!(rig.manager.stream_ids(), vec![0]);
    }

    #[test]
    #[serial]
    fn test_still_capture_streams_on_default_consumer() {
        let _ = env_logger::builder().is_test(true).try_init();
        let rig = rig();
        let (allocation, probe) = allocate(&rig.manager, PixelFormat::Blob, true);
        let allocation = allocation.unwrap();
        assert_eq!(allocation.role, StreamRole::Capture);
        assert_eq!(allocation.max_buffers, 2);

        rig.manager
            .submit_request(&request(vec![allocation.stream_id]))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while probe.frame_count() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        let engine = rig.manager.stream(allocation.stream_id).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(probe.frame_count() >= 5);
        assert_eq!(probe.buffer_count(), 2 + probe.min_undequeued());
        rig.manager.remove_stream(allocation.stream_id);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    #[serial]
    fn test_remove_running_stream_reports_stop() {
        let rig = rig();
        let events = rig.manager.subscribe();
        allocate(&rig.manager, PixelFormat::YCrCb420Sp, true).0.unwrap();
        rig.manager.submit_request(&request(vec![3])).unwrap();
        rig.manager.remove_stream(3);

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, StreamEvent::Stopped { stream: 3, .. }));
    }

    #[test]
    #[serial]
    fn test_drop_stops_engines() {
        let rig = rig();
        allocate(&rig.manager, OPAQUE, true).0.unwrap();
        rig.manager.submit_request(&request(vec![0])).unwrap();
        let engine = rig.manager.stream(0).unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        drop(rig);
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
