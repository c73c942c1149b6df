// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::{self, IntervalStats, StreamMetrics};
use crate::utils::{install_signal_handler, parse_crop, parse_resolution, usage_to_str};
use camstream::{
    engine::{CaptureEngine, EngineState, TimestampSource},
    format::PixelFormat,
    manager::{
        CaptureRequest, CaptureSettings, ManagerConfig, StreamAllocation, StreamEvent,
        StreamManager,
    },
    role::StreamRole,
    sim::{ConsumerProbe, VirtualAllocator, VirtualConsumer, VirtualDeviceProvider, VirtualScaler},
    zoom::SensorGeometry,
};
use clap::{Args as ClapArgs, ValueEnum};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Streams the simulation can request, in allocation order
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamKind {
    Preview,
    Record,
    Capture,
    Callback,
    Zsl,
}

impl StreamKind {
    fn format(self, callback_format: PixelFormat) -> PixelFormat {
        match self {
            StreamKind::Preview | StreamKind::Record => PixelFormat::ImplementationDefined,
            StreamKind::Capture => PixelFormat::Blob,
            StreamKind::Callback => callback_format,
            StreamKind::Zsl => PixelFormat::Zsl,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Streams to allocate (comma separated)
    #[arg(short, long, value_enum, value_delimiter = ',', default_value = "preview,callback")]
    streams: Vec<StreamKind>,

    /// Output resolution of every stream (WxH)
    #[arg(short, long, default_value = "1280x720")]
    resolution: String,

    /// Sensor resolution (WxH)
    #[arg(long, default_value = "1920x1080")]
    sensor: String,

    /// Sensor crop applied by the capture request (X,Y,WxH)
    #[arg(long)]
    crop: Option<String>,

    /// Let the sensor frame the output (hardware crop) instead of scaling in memory
    #[arg(long)]
    sensor_zoom: bool,

    /// Pixel format requested by the callback stream
    #[arg(long, default_value = "YCbCr_420_888")]
    callback_format: String,

    /// Frame rate of the virtual devices
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Frames per stream (0 = until Ctrl+C)
    #[arg(short, long, default_value = "300")]
    frames: u64,

    /// Timestamp source (monotonic or hardware), default per stream role
    #[arg(long)]
    timestamp_source: Option<String>,

    /// Stop after this many seconds (0 = no limit)
    #[arg(long, default_value = "60")]
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    resolution: String,
    sensor_crop: String,
    sensor_zoom: bool,
    frames_requested: u64,
    interrupted: bool,
    duration_ms: u64,
    streams: Vec<StreamMetrics>,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Interrupted,
    Failed(String),
    TimedOut,
}

struct ActiveStream {
    allocation: StreamAllocation,
    probe: Option<ConsumerProbe>,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing simulate command: {:?}", args);

    let (width, height) = parse_resolution(&args.resolution)?;
    let (sensor_width, sensor_height) = parse_resolution(&args.sensor)?;
    let crop = args.crop.as_deref().map(parse_crop).transpose()?;
    let callback_format: PixelFormat = args
        .callback_format
        .parse()
        .map_err(CliError::InvalidArgs)?;
    let timestamp_source = args
        .timestamp_source
        .as_deref()
        .map(str::parse::<TimestampSource>)
        .transpose()
        .map_err(CliError::InvalidArgs)?;

    if args.fps == 0 {
        return Err(CliError::InvalidArgs("Frame rate must be positive".into()));
    }
    let mut kinds = args.streams.clone();
    kinds.sort_unstable();
    kinds.dedup();
    if kinds.is_empty() {
        return Err(CliError::InvalidArgs("No streams requested".into()));
    }
    let has_preview = kinds.contains(&StreamKind::Preview);
    if !has_preview && kinds.contains(&StreamKind::Record) {
        return Err(CliError::InvalidArgs(
            "record needs a live preview stream".into(),
        ));
    }

    let period = Duration::from_secs(1) / args.fps;
    let mut provider = VirtualDeviceProvider::new().with_frame_interval(period);
    if args.frames > 0 {
        provider = provider.with_frame_limit(args.frames);
    }

    let mut config = ManagerConfig::default().with_sensor(SensorGeometry::new(
        sensor_width,
        sensor_height,
    ));
    if let Some(source) = timestamp_source {
        config = config.with_timestamp_source(source);
    }

    let manager = StreamManager::new(
        config,
        Arc::new(provider),
        Arc::new(VirtualAllocator::new()),
        Arc::new(VirtualScaler::new()),
    );
    let events = manager.subscribe();

    let mut active = Vec::new();
    for kind in kinds {
        let (consumer, probe) = VirtualConsumer::new();
        let allocation = manager.allocate_stream(
            width,
            height,
            kind.format(callback_format),
            Box::new(consumer),
            args.sensor_zoom,
        )?;
        log::info!(
            "Allocated {:?} as stream {} ({}, {} buffers)",
            kind,
            allocation.stream_id,
            allocation.role,
            allocation.max_buffers
        );
        // ZSL frames are delivered to the preview consumer
        let probe = (allocation.role != StreamRole::Zsl).then_some(probe);
        active.push(ActiveStream { allocation, probe });
    }

    let term = install_signal_handler()?;
    let mut settings = CaptureSettings::default();
    if let Some(crop) = crop {
        settings = settings.with_crop(crop);
    }
    let ids: Vec<u32> = active.iter().map(|s| s.allocation.stream_id).collect();
    manager.submit_request(&CaptureRequest::new(Some(settings), ids))?;

    let start = Instant::now();
    let deadline = (args.timeout > 0).then(|| start + Duration::from_secs(args.timeout));
    let outcome = loop {
        if term.load(Ordering::Relaxed) {
            log::info!("Received Ctrl+C, stopping streams");
            break Outcome::Interrupted;
        }

        if let Ok(StreamEvent::Failed {
            stream,
            kind,
            message,
        }) = events.try_recv()
        {
            log::error!("Stream {} failed ({}): {}", stream, kind, message);
            break Outcome::Failed(format!("stream {}: {}", stream, message));
        }

        if args.frames > 0
            && active
                .iter()
                .filter_map(|s| s.probe.as_ref())
                .all(|p| p.frame_count() as u64 >= args.frames)
        {
            break Outcome::Completed;
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            // An unbounded run simply ends at the deadline
            break if args.frames == 0 {
                Outcome::Completed
            } else {
                Outcome::TimedOut
            };
        }

        thread::sleep(Duration::from_millis(10));
    };
    let duration = start.elapsed();

    // Keep the engines so their counters can be read once they have stopped
    let engines: Vec<Option<Arc<CaptureEngine>>> = active
        .iter()
        .map(|s| manager.stream(s.allocation.stream_id))
        .collect();
    for stream in active.iter().rev() {
        manager.remove_stream(stream.allocation.stream_id);
    }

    let streams: Vec<StreamMetrics> = active
        .iter()
        .zip(&engines)
        .filter_map(|(stream, engine)| collect_metrics(stream, engine.as_deref()?, period))
        .collect();

    let report = SimulationReport {
        resolution: format!("{}x{}", width, height),
        sensor_crop: manager.sensor_geometry().crop.to_string(),
        sensor_zoom: args.sensor_zoom,
        frames_requested: args.frames,
        interrupted: outcome == Outcome::Interrupted,
        duration_ms: duration.as_millis() as u64,
        streams,
    };

    if json {
        let json_str = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::General(format!("Failed to serialize JSON: {}", e)))?;
        println!("{}", json_str);
    } else {
        println!(
            "Simulated {} streams at {} for {:.2} s",
            report.streams.len(),
            report.resolution,
            duration.as_secs_f64()
        );
        metrics::print_text(&report.streams);
    }

    match outcome {
        Outcome::Completed | Outcome::Interrupted => Ok(()),
        Outcome::Failed(message) => Err(CliError::StreamFailed(message)),
        Outcome::TimedOut => Err(CliError::Timeout(format!(
            "streams did not deliver {} frames within {} s",
            args.frames, args.timeout
        ))),
    }
}

fn collect_metrics(
    stream: &ActiveStream,
    engine: &CaptureEngine,
    period: Duration,
) -> Option<StreamMetrics> {
    let probe = stream.probe.as_ref()?;

    let timestamps: Vec<i64> = probe.frames().iter().map(|f| f.timestamp).collect();
    let stats = IntervalStats::from_timestamps(&timestamps, period);
    let frames = engine.frames_delivered();
    let last_frame_unix_s = (frames > 0).then(|| {
        let last = camstream::to_timestamp(engine.last_timestamp());
        last.seconds() as f64 + f64::from(last.subsec(9)) / 1e9
    });

    let state = engine.state();
    if state == EngineState::Failed {
        log::warn!("Stream {} ended in failed state", stream.allocation.stream_id);
    }

    Some(StreamMetrics {
        stream_id: stream.allocation.stream_id,
        role: stream.allocation.role.to_string(),
        format: stream.allocation.format.to_string(),
        width: engine.width(),
        height: engine.height(),
        usage: usage_to_str(stream.allocation.usage),
        state: state.to_string(),
        scaled: engine.uses_transform(),
        timestamp_source: engine.timestamp_source().to_string(),
        frames,
        throughput_fps: stats.throughput_fps,
        interval_min_us: stats.min_us,
        interval_max_us: stats.max_us,
        interval_avg_us: stats.avg_us,
        interval_p50_us: stats.p50_us,
        interval_p95_us: stats.p95_us,
        interval_p99_us: stats.p99_us,
        sequence_gaps: stats.gaps,
        last_frame_unix_s,
    })
}
