// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use serde::Serialize;
use std::time::Duration;

/// Delivery metrics of one simulated stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    /// Stream id returned by the manager
    pub stream_id: u32,
    /// Role the format resolved to
    pub role: String,
    /// Consumer pixel format
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Gralloc usage reported to the consumer
    pub usage: String,
    /// Engine state when the run ended
    pub state: String,
    /// Whether frames went through the scaling zoom
    pub scaled: bool,
    /// Timestamp source used by the engine
    pub timestamp_source: String,
    /// Total number of frames delivered to the consumer
    pub frames: u64,
    /// Average throughput in frames per second
    pub throughput_fps: f64,
    /// Minimum frame interval in microseconds
    pub interval_min_us: u64,
    /// Maximum frame interval in microseconds
    pub interval_max_us: u64,
    /// Average frame interval in microseconds
    pub interval_avg_us: u64,
    /// 50th percentile (median) frame interval in microseconds
    pub interval_p50_us: u64,
    /// 95th percentile frame interval in microseconds
    pub interval_p95_us: u64,
    /// 99th percentile frame interval in microseconds
    pub interval_p99_us: u64,
    /// Intervals longer than twice the nominal frame period
    pub sequence_gaps: u64,
    /// Wall-clock Unix time of the last frame in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_unix_s: Option<f64>,
}

/// Frame interval statistics computed from delivery timestamps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalStats {
    pub count: u64,
    pub throughput_fps: f64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub gaps: u64,
}

impl IntervalStats {
    /// Compute statistics from nanosecond timestamps in delivery order.
    ///
    /// `period` is the nominal frame period, an interval longer than twice
    /// the period counts as a gap.
    pub fn from_timestamps(timestamps: &[i64], period: Duration) -> Self {
        let count = timestamps.len() as u64;
        let mut intervals_us: Vec<u64> = timestamps
            .windows(2)
            .map(|pair| ((pair[1] - pair[0]).max(0) / 1000) as u64)
            .collect();

        if intervals_us.is_empty() {
            return IntervalStats {
                count,
                ..Default::default()
            };
        }

        let limit_us = (period.as_micros() as u64).saturating_mul(2);
        let gaps = if limit_us > 0 {
            intervals_us.iter().filter(|&&us| us > limit_us).count() as u64
        } else {
            0
        };

        let span_ns = timestamps[timestamps.len() - 1] - timestamps[0];
        let throughput_fps = if span_ns > 0 {
            intervals_us.len() as f64 / (span_ns as f64 / 1e9)
        } else {
            0.0
        };

        intervals_us.sort_unstable();
        let sum: u64 = intervals_us.iter().sum();

        IntervalStats {
            count,
            throughput_fps,
            min_us: intervals_us[0],
            max_us: intervals_us[intervals_us.len() - 1],
            avg_us: sum / intervals_us.len() as u64,
            p50_us: percentile(&intervals_us, 50.0),
            p95_us: percentile(&intervals_us, 95.0),
            p99_us: percentile(&intervals_us, 99.0),
            gaps,
        }
    }
}

/// Percentile of sorted, non-empty data
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let len = sorted.len();
    let idx = ((p / 100.0) * (len - 1) as f64).round() as usize;
    sorted[idx.min(len - 1)]
}

/// Print metrics in human-readable format
pub fn print_text(metrics: &[StreamMetrics]) {
    println!("\n=== Stream Metrics ===");
    for m in metrics {
        println!(
            "\nStream {} ({}) {} {}x{} usage {}",
            m.stream_id, m.role, m.format, m.width, m.height, m.usage
        );
        println!("  State:       {}", m.state);
        println!(
            "  Zoom:        {}",
            if m.scaled { "scaling" } else { "passthrough" }
        );
        println!("  Timestamps:  {}", m.timestamp_source);
        println!("  Frames:      {}", m.frames);
        println!("  Throughput:  {:.2} fps", m.throughput_fps);
        if m.frames > 1 {
            println!("  Interval (µs):");
            println!("    Min:  {}", m.interval_min_us);
            println!("    Max:  {}", m.interval_max_us);
            println!("    Avg:  {}", m.interval_avg_us);
            println!("    P50:  {}", m.interval_p50_us);
            println!("    P95:  {}", m.interval_p95_us);
            println!("    P99:  {}", m.interval_p99_us);
        }
        if m.sequence_gaps > 0 {
            println!("  Gaps:        {}", m.sequence_gaps);
        }
        if let Some(last) = m.last_frame_unix_s {
            println!("  Last frame:  {:.6} s (Unix time)", last);
        }
    }
}
