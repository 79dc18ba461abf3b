//! Per-run telemetry aggregation for the end-of-run statistics event.

use chrono::Utc;
use tapetext_core::packet::Packet;
use tapetext_core::pipeline::PipelineStats;

use crate::logging::{StatSummary, StatisticsEvent};

/// Collects per-packet observations during a deconvolve run.
#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    confidence_samples: Vec<f64>,
    headers_seen: u64,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, packet: &Packet) {
        let mean: f32 =
            packet.signal_confidence.iter().sum::<f32>() / packet.signal_confidence.len() as f32;
        self.confidence_samples.push(mean as f64);
        if packet.row == 0 {
            self.headers_seen += 1;
        }
    }

    pub fn headers_seen(&self) -> u64 {
        self.headers_seen
    }

    pub fn summarize(&self, stats: &PipelineStats, duration_secs: f64) -> StatisticsEvent {
        StatisticsEvent {
            timestamp: Utc::now(),
            duration_secs,
            frames_in: stats.frames_in,
            lines_out: stats.lines_out,
            rejects: stats.rejects,
            reject_ratio: if stats.frames_in > 0 {
                stats.rejects as f64 / stats.frames_in as f64
            } else {
                0.0
            },
            hamming_errors: stats.hamming_errors,
            parity_failures: stats.parity_failures,
            confidence: StatSummary::from_samples(&self.confidence_samples),
        }
    }
}
