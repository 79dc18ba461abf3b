//! Structured logging for the terminal: JSON or pretty events on stderr.
//!
//! Stdout belongs to the packet stream, so every diagnostic event goes to
//! stderr in a machine-parseable shape.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::Instant;

use tapetext_core::logging::LogEntry;

/// Structured log event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// A decoded page-header line
    HeaderLine(HeaderLineEvent),

    /// A signal-path event drained from the engine's logger
    Signal(SignalEvent),

    /// End-of-run statistical summary
    Statistics(StatisticsEvent),

    /// General info message
    Info { message: String },

    /// Warning message
    Warn { message: String },

    /// Error message
    Error { message: String },
}

/// One engine-side signal event: run-in rejections, high-entropy lines,
/// residual errors, filter flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub level: String,
    pub subsystem: String,
    pub frame_index: Option<u64>,
    pub message: String,
}

impl From<&LogEntry> for SignalEvent {
    fn from(entry: &LogEntry) -> Self {
        Self {
            level: entry.level.to_string(),
            subsystem: entry.subsystem.tag().to_string(),
            frame_index: entry.frame_index,
            message: entry.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderLineEvent {
    pub timestamp: DateTime<Utc>,
    pub frame_index: u64,
    /// Three-hex-digit page number, e.g. "100"
    pub page: String,
    /// Four-hex-digit subpage code
    pub subcode: String,
    pub errors: usize,
    /// Printable rendering of the status row
    pub caption: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsEvent {
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub frames_in: u64,
    pub lines_out: u64,
    pub rejects: u64,
    pub reject_ratio: f64,
    pub hamming_errors: u64,
    pub parity_failures: u64,
    pub confidence: StatSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatSummary {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

impl StatSummary {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            stddev: variance.sqrt(),
            min: samples.iter().cloned().fold(f64::INFINITY, f64::min),
            max: samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            samples: samples.len(),
        }
    }
}

/// Log output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logger that renders events to stderr
pub struct StructuredLogger {
    format: LogFormat,
    started: Instant,
}

impl StructuredLogger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            started: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn log(&mut self, event: LogEvent) -> Result<()> {
        let mut stderr = io::stderr().lock();
        match self.format {
            LogFormat::Json => {
                serde_json::to_writer(&mut stderr, &event)?;
                writeln!(stderr)?;
            }
            LogFormat::Pretty => {
                writeln!(stderr, "{}", render_pretty(&event))?;
            }
        }
        Ok(())
    }

    pub fn info(&mut self, message: impl Into<String>) -> Result<()> {
        self.log(LogEvent::Info {
            message: message.into(),
        })
    }
}

fn render_pretty(event: &LogEvent) -> String {
    match event {
        LogEvent::HeaderLine(header) => format!(
            "{:>8}  P{} {}  e{:<2} {}",
            header.frame_index, header.page, header.subcode, header.errors, header.caption
        ),
        LogEvent::Signal(signal) => match signal.frame_index {
            Some(frame) => format!(
                "[{}] {} frame {}: {}",
                signal.level, signal.subsystem, frame, signal.message
            ),
            None => format!("[{}] {}: {}", signal.level, signal.subsystem, signal.message),
        },
        LogEvent::Statistics(stats) => format!(
            "{:.2}s: {} frames, {} lines, {} rejects ({:.1}%), {} hamming errors, \
             {} parity failures, confidence {:.3} (min {:.3}, max {:.3})",
            stats.duration_secs,
            stats.frames_in,
            stats.lines_out,
            stats.rejects,
            stats.reject_ratio * 100.0,
            stats.hamming_errors,
            stats.parity_failures,
            stats.confidence.mean,
            stats.confidence.min,
            stats.confidence.max,
        ),
        LogEvent::Info { message } => format!("info: {}", message),
        LogEvent::Warn { message } => format!("warning: {}", message),
        LogEvent::Error { message } => format!("error: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_summary_basics() {
        let summary = StatSummary::from_samples(&[1.0, 2.0, 3.0]);
        assert!((summary.mean - 2.0).abs() < 1e-9);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn test_empty_summary_is_zeroed() {
        let summary = StatSummary::from_samples(&[]);
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.mean, 0.0);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = LogEvent::Info {
            message: "hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"info\""));
    }

    #[test]
    fn test_signal_events_carry_engine_entries() {
        use tapetext_core::logging::{LogConfig, SignalLogger, Subsystem};

        let engine_log = SignalLogger::new(LogConfig::verbose());
        engine_log.debug(Subsystem::Cri, 42u64, "no run-in peak in the search window");

        let entries = engine_log.drain();
        let event = SignalEvent::from(&entries[0]);
        assert_eq!(event.subsystem, "CRI");
        assert_eq!(event.frame_index, Some(42));

        let rendered = render_pretty(&LogEvent::Signal(event));
        assert!(rendered.contains("CRI frame 42"));
    }
}
