//! Hex/ASCII traffic dump
//!
//! Relay traffic is batched per direction and written to the
//! `serialcal::traffic` tracing target at debug level.

use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes held per batch before it is written out
pub const BATCH_SIZE: usize = 32;

/// Inactivity after which a partial batch is written out
pub const IDLE_FLUSH: Duration = Duration::from_millis(100);

const ROW_WIDTH: usize = 16;

/// Traffic direction, seen from this tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Console to device
    Outbound,
    /// Device to console
    Inbound,
}

impl Direction {
    fn marker(self) -> &'static str {
        match self {
            Self::Outbound => "-->",
            Self::Inbound => "<--",
        }
    }
}

/// Render `data` as rows of `"<marker> OOOO: hh hh ..  ascii"`
pub fn hex_dump(direction: Direction, data: &[u8]) -> Vec<String> {
    data.chunks(ROW_WIDTH)
        .enumerate()
        .map(|(row, chunk)| {
            let encoded = hex::encode(chunk);
            let pairs: Vec<&str> = encoded
                .as_bytes()
                .chunks(2)
                .filter_map(|pair| std::str::from_utf8(pair).ok())
                .collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!(
                "{} {:04x}: {:<width$}  {}",
                direction.marker(),
                row * ROW_WIDTH,
                pairs.join(" "),
                ascii,
                width = ROW_WIDTH * 3 - 1
            )
        })
        .collect()
}

/// Per-direction batching of relay traffic
#[derive(Debug)]
pub struct TrafficDump {
    enabled: bool,
    direction: Option<Direction>,
    batch: Vec<u8>,
    last_activity: Instant,
}

impl TrafficDump {
    /// A dump that only records when `enabled`
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            direction: None,
            batch: Vec::with_capacity(BATCH_SIZE),
            last_activity: Instant::now(),
        }
    }

    /// True when recording
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record bytes moving in `direction`. A direction change or a full batch
    /// writes out the pending batch first.
    pub fn record(&mut self, direction: Direction, bytes: &[u8]) -> Vec<String> {
        let mut rows = Vec::new();
        if !self.enabled {
            return rows;
        }
        for &byte in bytes {
            if self.direction != Some(direction) {
                rows.extend(self.flush());
                self.direction = Some(direction);
            }
            self.batch.push(byte);
            if self.batch.len() >= BATCH_SIZE {
                rows.extend(self.flush());
                self.direction = Some(direction);
            }
        }
        self.last_activity = Instant::now();
        rows
    }

    /// Write out a partial batch once the line has been idle long enough
    pub fn tick(&mut self) -> Vec<String> {
        if !self.batch.is_empty() && self.last_activity.elapsed() >= IDLE_FLUSH {
            self.flush()
        } else {
            Vec::new()
        }
    }

    /// Write out whatever is pending
    pub fn flush(&mut self) -> Vec<String> {
        let Some(direction) = self.direction.take() else {
            return Vec::new();
        };
        if self.batch.is_empty() {
            return Vec::new();
        }
        let rows = hex_dump(direction, &self.batch);
        for row in &rows {
            debug!(target: "serialcal::traffic", "{}", row);
        }
        self.batch.clear();
        rows
    }
}
