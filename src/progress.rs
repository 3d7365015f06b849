//! Progress reporting for long-running conversions
//!
//! Progress is a side channel only: a sink never influences whether a
//! conversion succeeds.

use std::sync::Mutex;
use tracing::info;

/// Receiver of per-disk conversion progress
pub trait ProgressSink {
    /// A conversion for `disk` is about to start
    fn start(&self, _disk: &str) {}

    /// `disk` is `percent` (0-100) done
    fn update(&self, disk: &str, percent: f32);

    /// The conversion for `disk` ended, successfully or not
    fn finish(&self, _disk: &str) {}
}

/// Logs progress through tracing in 10% steps
#[derive(Debug, Default)]
pub struct LogProgress {
    last_step: Mutex<Option<u32>>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LogProgress {
    fn start(&self, _disk: &str) {
        if let Ok(mut last) = self.last_step.lock() {
            *last = None;
        }
    }

    fn update(&self, disk: &str, percent: f32) {
        let step = (percent / 10.0).floor() as u32;
        let Ok(mut last) = self.last_step.lock() else {
            return;
        };
        if *last != Some(step) {
            *last = Some(step);
            info!(disk, percent = step * 10, "conversion progress");
        }
    }
}
