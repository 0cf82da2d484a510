use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::Result;

pub const DEFAULT_WARMUP: usize = 10;
pub const DEFAULT_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub label: String,
    pub device: String,
    pub warmup: usize,
    pub iterations: usize,
    pub total_ms: f64,
    pub mean_us: f64,
}

impl ProfileReport {
    pub fn calls_per_second(&self) -> f64 {
        if self.total_ms <= 0.0 {
            return f64::INFINITY;
        }
        self.iterations as f64 / (self.total_ms / 1000.0)
    }
}

/// Warm-up then timed repetition of a closure, bracketed by device barriers so queued
/// work is inside the measured window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Profiler {
    pub warmup: usize,
    pub iterations: usize,
}

impl Default for Profiler {
    fn default() -> Self {
        Self {
            warmup: DEFAULT_WARMUP,
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl Profiler {
    pub fn new(warmup: usize, iterations: usize) -> Self {
        Self { warmup, iterations }
    }

    pub fn profile<F>(&self, label: &str, device: &Device, mut op: F) -> Result<ProfileReport>
    where
        F: FnMut() -> Result<()>,
    {
        for _ in 0..self.warmup {
            op()?;
        }
        device.synchronize()?;
        let start = Instant::now();
        for _ in 0..self.iterations {
            op()?;
        }
        device.synchronize()?;
        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mean_us = if self.iterations == 0 {
            0.0
        } else {
            total_ms * 1000.0 / self.iterations as f64
        };
        info!(
            "{label:>12} on {}: {:.3} ms total, {:.3} us/call over {} iterations",
            device.name(),
            total_ms,
            mean_us,
            self.iterations
        );
        Ok(ProfileReport {
            label: label.to_string(),
            device: device.name(),
            warmup: self.warmup,
            iterations: self.iterations,
            total_ms,
            mean_us,
        })
    }
}
