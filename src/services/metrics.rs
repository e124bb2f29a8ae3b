//! Host resource sampling
//!
//! Samples CPU and memory while a run is in progress. The most recent samples are kept in a
//! rolling [`BoundedBuffer`]; running aggregates cover the whole run for the summary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::bounded_buffer::BoundedBuffer;
use super::logging::{LogSinks, Sink};

/// Default number of samples kept (2 minutes at 1 sample/sec)
pub const DEFAULT_WINDOW: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub at: DateTime<Utc>,
    /// Global CPU usage percentage (0-100)
    pub cpu_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Aggregates over every sample since the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSummary {
    pub samples: u64,
    pub avg_cpu: f32,
    pub peak_cpu: f32,
    pub peak_memory: u64,
    pub memory_total: u64,
}

impl ResourceSummary {
    pub fn describe(&self) -> String {
        format!(
            "samples={} | cpu_avg={:.1}% | cpu_peak={:.1}% | mem_peak={} / {}",
            self.samples,
            self.avg_cpu,
            self.peak_cpu,
            format_bytes_short(self.peak_memory),
            format_bytes_short(self.memory_total)
        )
    }
}

struct SamplerInner {
    sys: System,
    window: BoundedBuffer<ResourceSample>,
    count: u64,
    cpu_sum: f64,
    peak_cpu: f32,
    peak_memory: u64,
    memory_total: u64,
}

pub struct ResourceSampler {
    inner: RwLock<SamplerInner>,
    sinks: Arc<LogSinks>,
}

impl ResourceSampler {
    pub fn new(window: usize, sinks: Arc<LogSinks>) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();

        Self {
            inner: RwLock::new(SamplerInner {
                sys,
                window: BoundedBuffer::new(window),
                count: 0,
                cpu_sum: 0.0,
                peak_cpu: 0.0,
                peak_memory: 0,
                memory_total: 0,
            }),
            sinks,
        }
    }

    /// Take a sample from the host
    pub fn sample(&self) -> ResourceSample {
        let sample = {
            let mut inner = self.inner.write();
            inner.sys.refresh_cpu_all();
            inner.sys.refresh_memory();
            ResourceSample {
                at: Utc::now(),
                cpu_percent: inner.sys.global_cpu_usage(),
                memory_used: inner.sys.used_memory(),
                memory_total: inner.sys.total_memory(),
            }
        };
        self.record(sample);
        sample
    }

    /// Add a sample to the window and the aggregates
    pub fn record(&self, sample: ResourceSample) {
        {
            let mut inner = self.inner.write();
            inner.window.push(sample);
            inner.count += 1;
            inner.cpu_sum += f64::from(sample.cpu_percent);
            inner.peak_cpu = inner.peak_cpu.max(sample.cpu_percent);
            inner.peak_memory = inner.peak_memory.max(sample.memory_used);
            inner.memory_total = sample.memory_total;
        }

        self.sinks.record(
            Sink::ResourceLive,
            format!(
                "cpu={:.1}% | mem={} / {}",
                sample.cpu_percent,
                format_bytes_short(sample.memory_used),
                format_bytes_short(sample.memory_total)
            ),
        );
    }

    /// Samples currently in the rolling window, oldest first
    pub fn window(&self) -> Vec<ResourceSample> {
        self.inner.read().window.iter().copied().collect()
    }

    pub fn summary(&self) -> ResourceSummary {
        let inner = self.inner.read();
        ResourceSummary {
            samples: inner.count,
            avg_cpu: if inner.count > 0 {
                (inner.cpu_sum / inner.count as f64) as f32
            } else {
                0.0
            },
            peak_cpu: inner.peak_cpu,
            peak_memory: inner.peak_memory,
            memory_total: inner.memory_total,
        }
    }

    /// Forget all samples and aggregates
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.window.clear();
        inner.count = 0;
        inner.cpu_sum = 0.0;
        inner.peak_cpu = 0.0;
        inner.peak_memory = 0;
    }

    /// Sample every `interval` in the background until the handle is stopped
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> SamplerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let sampler = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sampler.sample();
                    }
                    _ = &mut stop_rx => {
                        debug!("Resource sampler stopped");
                        break;
                    }
                }
            }
        });

        SamplerHandle {
            stop: Some(stop_tx),
            handle,
        }
    }
}

pub struct SamplerHandle {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SamplerHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.handle.await;
    }
}

/// Format bytes as human-readable string (e.g., "2.5 GiB")
pub fn format_bytes_short(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a duration as e.g. "1h 5m 3s", whole seconds only
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, mins, secs) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);

    let parts: Vec<String> = [(days, "d"), (hours, "h"), (mins, "m")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .chain(std::iter::once(format!("{secs}s")))
        .collect();
    parts.join(" ")
}
