use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use serde::Serialize;
use std::time::Duration;

use crate::telemetry::generate_boundaries;

/// Process-wide pipeline counters.
///
/// Each counter is an independent atomic, never reset during a run. They are
/// read for observability only.
pub struct PipelineStats {
    pub frames_received: IntCounter,
    pub frames_dropped: IntCounter,
    pub frames_inferred: IntCounter,
    pub inference_timeouts: IntCounter,
    pub frames_published: IntCounter,
    pub corrupt_frames: IntCounter,
    pub transport_reconnects: IntCounter,
    pub accelerator_faults: IntCounter,
    pub accelerator_reinits: IntCounter,
    pub encode_failures: IntCounter,
    inference_duration: Histogram,
    frame_age: Histogram,
    last_frame_age: IntGauge,
    pub registry: Registry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_inferred: u64,
    pub inference_timeouts: u64,
    pub frames_published: u64,
    pub corrupt_frames: u64,
    pub transport_reconnects: u64,
    pub accelerator_faults: u64,
    pub accelerator_reinits: u64,
    pub encode_failures: u64,
    pub last_frame_age_ms: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram, prometheus::Error> {
    let opts = HistogramOpts::new(name, help).buckets(generate_boundaries((15, 30, 60, 500, 1000)));
    let histogram = Histogram::with_opts(opts)?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl PipelineStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pipeline".into()), None)?;

        Ok(Self {
            frames_received: counter(&registry, "frames_received_total", "Frames decoded by the source")?,
            frames_dropped: counter(&registry, "frames_dropped_total", "Frames displaced in the frame buffer")?,
            frames_inferred: counter(&registry, "frames_inferred_total", "Frames with a completed inference")?,
            inference_timeouts: counter(&registry, "inference_timeouts_total", "Accelerator jobs that timed out")?,
            frames_published: counter(&registry, "frames_published_total", "Annotated frames published")?,
            corrupt_frames: counter(&registry, "corrupt_frames_total", "Malformed payloads discarded by the source")?,
            transport_reconnects: counter(&registry, "transport_reconnects_total", "Source transport reconnections")?,
            accelerator_faults: counter(&registry, "accelerator_faults_total", "Accelerator device faults")?,
            accelerator_reinits: counter(&registry, "accelerator_reinits_total", "Accelerator re-initialisations")?,
            encode_failures: counter(&registry, "encode_failures_total", "Frames skipped because encoding failed")?,
            inference_duration: histogram(
                &registry,
                "inference_duration_ms",
                "Duration of accelerator jobs in milliseconds",
            )?,
            frame_age: histogram(
                &registry,
                "frame_age_ms",
                "Time from capture to publication in milliseconds",
            )?,
            last_frame_age: {
                let gauge = IntGauge::new("last_frame_age_ms", "Age of the last published frame")?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            },
            registry,
        })
    }

    pub fn record_inference_duration(&self, elapsed: Duration) {
        self.inference_duration.observe(elapsed.as_secs_f64() * 1000.);
    }

    pub fn record_frame_age(&self, age: Duration) {
        let age_ms = age.as_secs_f64() * 1000.;
        self.frame_age.observe(age_ms);
        self.last_frame_age.set(age_ms.round() as i64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.get(),
            frames_dropped: self.frames_dropped.get(),
            frames_inferred: self.frames_inferred.get(),
            inference_timeouts: self.inference_timeouts.get(),
            frames_published: self.frames_published.get(),
            corrupt_frames: self.corrupt_frames.get(),
            transport_reconnects: self.transport_reconnects.get(),
            accelerator_faults: self.accelerator_faults.get(),
            accelerator_reinits: self.accelerator_reinits.get(),
            encode_failures: self.encode_failures.get(),
            last_frame_age_ms: self.last_frame_age.get().max(0) as u64,
        }
    }
}
