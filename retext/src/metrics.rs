use std::collections::VecDeque;

use serde::Serialize;

use crate::session::SessionStats;
use crate::utils::now_epoch_ms;

const DEFAULT_WINDOW_SIZE: usize = 256;
const INFERENCE_P95_TARGET_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub samples: usize,
    pub average_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl MetricSummary {
    fn empty() -> Self {
        Self {
            samples: 0,
            average_ms: 0,
            p95_ms: 0,
            max_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub generated_at_ms: u64,
    pub inference: MetricSummary,
    pub write_back: MetricSummary,
    pub revisions: u64,
    pub superseded_results: u64,
    pub empty_results: u64,
    pub session: SessionStats,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct RollingMetric {
    values: VecDeque<u64>,
    capacity: usize,
}

impl RollingMetric {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, value_ms: u64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value_ms);
    }

    fn summary(&self) -> MetricSummary {
        if self.values.is_empty() {
            return MetricSummary::empty();
        }

        let samples = self.values.len();
        let sum: u64 = self.values.iter().sum();
        let average_ms = sum / samples as u64;
        let max_ms = self.values.iter().copied().max().unwrap_or(0);

        let mut sorted = self.values.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();
        let p95_index = ((samples as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(samples - 1);
        let p95_ms = sorted[p95_index];

        MetricSummary {
            samples,
            average_ms,
            p95_ms,
            max_ms,
        }
    }
}

#[derive(Debug)]
pub struct RuntimeMetrics {
    inference_ms: RollingMetric,
    write_back_ms: RollingMetric,
    revisions: u64,
    superseded_results: u64,
    empty_results: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            inference_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            write_back_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            revisions: 0,
            superseded_results: 0,
            empty_results: 0,
        }
    }

    pub fn record_inference(&mut self, latency_ms: u64) {
        self.inference_ms.record(latency_ms);
    }

    pub fn record_write_back(&mut self, latency_ms: u64) {
        self.write_back_ms.record(latency_ms);
    }

    pub fn record_revision(&mut self) {
        self.revisions += 1;
    }

    pub fn record_superseded(&mut self) {
        self.superseded_results += 1;
    }

    pub fn record_empty_result(&mut self) {
        self.empty_results += 1;
    }

    pub fn report(&self, session: SessionStats) -> PerformanceReport {
        let inference = self.inference_ms.summary();
        let write_back = self.write_back_ms.summary();

        let mut warnings = Vec::new();
        if inference.samples > 0 && inference.p95_ms > INFERENCE_P95_TARGET_MS {
            warnings.push(format!(
                "Inference P95 latency {}ms exceeded target {}ms; consider a smaller model.",
                inference.p95_ms, INFERENCE_P95_TARGET_MS
            ));
        }
        if self.empty_results > 0 {
            warnings.push(format!(
                "Model returned {} empty corrections after cleanup.",
                self.empty_results
            ));
        }
        if session.manual_recoveries > 0 {
            warnings.push(format!(
                "Device context was lost {} time(s) beyond automatic recovery.",
                session.manual_recoveries
            ));
        }

        PerformanceReport {
            generated_at_ms: now_epoch_ms(),
            inference,
            write_back,
            revisions: self.revisions,
            superseded_results: self.superseded_results,
            empty_results: self.empty_results,
            session,
            warnings,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
