use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub degraded_answers: u64,
    pub latencies: VecDeque<u64>, // microseconds
}

#[derive(Debug, Clone, Default)]
pub struct ConversionMetrics {
    pub total_jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query_metrics: QueryMetrics,
    conversion_metrics: ConversionMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query_metrics: QueryMetrics::default(),
                conversion_metrics: ConversionMetrics::default(),
                max_history,
            })),
        }
    }

    pub fn record_query(&self, latency_us: u64, degraded: bool) {
        let mut state = self.state.lock().unwrap();
        state.query_metrics.total_queries += 1;
        if degraded {
            state.query_metrics.degraded_answers += 1;
        }
        state.query_metrics.latencies.push_back(latency_us);
        if state.query_metrics.latencies.len() > state.max_history {
            state.query_metrics.latencies.pop_front();
        }
    }

    pub fn record_conversion_job(&self, succeeded: bool, retried: bool) {
        let mut state = self.state.lock().unwrap();
        state.conversion_metrics.total_jobs += 1;
        if succeeded {
            state.conversion_metrics.succeeded += 1;
        } else {
            state.conversion_metrics.failed += 1;
        }
        if retried {
            state.conversion_metrics.retried += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let q = &state.query_metrics;
        let c = &state.conversion_metrics;

        let mut sorted_latencies: Vec<u64> = q.latencies.iter().copied().collect();
        sorted_latencies.sort_unstable();

        let p50 = percentile(&sorted_latencies, 50.0);
        let p95 = percentile(&sorted_latencies, 95.0);
        let p99 = percentile(&sorted_latencies, 99.0);

        let degraded_rate = if q.total_queries > 0 {
            q.degraded_answers as f32 / q.total_queries as f32
        } else {
            0.0
        };

        let conversion_success_rate = if c.total_jobs > 0 {
            c.succeeded as f32 / c.total_jobs as f32
        } else {
            0.0
        };

        MetricsSnapshot {
            total_queries: q.total_queries,
            degraded_rate,
            p50,
            p95,
            p99,
            history_count: q.latencies.len(),
            total_conversion_jobs: c.total_jobs,
            conversion_success_rate,
        }
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub degraded_rate: f32,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub history_count: usize,
    pub total_conversion_jobs: u64,
    pub conversion_success_rate: f32,
}
