//! Process-wide metrics sink, injected once at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    configs: AtomicU64,
    config_polls_total: AtomicU64,
    config_poll_failures_total: AtomicU64,
    config_poll_duration_sum_us: AtomicU64,
    config_poll_duration_count: AtomicU64,
    engines_started_total: AtomicU64,
    engines_stopped_total: AtomicU64,
}

impl ManagerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many tenant configs the manager currently knows about.
    pub fn set_configs(&self, n: u64) {
        self.configs.store(n, Ordering::Relaxed);
    }

    pub fn configs(&self) -> u64 {
        self.configs.load(Ordering::Relaxed)
    }

    pub fn record_poll(&self, start: Instant, ok: bool) {
        self.config_polls_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.config_poll_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
        let us = start.elapsed().as_micros() as u64;
        self.config_poll_duration_sum_us
            .fetch_add(us, Ordering::Relaxed);
        self.config_poll_duration_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_engines_started(&self) {
        self.engines_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_engines_stopped(&self) {
        self.engines_stopped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_totals(&self) -> (u64, u64) {
        (
            self.config_polls_total.load(Ordering::Relaxed),
            self.config_poll_failures_total.load(Ordering::Relaxed),
        )
    }

    pub fn poll_duration_vals(&self) -> (u64, u64) {
        (
            self.config_poll_duration_sum_us.load(Ordering::Relaxed),
            self.config_poll_duration_count.load(Ordering::Relaxed),
        )
    }

    pub fn engine_totals(&self) -> (u64, u64) {
        (
            self.engines_started_total.load(Ordering::Relaxed),
            self.engines_stopped_total.load(Ordering::Relaxed),
        )
    }
}

pub fn render_prometheus(m: &Arc<ManagerMetrics>) -> String {
    let mut out = String::with_capacity(512);

    write_metric(&mut out, "alertmux_configs", "gauge", &[("", m.configs())]);

    let (polls, failures) = m.poll_totals();
    write_metric(&mut out, "alertmux_config_polls_total", "counter", &[("", polls)]);
    write_metric(
        &mut out,
        "alertmux_config_poll_failures_total",
        "counter",
        &[("", failures)],
    );

    let (sum, count) = m.poll_duration_vals();
    write_metric(
        &mut out,
        "alertmux_configs_request_duration_us",
        "summary",
        &[("_sum", sum), ("_count", count)],
    );

    let (started, stopped) = m.engine_totals();
    write_metric(
        &mut out,
        "alertmux_engines_started_total",
        "counter",
        &[("", started)],
    );
    write_metric(
        &mut out,
        "alertmux_engines_stopped_total",
        "counter",
        &[("", stopped)],
    );

    out
}

/// One `# TYPE` line plus a sample per `(suffix, value)` pair; summaries
/// pass their `_sum`/`_count` series, plain metrics a single empty suffix.
fn write_metric(out: &mut String, name: &str, kind: &str, samples: &[(&str, u64)]) {
    use std::fmt::Write;
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for (suffix, value) in samples {
        let _ = writeln!(out, "{name}{suffix} {value}");
    }
}
