//! Prometheus metrics for the host daemon.
//!
//! Counters cover job outcomes and per-tool invocations. There is no HTTP
//! scrape endpoint in the host; [`HostMetrics::encode_text`] renders the
//! standard text exposition format, which the worker writes to
//! `<queue>/metrics.prom` on shutdown for a node-local collector to pick
//! up.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Registration or encoding failed.
    #[error("metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// The host metric family set.
#[derive(Debug)]
pub struct HostMetrics {
    registry: Registry,
    jobs_total: IntCounterVec,
    tool_invocations_total: IntCounterVec,
    tool_duration_ms_total: IntCounterVec,
}

impl HostMetrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when a family cannot be registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("machina_jobs_total", "Queue jobs processed by outcome"),
            &["outcome"],
        )?;
        let tool_invocations_total = IntCounterVec::new(
            Opts::new(
                "machina_tool_invocations_total",
                "Tool invocations by AID and status",
            ),
            &["aid", "status"],
        )?;
        let tool_duration_ms_total = IntCounterVec::new(
            Opts::new(
                "machina_tool_duration_ms_total",
                "Cumulative tool wall-clock milliseconds by AID",
            ),
            &["aid"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(tool_invocations_total.clone()))?;
        registry.register(Box::new(tool_duration_ms_total.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            tool_invocations_total,
            tool_duration_ms_total,
        })
    }

    /// Records one finished job.
    pub fn job_finished(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "fail" };
        self.jobs_total.with_label_values(&[outcome]).inc();
    }

    /// Records one tool invocation.
    pub fn tool_invoked(&self, aid: &str, ok: bool, duration_ms: u64) {
        let status = if ok { "ok" } else { "fail" };
        self.tool_invocations_total
            .with_label_values(&[aid, status])
            .inc();
        self.tool_duration_ms_total
            .with_label_values(&[aid])
            .inc_by(duration_ms);
    }

    /// Renders the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
