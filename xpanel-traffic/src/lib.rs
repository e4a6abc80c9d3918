//! Traffic accounting engine.
//!
//! Turns the data plane's cumulative byte counters into live used-bytes per
//! inbound and per user, day-bucketed totals, and enforcement actions when
//! quotas are crossed. The measured data plane never touches this code on
//! the hot path; counters are sampled out-of-band on a short interval.

mod engine;
mod rollup;

pub use engine::TrafficEngine;

use async_trait::async_trait;
use xpanel_core::{InboundId, Result};

/// One cumulative counter pair as published by the data plane.
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub inbound_id: InboundId,
    pub upstream: i64,
    pub downstream: i64,
}

/// Where cumulative counters come from. The engine crate implements this
/// against the child process's local stats API; tests script it.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<CounterSample>>;
}

/// Handle used to ask the listener manager for a reconcile after an
/// enforcement action took an inbound down. Non-blocking; a full queue means
/// a reconcile is already pending.
pub type ReconcileTx = tokio::sync::mpsc::Sender<()>;
