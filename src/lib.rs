//! Volley — an adaptive HTTP load generator.
//!
//! Volley discovers how hard a target can be pushed, then pushes it exactly
//! that hard for as long as you asked. A run has three phases: an uncapped
//! **burst** probe that estimates raw throughput, a closed-loop **calibrate**
//! search that raises the rate or the worker count until the target shows
//! new errors, and a stepped **load** ramp that holds the calibrated traffic
//! for the requested duration. The whole run ends in a single
//! self-contained HTML report.
//!
//! # Architecture
//!
//! The building blocks, smallest first:
//!
//! - [`metrics::Metrics`]: lock-free counters and a latency histogram shared
//!   by every worker.
//! - [`limiter::RateLimiter`]: capacity-1 token bucket pacing the driver;
//!   the rate is adjustable mid-flight.
//! - [`pool::WorkerPool`]: a grow-only set of workers draining a bounded job
//!   queue; generic over the job action.
//! - [`client::HttpClient`]: executes one templated request per job and
//!   records the outcome into the metrics.
//! - [`sampler::Sampler`]: snapshots the metrics on a fixed tick into the
//!   report series.
//! - [`controller::Controller`]: owns all of the above and runs the phase
//!   state machine.
//! - [`report`]: the time-series page and its HTML rendering.
//! - [`pushgateway::Pushgateway`]: optional best-effort snapshot pushes.

pub mod client;
pub mod controller;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod pushgateway;
pub mod report;
pub mod sampler;

pub use client::{HttpClient, SuccessPolicy, Target};
pub use controller::{Controller, LoadConfig};
pub use limiter::RateLimiter;
pub use metrics::{Metrics, Snapshot};
pub use pool::WorkerPool;
pub use report::{HtmlReporter, Page, Reporter};
pub use sampler::Sampler;
