//! The three-phase load controller.
//!
//! A run moves through Burst → Calibrate → Load, then the caller renders the
//! report. The controller owns every moving part — limiter, pool, metrics,
//! sampler, adaptive state — so the phases are plain methods and the whole
//! machine is constructible in a test.
//!
//! # Burst
//! For [`BURST_DURATION`] the controller bypasses the limiter and stuffs the
//! job queue as fast as it accepts, spinning on overflow; the point is to
//! find the raw pipeline depth the target sustains. At the deadline the
//! observed throughput becomes the starting rate, and if more than 2% of
//! requests failed both the rate and the worker count are halved.
//!
//! # Calibrate
//! For [`CALIBRATE_DURATION`] the paced driver runs at the starting rate
//! while every sample tick evaluates one escalation step:
//!
//! - a strict increase in the error counter since the last evaluation means
//!   the previous escalation overloaded the target: shrink the step
//!   (`multiplier /= 1.2`) and back off for three ticks;
//! - otherwise, a nonzero queue backlog means the workers are the
//!   bottleneck: grow the pool by `workers × multiplier`;
//! - otherwise the rate is the bottleneck: raise it by `1 + multiplier`.
//!
//! Each escalation waits one tick before the next decision so the counters
//! reflect it. The multiplier only ever shrinks, so the search terminates;
//! below `1e-4` the phase stops early.
//!
//! # Load
//! The calibrated `(qps, workers)` pair is applied in ten equal steps spread
//! over the first half of the phase — one step every `T_load / 20`, floored
//! at one sample period — then held steady until the deadline.
//!
//! # Driving
//! Calibrate and Load share one driver loop: wait for a limiter token,
//! submit one job, repeat. The per-phase stop signal is a `watch` channel
//! observed by the driver (which drains the pool on its way out) and by
//! nothing else — workers never see it; they just go idle on the empty
//! queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use typed_builder::TypedBuilder;

use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::sampler::Sampler;

/// Duration of the uncapped burst probe.
pub const BURST_DURATION: Duration = Duration::from_secs(5);

/// Duration of the adaptive calibration phase.
pub const CALIBRATE_DURATION: Duration = Duration::from_secs(10);

/// Period between metric samples.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(500);

/// Calibration stops once the step size shrinks below this.
const MULTIPLIER_FLOOR: f64 = 1e-4;

/// Step-size decay applied on every retreat.
const RETREAT_DIVISOR: f64 = 1.2;

/// Error ratio above which the burst outcome is halved.
const BURST_ERROR_BUDGET: f64 = 0.02;

/// Number of ramp steps in the load phase.
const LOAD_STEPS: u32 = 10;

/// The rate/worker pair a phase hands to the next.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadConfig {
    pub qps: f64,
    pub workers: usize,
}

/// Mutable state of the calibration search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveState {
    /// Escalation step size. Only ever divided, never restored.
    pub multiplier: f64,
    /// Ticks to skip before the next evaluation.
    pub cooldown: u32,
    /// Error count at the last evaluation that observed errors.
    pub last_errors: u64,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            multiplier: 0.1,
            cooldown: 0,
            last_errors: 0,
        }
    }
}

/// One calibration decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Adjustment {
    /// Step size is negligible; stop the phase.
    Halt,
    /// Still cooling down from the previous move.
    Cooldown,
    /// Workers are the bottleneck: grow the pool by this many.
    AddWorkers(usize),
    /// Rate is the bottleneck: raise the limiter to this.
    RaiseRate(f64),
    /// New errors appeared: shrink the step and back off.
    Retreat,
}

/// Pure decision function behind the calibration loop. The keystone rule is
/// error-delta gating: only a strict increase over `last_errors` counts as
/// evidence of overload, so a stable baseline of failures does not block
/// escalation.
pub fn next_adjustment(
    state: AdaptiveState,
    errors: u64,
    backlog: usize,
    workers: usize,
    limit: f64,
) -> Adjustment {
    if state.multiplier.abs() < MULTIPLIER_FLOOR {
        return Adjustment::Halt;
    }
    if state.cooldown > 0 {
        return Adjustment::Cooldown;
    }
    if errors > state.last_errors {
        return Adjustment::Retreat;
    }
    if backlog > 0 {
        Adjustment::AddWorkers((workers as f64 * state.multiplier) as usize)
    } else {
        Adjustment::RaiseRate(limit * (1.0 + state.multiplier))
    }
}

/// Starting configuration derived from the burst probe.
pub fn burst_outcome(
    request_sum: u64,
    errors: u64,
    elapsed: Duration,
    workers: usize,
) -> LoadConfig {
    let mut qps = request_sum as f64 / elapsed.as_secs_f64();
    let mut workers = workers;
    if request_sum > 0 && errors as f64 / request_sum as f64 > BURST_ERROR_BUDGET {
        qps /= 2.0;
        workers /= 2;
    }
    LoadConfig { qps, workers }
}

/// Interval between load-phase ramp steps: ten steps across the first half
/// of the phase, never finer than one sample period.
pub fn step_interval(load_duration: Duration, sample_period: Duration) -> Duration {
    (load_duration / (LOAD_STEPS * 2)).max(sample_period)
}

#[derive(TypedBuilder)]
pub struct Controller<F, Fut>
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    metrics: Arc<Metrics>,
    limiter: Arc<RateLimiter>,
    pool: Arc<WorkerPool<F, Fut>>,
    sampler: Sampler,
    initial_workers: usize,
    load_duration: Duration,
    #[builder(default)]
    fixed_qps: Option<f64>,
    #[builder(default = BURST_DURATION)]
    burst_duration: Duration,
    #[builder(default = CALIBRATE_DURATION)]
    calibrate_duration: Duration,
    #[builder(default = SAMPLE_PERIOD)]
    sample_period: Duration,
    #[builder(default, setter(skip))]
    adaptive: AdaptiveState,
}

impl<F, Fut> Controller<F, Fut>
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Run the whole state machine once: discover (or accept) a rate/worker
    /// pair, then apply the ramped load.
    pub async fn run(&mut self) {
        // A user-supplied rate is applied as-is; only a discovered rate is
        // ramped in, since discovery already stressed the target.
        let (cfg, ramp) = match self.fixed_qps {
            Some(qps) if qps > 0.0 => (
                LoadConfig {
                    qps,
                    workers: self.initial_workers,
                },
                false,
            ),
            _ => {
                tracing::info!("running burst phase");
                let cfg = self.burst().await;
                tracing::info!(qps = cfg.qps, workers = cfg.workers, "running calibrate phase");
                (self.calibrate(cfg).await, true)
            }
        };
        tracing::info!(qps = cfg.qps, workers = cfg.workers, "running load phase");
        self.load(cfg, ramp).await;
    }

    /// Uncapped probe: saturate the queue until the deadline, then read the
    /// achieved throughput off the counters.
    async fn burst(&mut self) -> LoadConfig {
        let started = Instant::now();
        self.pool.run_workers(self.initial_workers);

        let deadline = started + self.burst_duration;
        while Instant::now() < deadline {
            // Overflow is expected: the queue being full IS the probe
            // running at max depth. Keep spinning.
            let _ = self.pool.try_submit();
            tokio::task::yield_now().await;
        }

        let request_sum = self.metrics.request_sum();
        let errors = self.metrics.errors();
        let cfg = burst_outcome(request_sum, errors, self.burst_duration, self.pool.workers());
        self.adaptive.last_errors = errors;
        self.pool.flush().await;
        self.summary("burst", started);
        cfg
    }

    /// Closed-loop search for the highest sustainable rate/worker pair.
    async fn calibrate(&mut self, cfg: LoadConfig) -> LoadConfig {
        let started = Instant::now();
        let current = self.pool.workers();
        if cfg.workers > current {
            self.pool.run_workers(cfg.workers - current);
        }
        self.limiter.set_limit(cfg.qps);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = self.spawn_driver(stop_rx);

        let deadline = time::sleep(self.calibrate_duration);
        tokio::pin!(deadline);
        let mut tick = time::interval_at(Instant::now() + self.sample_period, self.sample_period);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tick.tick() => {
                    self.sampler.sample().await;
                    tracing::debug!(
                        multiplier = self.adaptive.multiplier,
                        qps = self.limiter.limit(),
                        workers = self.pool.workers(),
                        backlog = self.pool.backlog(),
                        "calibrate tick"
                    );
                    if self.calibrate_step() {
                        break;
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        let _ = driver.await;
        let cfg = LoadConfig {
            qps: self.limiter.limit(),
            workers: self.pool.workers(),
        };
        self.summary("calibrate", started);
        cfg
    }

    /// Apply one calibration decision. Returns true when the phase should
    /// stop early.
    fn calibrate_step(&mut self) -> bool {
        let errors = self.metrics.errors();
        match next_adjustment(
            self.adaptive,
            errors,
            self.pool.backlog(),
            self.pool.workers(),
            self.limiter.limit(),
        ) {
            Adjustment::Halt => {
                tracing::debug!("step size negligible, stopping calibration early");
                true
            }
            Adjustment::Cooldown => {
                self.adaptive.cooldown -= 1;
                false
            }
            Adjustment::AddWorkers(n) => {
                self.pool.run_workers(n);
                self.adaptive.cooldown = 1;
                false
            }
            Adjustment::RaiseRate(rate) => {
                self.limiter.set_limit(rate);
                self.adaptive.cooldown = 1;
                false
            }
            Adjustment::Retreat => {
                self.adaptive.multiplier /= RETREAT_DIVISOR;
                self.adaptive.cooldown = 3;
                self.adaptive.last_errors = errors;
                false
            }
        }
    }

    /// Apply the target configuration — in ten steps over the first half of
    /// the phase when ramping, all at once otherwise — then hold until the
    /// deadline.
    async fn load(&mut self, cfg: LoadConfig, ramp: bool) {
        let started = Instant::now();
        let qps_step = cfg.qps / f64::from(LOAD_STEPS);
        let worker_step = (cfg.workers / LOAD_STEPS as usize).max(1);
        let mut steps = if ramp { 1u32 } else { LOAD_STEPS };

        if ramp {
            self.limiter.set_limit(qps_step);
            self.pool.run_workers(worker_step);
        } else {
            self.limiter.set_limit(cfg.qps);
            self.pool.run_workers(cfg.workers);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = self.spawn_driver(stop_rx);

        let deadline = time::sleep(self.load_duration);
        tokio::pin!(deadline);
        let step = step_interval(self.load_duration, self.sample_period);
        let mut step_tick = time::interval_at(Instant::now() + step, step);
        let mut sample_tick =
            time::interval_at(Instant::now() + self.sample_period, self.sample_period);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = step_tick.tick() => {
                    if steps < LOAD_STEPS {
                        self.limiter.set_limit(self.limiter.limit() + qps_step);
                        self.pool.run_workers(worker_step);
                        steps += 1;
                    }
                }
                _ = sample_tick.tick() => {
                    self.sampler.sample().await;
                }
            }
        }

        let _ = stop_tx.send(true);
        let _ = driver.await;
        self.summary("load", started);
    }

    fn spawn_driver(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(drive(self.limiter.clone(), self.pool.clone(), stop))
    }

    fn summary(&self, phase: &str, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let snapshot = self.metrics.snapshot();
        let success_pct = if snapshot.request_sum > 0 {
            snapshot.request_success as f64 / snapshot.request_sum as f64 * 100.0
        } else {
            0.0
        };
        tracing::info!(
            phase,
            elapsed_secs = elapsed,
            requests = snapshot.request_sum,
            success_pct,
            rps = snapshot.request_sum as f64 / elapsed,
            connections = snapshot.conn_open,
            errors = snapshot.errors,
            timeouts = snapshot.timeouts,
            "phase finished"
        );
    }
}

/// Paced driver shared by the calibrate and load phases: one limiter token
/// buys one job submission. On the stop signal it drains the pool and
/// exits; in-flight requests finish on their own.
pub async fn drive<F, Fut>(
    limiter: Arc<RateLimiter>,
    pool: Arc<WorkerPool<F, Fut>>,
    mut stop: watch::Receiver<bool>,
) where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    pool.flush().await;
                    return;
                }
            }
            _ = limiter.wait() => {
                pool.submit().await;
            }
        }
    }
}
