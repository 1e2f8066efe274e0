//! Periodic metrics sampling into the report series.
//!
//! The phase loops call [`Sampler::sample`] once per tick. Appending to the
//! page happens under its mutex and touches no await point; the `--debug`
//! dump logs the whole snapshot as one JSON line, and the optional
//! pushgateway push runs after the lock is released with its failures
//! logged and ignored.

use std::sync::{Arc, Mutex};

use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::pushgateway::Pushgateway;
use crate::report::Page;

pub struct Sampler {
    metrics: Arc<Metrics>,
    limiter: Arc<RateLimiter>,
    page: Arc<Mutex<Page>>,
    pushgateway: Option<Pushgateway>,
    debug: bool,
}

impl Sampler {
    pub fn new(
        metrics: Arc<Metrics>,
        limiter: Arc<RateLimiter>,
        page: Arc<Mutex<Page>>,
        pushgateway: Option<Pushgateway>,
        debug: bool,
    ) -> Self {
        Self {
            metrics,
            limiter,
            page,
            pushgateway,
            debug,
        }
    }

    pub async fn sample(&self) {
        let snapshot = self.metrics.snapshot();
        let limit = self.limiter.limit();

        if let Ok(mut page) = self.page.lock() {
            page.append(&snapshot, limit);
        }

        if self.debug {
            if let Ok(state) = serde_json::to_string(&snapshot) {
                tracing::debug!(qps = limit, state = %state, "sample");
            }
        }

        if let Some(gateway) = &self.pushgateway {
            if let Err(err) = gateway.push(&snapshot).await {
                tracing::warn!("pushgateway push failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_sample_appends_one_tick() {
        let metrics = Arc::new(Metrics::new());
        let limiter = Arc::new(RateLimiter::new(100.0));
        let page = Arc::new(Mutex::new(Page::new("test".into(), 0.5)));
        let sampler = Sampler::new(metrics.clone(), limiter, page.clone(), None, false);

        metrics.inc_request();
        sampler.sample().await;
        metrics.inc_request();
        sampler.sample().await;

        let page = page.lock().expect("page lock");
        assert_eq!(page.samples(), 2);
        assert_eq!(page.request_sum, vec![1, 2]);
        assert_eq!(page.qps, vec![100, 100]);
    }
}
