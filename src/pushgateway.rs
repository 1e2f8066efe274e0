//! Best-effort snapshot pushes to a Prometheus pushgateway.

use std::time::Duration;

use reqwest::Url;
use reqwest::header::CONTENT_TYPE;

use crate::metrics::{Snapshot, bucket_bound};

pub struct Pushgateway {
    endpoint: Url,
    client: reqwest::Client,
}

impl Pushgateway {
    /// The short timeout keeps a slow gateway from stalling the sample loop.
    pub fn new(endpoint: Url) -> Result<Self, Box<dyn std::error::Error>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self { endpoint, client })
    }

    pub async fn push(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>> {
        self.client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(exposition(snapshot))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Prometheus text exposition of a snapshot.
fn exposition(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (name, value) in [
        ("volley_request_sum", snapshot.request_sum),
        ("volley_request_success", snapshot.request_success),
        ("volley_errors", snapshot.errors),
        ("volley_timeouts", snapshot.timeouts),
        ("volley_conn_open", snapshot.conn_open),
        ("volley_bytes_written", snapshot.bytes_written),
        ("volley_bytes_read", snapshot.bytes_read),
    ] {
        out.push_str(&format!("{name} {value}\n"));
    }
    for (i, count) in snapshot.duration_buckets.iter().enumerate() {
        out.push_str(&format!(
            "volley_request_duration_bucket{{le=\"{}\"}} {count}\n",
            bucket_bound(i)
        ));
    }
    out
}
