//! HTTP request execution against the target.
//!
//! One [`HttpClient`] is shared by every worker. A call to
//! [`HttpClient::execute`] performs a single request from the immutable
//! [`Target`] template and records its outcome into the shared metrics; it
//! never returns an error — failures are counters, not control flow.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use tokio::time::Instant;

use crate::metrics::{ErrorKind, Metrics};

/// Immutable request template, built once at startup and read by every
/// worker.
#[derive(Clone, Debug)]
pub struct Target {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Inclusive status range counted as success. Everything else is an error of
/// kind `Status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuccessPolicy {
    min: u16,
    max: u16,
}

impl SuccessPolicy {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Parse a range like `200-399` or a single status like `200`.
    pub fn parse(raw: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (lo, hi) = match raw.split_once('-') {
            Some((lo, hi)) => (lo.trim().parse()?, hi.trim().parse()?),
            None => {
                let only: u16 = raw.trim().parse()?;
                (only, only)
            }
        };
        if lo > hi {
            return Err(format!("empty status range: {raw}").into());
        }
        Ok(Self { min: lo, max: hi })
    }

    pub fn allows(&self, status: u16) -> bool {
        (self.min..=self.max).contains(&status)
    }
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self { min: 200, max: 399 }
    }
}

pub struct HttpClient {
    inner: reqwest::Client,
    target: Target,
    policy: SuccessPolicy,
    metrics: Arc<Metrics>,
    request_bytes: u64,
}

impl HttpClient {
    pub fn new(
        target: Target,
        policy: SuccessPolicy,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        let request_bytes = wire_size(&target);
        Ok(Self {
            inner,
            target,
            policy,
            metrics,
            request_bytes,
        })
    }

    /// Fire one request and account for it. The connection gauge counts
    /// requests currently on the wire.
    pub async fn execute(&self) {
        let m = &self.metrics;
        m.inc_request();
        m.conn_opened();
        m.add_bytes_written(self.request_bytes);

        let started = Instant::now();
        let sent = self
            .inner
            .request(self.target.method.clone(), self.target.url.clone())
            .headers(self.target.headers.clone())
            .body(self.target.body.clone())
            .send()
            .await;

        match sent {
            Ok(response) => {
                let status = response.status().as_u16();
                let header_bytes = response
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.as_str().len() + value.len() + 4) as u64)
                    .sum::<u64>();
                match response.bytes().await {
                    Ok(body) => {
                        m.add_bytes_read(header_bytes + body.len() as u64);
                        m.observe_duration(started.elapsed().as_secs_f64());
                        if self.policy.allows(status) {
                            m.inc_success();
                        } else {
                            m.inc_error(ErrorKind::Status);
                        }
                    }
                    Err(err) if err.is_timeout() => {
                        m.observe_duration(started.elapsed().as_secs_f64());
                        m.inc_error(ErrorKind::Timeout);
                    }
                    Err(_) => m.inc_error(ErrorKind::Transport),
                }
            }
            Err(err) if err.is_timeout() => {
                m.observe_duration(started.elapsed().as_secs_f64());
                m.inc_error(ErrorKind::Timeout);
            }
            Err(_) => m.inc_error(ErrorKind::Transport),
        }
        m.conn_closed();
    }
}

/// Estimated bytes a request puts on the wire: request line, headers, body.
fn wire_size(target: &Target) -> u64 {
    let request_line = target.method.as_str().len() + target.url.path().len() + 12;
    let headers = target
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum::<usize>();
    (request_line + headers + target.body.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    mod success_policy {
        use super::*;

        #[test]
        fn default_accepts_redirects() {
            let policy = SuccessPolicy::default();
            assert!(policy.allows(200));
            assert!(policy.allows(301));
            assert!(!policy.allows(404));
            assert!(!policy.allows(500));
        }

        #[test]
        fn parses_range_and_single_status() {
            assert_eq!(SuccessPolicy::parse("200-299").unwrap(), SuccessPolicy::new(200, 299));
            assert_eq!(SuccessPolicy::parse("204").unwrap(), SuccessPolicy::new(204, 204));
        }

        #[test]
        fn rejects_inverted_range() {
            assert!(SuccessPolicy::parse("400-200").is_err());
            assert!(SuccessPolicy::parse("abc").is_err());
        }
    }

    fn canned_server(status_line: &'static str, responses: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            for _ in 0..responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let body = "ok";
                let _ = write!(
                    stream,
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });
        format!("http://{addr}/")
    }

    fn target(url: &str) -> Target {
        Target {
            method: Method::GET,
            url: url.parse().expect("url"),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn successful_request_updates_all_counters() {
        let url = canned_server("HTTP/1.1 200 OK", 1);
        let metrics = Arc::new(Metrics::new());
        let client = HttpClient::new(
            target(&url),
            SuccessPolicy::default(),
            Duration::from_secs(5),
            metrics.clone(),
        )
        .expect("client");

        client.execute().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.request_sum, 1);
        assert_eq!(snap.request_success, 1);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.conn_open, 0);
        assert!(snap.bytes_written > 0);
        assert!(snap.bytes_read > 0);
        assert_eq!(snap.duration_buckets.iter().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn error_status_counts_as_status_error() {
        let url = canned_server("HTTP/1.1 503 Service Unavailable", 1);
        let metrics = Arc::new(Metrics::new());
        let client = HttpClient::new(
            target(&url),
            SuccessPolicy::default(),
            Duration::from_secs(5),
            metrics.clone(),
        )
        .expect("client");

        client.execute().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.request_sum, 1);
        assert_eq!(snap.request_success, 0);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.timeouts, 0);
    }

    #[tokio::test]
    async fn refused_connection_counts_as_transport_error() {
        // Bind then drop so the port is very likely closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };
        let metrics = Arc::new(Metrics::new());
        let client = HttpClient::new(
            target(&format!("http://{addr}/")),
            SuccessPolicy::default(),
            Duration::from_secs(5),
            metrics.clone(),
        )
        .expect("client");

        client.execute().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.request_sum, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.request_success, 0);
        assert_eq!(snap.conn_open, 0);
    }
}
