use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing_subscriber::EnvFilter;

use volley::controller::{Controller, SAMPLE_PERIOD};
use volley::pushgateway::Pushgateway;
use volley::{
    HtmlReporter, HttpClient, Metrics, Page, RateLimiter, Reporter, Sampler, SuccessPolicy,
    Target, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(
    name = "volley",
    version,
    about = "Adaptive HTTP load generator",
    after_help = "EXAMPLES:
  Discover a sustainable rate:    volley http://target/ -c 50 -d 60
  Fixed rate:                     volley http://target/ -q 100 -c 10 -d 30
  POST with headers:              volley http://target/ -X POST -H \"Content-Type: application/json\" --body '{}'"
)]
struct Args {
    /// Target URL
    target: String,

    /// Fixed request rate; 0 runs burst+calibrate to discover one
    #[arg(short = 'q', long, default_value_t = 0.0)]
    qps: f64,

    /// Initial worker count
    #[arg(short = 'c', long, default_value_t = num_cpus::get() * 8)]
    connections: usize,

    /// Load phase duration in seconds
    #[arg(short = 'd', long, default_value_t = 30)]
    duration: u64,

    /// Per-request timeout in seconds
    #[arg(short = 't', long, default_value_t = 5)]
    timeout: u64,

    /// Report output path
    #[arg(short = 'o', long, default_value = "report.html")]
    output: PathBuf,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Custom header ("Name: value"), repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(long)]
    body: Option<String>,

    /// Status range counted as success, e.g. 200-299
    #[arg(long, default_value = "200-399")]
    accept: String,

    /// Push a metrics snapshot to this pushgateway URL every sample tick
    #[arg(long)]
    pushgateway: Option<String>,

    /// Verbose per-tick state dump
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    let url: Url = args.target.parse()?;
    let target = Target {
        method: reqwest::Method::from_str(&args.method)?,
        url: url.clone(),
        headers: parse_headers(&args.headers)?,
        body: args.body.clone().unwrap_or_default().into_bytes(),
    };
    let policy = SuccessPolicy::parse(&args.accept)?;

    let metrics = Arc::new(Metrics::new());
    let limiter = Arc::new(RateLimiter::new(1.0));
    let client = Arc::new(HttpClient::new(
        target,
        policy,
        Duration::from_secs(args.timeout),
        metrics.clone(),
    )?);
    let page = Arc::new(Mutex::new(Page::new(
        url.host_str().unwrap_or("target").to_string(),
        SAMPLE_PERIOD.as_secs_f64(),
    )));
    let pushgateway = match &args.pushgateway {
        Some(endpoint) => Some(Pushgateway::new(endpoint.parse()?)?),
        None => None,
    };
    let sampler = Sampler::new(
        metrics.clone(),
        limiter.clone(),
        page.clone(),
        pushgateway,
        args.debug,
    );

    let pool = Arc::new(WorkerPool::new({
        let client = client.clone();
        move || {
            let client = client.clone();
            async move { client.execute().await }
        }
    }));

    let mut controller = Controller::builder()
        .metrics(metrics)
        .limiter(limiter)
        .pool(pool)
        .sampler(sampler)
        .initial_workers(args.connections.max(1))
        .fixed_qps((args.qps > 0.0).then_some(args.qps))
        .load_duration(Duration::from_secs(args.duration))
        .build();
    controller.run().await;

    let finished = page
        .lock()
        .map_err(|_| "report page mutex poisoned")?
        .clone();
    let reporter = HtmlReporter {
        path: args.output.clone(),
    };
    reporter.report(finished).await?;
    tracing::info!(path = %args.output.display(), "report written");
    Ok(())
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap, Box<dyn Error>> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once(':')
            .ok_or_else(|| format!("malformed header (expected \"Name: value\"): {entry}"))?;
        headers.insert(
            HeaderName::from_str(name.trim())?,
            HeaderValue::from_str(value.trim())?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_parse_and_trim() {
        let headers =
            parse_headers(&["Authorization: Bearer token".into(), "X-Id:42".into()]).unwrap();
        assert_eq!(headers["authorization"], "Bearer token");
        assert_eq!(headers["x-id"], "42");
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(parse_headers(&["no-colon".into()]).is_err());
    }
}
