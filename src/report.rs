//! Report time series and HTML rendering.
//!
//! The sampler appends one value per series per tick, so all series stay the
//! same length; the per-bucket latency counts grow in lockstep. The page is
//! rendered once, at the end of the run, into a single self-contained HTML
//! document with the data embedded as JSON.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::metrics::{DURATION_BUCKETS, Snapshot, bucket_bound};

/// Cumulative observation counts for one latency bucket, one entry per tick.
#[derive(Clone, Debug, Serialize)]
pub struct DurationSeries {
    /// Bucket upper bound in seconds.
    pub le: f64,
    pub counts: Vec<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Page {
    pub title: String,
    /// Sample period in seconds.
    pub interval: f64,
    pub connections: Vec<u64>,
    pub errors: Vec<u64>,
    pub timeouts: Vec<u64>,
    pub request_sum: Vec<u64>,
    pub request_success: Vec<u64>,
    pub bytes_written: Vec<u64>,
    pub bytes_read: Vec<u64>,
    pub qps: Vec<u64>,
    pub request_duration: Vec<DurationSeries>,
}

impl Page {
    pub fn new(title: String, interval: f64) -> Self {
        Self {
            title,
            interval,
            connections: Vec::new(),
            errors: Vec::new(),
            timeouts: Vec::new(),
            request_sum: Vec::new(),
            request_success: Vec::new(),
            bytes_written: Vec::new(),
            bytes_read: Vec::new(),
            qps: Vec::new(),
            request_duration: (0..DURATION_BUCKETS)
                .map(|i| DurationSeries {
                    le: bucket_bound(i),
                    counts: Vec::new(),
                })
                .collect(),
        }
    }

    /// Append one sample tick.
    pub fn append(&mut self, snapshot: &Snapshot, qps_limit: f64) {
        self.connections.push(snapshot.conn_open);
        self.errors.push(snapshot.errors);
        self.timeouts.push(snapshot.timeouts);
        self.request_sum.push(snapshot.request_sum);
        self.request_success.push(snapshot.request_success);
        self.bytes_written.push(snapshot.bytes_written);
        self.bytes_read.push(snapshot.bytes_read);
        self.qps.push(qps_limit as u64);
        for (series, &count) in self
            .request_duration
            .iter_mut()
            .zip(snapshot.duration_buckets.iter())
        {
            series.counts.push(count);
        }
    }

    /// Number of ticks recorded so far.
    pub fn samples(&self) -> usize {
        self.request_sum.len()
    }
}

/// Render the page into a self-contained HTML document.
pub fn render_html(page: &Page) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(page)?;
    Ok(PAGE_TEMPLATE
        .replace("__TITLE__", &page.title)
        .replace("__DATA__", &data))
}

/// Final consumer of a finished [`Page`].
#[async_trait]
pub trait Reporter {
    async fn report(&self, page: Page) -> Result<(), Box<dyn std::error::Error>>;
}

/// Writes the rendered HTML report to disk.
pub struct HtmlReporter {
    pub path: PathBuf,
}

#[async_trait]
impl Reporter for HtmlReporter {
    async fn report(&self, page: Page) -> Result<(), Box<dyn std::error::Error>> {
        let html = render_html(&page)?;
        tokio::fs::write(&self.path, html).await?;
        Ok(())
    }
}

const PAGE_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>__TITLE__ — load report</title>
<style>
  body { font-family: sans-serif; margin: 2rem; background: #fafafa; color: #222; }
  h1 { font-size: 1.4rem; }
  h2 { font-size: 1rem; margin: 1.5rem 0 0.25rem; }
  .chart { background: #fff; border: 1px solid #ddd; }
  .meta { color: #666; font-size: 0.85rem; }
</style>
</head>
<body>
<h1>__TITLE__</h1>
<p class="meta" id="meta"></p>
<div id="charts"></div>
<script>
const DATA = __DATA__;
const W = 860, H = 180, PAD = 42;

function line(values, color) {
  const max = Math.max(1, ...values);
  const step = values.length > 1 ? (W - 2 * PAD) / (values.length - 1) : 0;
  const pts = values.map((v, i) =>
    `${(PAD + i * step).toFixed(1)},${(H - PAD - (v / max) * (H - 2 * PAD)).toFixed(1)}`);
  return `<polyline fill="none" stroke="${color}" stroke-width="1.5" points="${pts.join(' ')}"/>` +
    `<text x="${PAD}" y="12" font-size="10" fill="#666">max ${max}</text>`;
}

function chart(name, values, color) {
  const axis = `<line x1="${PAD}" y1="${H - PAD}" x2="${W - PAD}" y2="${H - PAD}" stroke="#bbb"/>` +
    `<line x1="${PAD}" y1="${PAD}" x2="${PAD}" y2="${H - PAD}" stroke="#bbb"/>`;
  return `<h2>${name}</h2><svg class="chart" width="${W}" height="${H}">${axis}${line(values, color)}</svg>`;
}

function histogram(buckets) {
  const totals = buckets.map(b => b.counts.length ? b.counts[b.counts.length - 1] : 0);
  const max = Math.max(1, ...totals);
  const bw = (W - 2 * PAD) / buckets.length;
  const bars = totals.map((t, i) => {
    const h = (t / max) * (H - 2 * PAD);
    const label = buckets[i].le < 1 ? `${(buckets[i].le * 1000).toFixed(0)}ms` : `${buckets[i].le.toFixed(0)}s`;
    return `<rect x="${(PAD + i * bw).toFixed(1)}" y="${(H - PAD - h).toFixed(1)}" width="${(bw - 2).toFixed(1)}" height="${h.toFixed(1)}" fill="#4a7fb5"/>` +
      `<text x="${(PAD + i * bw + bw / 2).toFixed(1)}" y="${H - PAD + 12}" font-size="8" fill="#666" text-anchor="middle">${label}</text>` +
      `<text x="${(PAD + i * bw + bw / 2).toFixed(1)}" y="${(H - PAD - h - 3).toFixed(1)}" font-size="8" fill="#333" text-anchor="middle">${t || ''}</text>`;
  });
  return `<h2>request duration (≤ bucket bound)</h2><svg class="chart" width="${W}" height="${H}">${bars.join('')}</svg>`;
}

const series = [
  ['requests', DATA.request_sum, '#2d6a4f'],
  ['successes', DATA.request_success, '#40916c'],
  ['errors', DATA.errors, '#bc4749'],
  ['timeouts', DATA.timeouts, '#e07a5f'],
  ['connections', DATA.connections, '#3d5a80'],
  ['rate limit (qps)', DATA.qps, '#7b2cbf'],
  ['bytes written', DATA.bytes_written, '#6c757d'],
  ['bytes read', DATA.bytes_read, '#495057'],
];

document.getElementById('meta').textContent =
  `${DATA.request_sum.length} samples, one every ${DATA.interval}s`;
document.getElementById('charts').innerHTML =
  series.map(([n, v, c]) => chart(n, v, c)).join('') + histogram(DATA.request_duration);
</script>
</body>
</html>
"##;
