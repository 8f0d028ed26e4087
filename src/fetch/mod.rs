//! Feed download behind the [`HttpClient`] seam.

mod basic;
mod client;

pub use basic::{BasicClient, DEFAULT_TIMEOUT};
pub use client::HttpClient;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Attempts after the first for server errors and transport failures.
pub const DEFAULT_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(1500);

/// GETs `url` once. Non-success statuses are errors.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

/// GETs `url`, retrying 5xx responses and transport errors with exponential
/// backoff. Client errors (4xx) fail immediately.
pub async fn fetch_bytes_with_retry<C: HttpClient>(
    client: &C,
    url: &str,
    retries: u32,
) -> Result<Vec<u8>> {
    let mut attempt = 0;
    let mut delay = BACKOFF_BASE;
    loop {
        match fetch_bytes(client, url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                let retryable = match e.downcast_ref::<reqwest::Error>() {
                    Some(re) => re.status().is_none_or(|s| s.is_server_error()),
                    None => false,
                };
                attempt += 1;
                if !retryable || attempt > retries {
                    return Err(e).with_context(|| format!("fetching {url}"));
                }
                warn!(url, error = %e, attempt, retries, delay_ms = delay.as_millis() as u64, "Fetch failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(1.5);
            }
        }
    }
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(skip(client))]
pub async fn load_source<C: HttpClient>(client: &C, source: &str) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes_with_retry(client, source, DEFAULT_RETRIES).await
    } else {
        std::fs::read(source).with_context(|| format!("reading {source}"))
    }
}
