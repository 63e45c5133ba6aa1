//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result};
use serde::Deserialize;

pub fn base_url(addr: &str) -> String {
    format!("http://{}/v1", addr)
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let cause = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        anyhow::bail!("veild returned {}: {}", status, cause);
    }
    resp.json::<T>().await.context("failed to parse response")
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to veild at {}, is it running?", url))?;
    decode(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| format!("failed to connect to veild at {}, is it running?", url))?;
    decode(resp).await
}

pub async fn get_text(url: &str) -> Result<String> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to veild at {}, is it running?", url))?
        .error_for_status()?
        .text()
        .await
        .context("failed to read response")
}
