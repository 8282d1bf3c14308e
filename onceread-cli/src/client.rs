use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Attempts per request while the server answers 502 (cold start).
const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSecret {
    pub id: String,
    pub passcode: String,
    pub expires_at: DateTime<Utc>,
    pub read_url: String,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    secret: Option<String>,
    remaining_attempts: Option<u32>,
}

/// Client for the onceread HTTP API.
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub async fn create(
        &self,
        base_url: &str,
        secret: &str,
        expiry: Option<&str>,
    ) -> anyhow::Result<CreatedSecret> {
        let url = format!("{}/create", base_url.trim_end_matches('/'));
        let body = CreateRequest { secret, expiry };
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await
            .context("failed to create secret")?;

        if resp.status() != StatusCode::CREATED {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("failed to create secret ({}): {}", status, body);
        }
        Ok(resp.json().await?)
    }

    /// Read the secret behind `read_url`.
    pub async fn read(&self, read_url: &str, passcode: &str) -> anyhow::Result<String> {
        let url = read_url.trim_end_matches('/');
        let resp = self
            .send_with_retry(|| {
                self.http
                    .post(url)
                    .header("X-Passcode", passcode)
                    .header(reqwest::header::ACCEPT, "application/json")
            })
            .await
            .context("failed to read secret")?;

        let status = resp.status();
        match status {
            StatusCode::OK => {
                let read: ReadResponse = resp.json().await?;
                read.secret.ok_or_else(|| anyhow!("server returned no secret"))
            }
            StatusCode::UNAUTHORIZED => {
                let read: ReadResponse = resp.json().await?;
                bail!(
                    "wrong passcode, {} attempt(s) left",
                    read.remaining_attempts.unwrap_or(0)
                )
            }
            StatusCode::NOT_FOUND => bail!("secret not found or expired"),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                bail!("failed to read secret ({}): {}", status, body)
            }
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> anyhow::Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                warn!(
                    "server returned 502, retrying in {:?} ({}/{})",
                    RETRY_DELAY,
                    attempt,
                    MAX_RETRIES - 1
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let resp = build().send().await?;
            if !should_retry(resp.status()) {
                return Ok(resp);
            }
        }
        bail!("server unavailable after {} attempts", MAX_RETRIES)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY
}
