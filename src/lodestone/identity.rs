use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub primary_url: String,
    pub fallback_url: String,
    pub attempts: u32,
    pub retry_delay: Duration,
}

/// Resolves a username to its dash-stripped lowercase hex UUID. The primary
/// provider is retried a few times, then the fallback provider gets one shot;
/// exhaustion yields `None` and the caller refuses the session.
pub struct IdentityResolver {
    http: reqwest::Client,
    cfg: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(http: reqwest::Client, cfg: IdentityConfig) -> Self {
        Self { http, cfg }
    }

    pub async fn resolve(&self, username: &str) -> Option<String> {
        for attempt in 1..=self.cfg.attempts {
            match self.query_primary(username).await {
                Ok(uuid) => return Some(uuid),
                Err(err) => {
                    tracing::debug!(
                        username = %username,
                        attempt,
                        err = %err,
                        "identity: primary lookup failed"
                    );
                }
            }
            if attempt < self.cfg.attempts {
                tokio::time::sleep(self.cfg.retry_delay).await;
            }
        }

        match self.query_fallback(username).await {
            Ok(uuid) => {
                tracing::debug!(username = %username, "identity: resolved via fallback");
                Some(uuid)
            }
            Err(err) => {
                tracing::warn!(username = %username, err = %err, "identity: unresolved");
                None
            }
        }
    }

    // Mojang profile endpoint: 200 with {"id": "<32 hex chars>", "name": ...}.
    async fn query_primary(&self, username: &str) -> anyhow::Result<String> {
        let url = format!("{}/{}", self.cfg.primary_url.trim_end_matches('/'), username);
        let resp = self.http.get(&url).send().await.context("request")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status}");
        }
        let body: Value = resp.json().await.context("decode body")?;
        let raw = body["id"].as_str().context("missing id field")?;
        parse_uuid(raw).with_context(|| format!("malformed uuid {raw:?}"))
    }

    // PlayerDB nests the profile under data.player; raw_id is already dashless.
    async fn query_fallback(&self, username: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/{}",
            self.cfg.fallback_url.trim_end_matches('/'),
            username
        );
        let resp = self.http.get(&url).send().await.context("request")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status}");
        }
        let body: Value = resp.json().await.context("decode body")?;
        let raw = body["data"]["player"]["raw_id"]
            .as_str()
            .context("missing data.player.raw_id field")?;
        parse_uuid(raw).with_context(|| format!("malformed uuid {raw:?}"))
    }
}

/// Accepts dashed or dashless hex and canonicalises to 32 lowercase hex chars.
pub(crate) fn parse_uuid(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex)
    } else {
        None
    }
}
