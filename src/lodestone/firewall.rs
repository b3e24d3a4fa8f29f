use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "ipBan")]
    IpBan,
    #[serde(rename = "usernameBan")]
    UsernameBan,
    #[serde(rename = "uuidBan")]
    UuidBan,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub value: String,
}

/// Fetches per-domain deny rules from the manager. Fetch failures are the
/// caller's to log; a session is admitted as if no rules matched.
pub struct FirewallClient {
    http: reqwest::Client,
    manager_address: String,
    api_key: String,
}

impl FirewallClient {
    /// Returns `None` when the manager address or API key is unset, which
    /// disables firewalling entirely.
    pub fn new(http: reqwest::Client, manager_address: &str, api_key: &str) -> Option<Self> {
        let manager_address = manager_address.trim();
        let api_key = api_key.trim();
        if manager_address.is_empty() || api_key.is_empty() {
            return None;
        }
        Some(Self {
            http,
            manager_address: manager_address.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn rules_for(&self, domain: &str) -> anyhow::Result<Vec<FirewallRule>> {
        let url = format!("{}/firewall/{}", self.manager_address, domain);
        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .context("request")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status}");
        }
        resp.json::<Vec<FirewallRule>>().await.context("decode body")
    }
}

/// A session is blocked iff any rule value equals its ip, username or uuid.
pub fn blocks(
    rules: &[FirewallRule],
    ip: &str,
    username: Option<&str>,
    uuid: Option<&str>,
) -> bool {
    rules.iter().any(|rule| match rule.kind {
        RuleKind::IpBan => rule.value == ip,
        RuleKind::UsernameBan => username == Some(rule.value.as_str()),
        RuleKind::UuidBan => uuid == Some(rule.value.as_str()),
    })
}
