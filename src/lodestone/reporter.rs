/// Best-effort notification of accepted login sessions to the manager.
/// Failures are logged and never touch the session that triggered them.
pub struct ManagerReporter {
    http: reqwest::Client,
    manager_address: String,
    api_key: String,
}

impl ManagerReporter {
    /// Returns `None` when the manager address or API key is unset.
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

    /// Fire-and-forget POST of the connection metadata.
    pub fn report(&self, domain: &str, username: &str, client_ip: &str, uuid: &str) {
        let http = self.http.clone();
        let url = format!("{}/connections", self.manager_address);
        let api_key = self.api_key.clone();
        let body = serde_json::json!({
            "fullDomain": domain,
            "playerName": username,
            "playerIp": client_ip,
            "playerUuid": uuid,
        });
        let domain = domain.to_string();

        tokio::spawn(async move {
            let res = http
                .post(&url)
                .header("x-api-key", &api_key)
                .json(&body)
                .send()
                .await;
            match res {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(domain = %domain, status = %resp.status(), "reporter: manager rejected report");
                }
                Err(err) => {
                    tracing::warn!(domain = %domain, err = %err, "reporter: manager unreachable");
                }
            }
        });
    }
}
