use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route already exists")]
    Duplicate,
    #[error("route not found")]
    NotFound,
    #[error("domain is empty after normalisation")]
    InvalidDomain,
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

// Forge clients append a "\0FML\0"-style suffix to the advertised address;
// once the NULs are filtered out, a bare FML marker trails the domain.
static FML_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FML\d*$").expect("literal pattern"));

/// Canonical form of a client-advertised domain: keep `[A-Za-z0-9.-]`, strip
/// a trailing Forge marker, drop trailing dots, lowercase. Idempotent.
pub fn normalize_domain(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect();
    let stripped = FML_SUFFIX.replace(&kept, "");
    stripped
        .trim()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Mutable domain → upstream mapping, persisted as a JSON object on every
/// mutation and republished atomically for lock-free readers.
pub struct RouteTable {
    routes: ArcSwap<HashMap<String, Upstream>>,
    write_lock: tokio::sync::Mutex<()>,
    path: PathBuf,
}

impl RouteTable {
    /// Loads the table from `path`, creating an empty file when absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let routes = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice::<HashMap<String, Upstream>>(&data)
                .with_context(|| format!("routes: parse {}", path.display()))?
                .into_iter()
                .map(|(domain, upstream)| (normalize_domain(&domain), upstream))
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let empty = HashMap::new();
                persist(path, &empty)?;
                tracing::info!(path = %path.display(), "routes: created empty route file");
                empty
            }
            Err(err) => {
                return Err(err).with_context(|| format!("routes: read {}", path.display()))
            }
        };

        tracing::info!(path = %path.display(), routes = routes.len(), "routes: loaded");

        Ok(Self {
            routes: ArcSwap::from_pointee(routes),
            write_lock: tokio::sync::Mutex::new(()),
            path: path.to_path_buf(),
        })
    }

    pub fn get(&self, domain: &str) -> Option<Upstream> {
        self.routes.load().get(&normalize_domain(domain)).cloned()
    }

    pub fn list(&self) -> HashMap<String, Upstream> {
        self.routes.load().as_ref().clone()
    }

    /// Adds a route; fails on a duplicate normalised domain. Returns the key.
    pub async fn insert(&self, domain: &str, upstream: Upstream) -> Result<String, RouteError> {
        let key = normalize_domain(domain);
        if key.is_empty() {
            return Err(RouteError::InvalidDomain);
        }

        let _guard = self.write_lock.lock().await;
        let mut next = self.routes.load_full().as_ref().clone();
        if next.contains_key(&key) {
            return Err(RouteError::Duplicate);
        }
        next.insert(key.clone(), upstream);
        self.publish(next)?;
        Ok(key)
    }

    /// Replaces an existing route; fails when the domain is unknown.
    pub async fn update(&self, domain: &str, upstream: Upstream) -> Result<String, RouteError> {
        let key = normalize_domain(domain);
        if key.is_empty() {
            return Err(RouteError::InvalidDomain);
        }

        let _guard = self.write_lock.lock().await;
        let mut next = self.routes.load_full().as_ref().clone();
        if !next.contains_key(&key) {
            return Err(RouteError::NotFound);
        }
        next.insert(key.clone(), upstream);
        self.publish(next)?;
        Ok(key)
    }

    pub async fn remove(&self, domain: &str) -> Result<(), RouteError> {
        let key = normalize_domain(domain);

        let _guard = self.write_lock.lock().await;
        let mut next = self.routes.load_full().as_ref().clone();
        if next.remove(&key).is_none() {
            return Err(RouteError::NotFound);
        }
        self.publish(next)?;
        Ok(())
    }

    // Persist first: a mutation only becomes visible once it is durable.
    fn publish(&self, next: HashMap<String, Upstream>) -> Result<(), RouteError> {
        persist(&self.path, &next)?;
        self.routes.store(Arc::new(next));
        Ok(())
    }
}

fn persist(path: &Path, routes: &HashMap<String, Upstream>) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(routes).context("routes: serialize")?;

    // Write-then-rename so readers never observe a torn file.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data).with_context(|| format!("routes: write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("routes: rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
