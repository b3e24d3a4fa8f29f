use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;

use crate::lodestone::telemetry;

/// Everything a session hands over when it commits to splicing. The kick
/// signal closes the session's sockets when fired; the session owns them.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub client_ip: String,
    pub domain: String,
    pub username: Option<String>,
    pub uuid: Option<String>,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub kick: Arc<Notify>,
}

/// Serialisable snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub id: u64,
    pub client_ip: String,
    pub domain: String,
    pub username: Option<String>,
    pub uuid: Option<String>,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub started_at_unix_ms: u64,
}

struct Entry {
    record: ConnectionRecord,
    started_at_unix_ms: u64,
}

/// Index of live sessions. A record is present iff its session is actively
/// splicing; queries return snapshots so callers never hold a shard lock
/// while closing sockets.
pub struct ConnectionRegistry {
    sessions: DashMap<u64, Entry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, record: ConnectionRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            Entry {
                record,
                started_at_unix_ms: telemetry::now_unix_ms(),
            },
        );
        id
    }

    /// Idempotent: teardown and kick may both race to drop the same entry.
    pub fn remove(&self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn snapshot(&self) -> Vec<ConnectionView> {
        self.filter(|_| true)
    }

    pub fn by_username(&self, username: &str, upstream_port: u16) -> Vec<ConnectionView> {
        self.filter(|e| {
            e.record.upstream_port == upstream_port
                && e.record
                    .username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(username))
        })
    }

    pub fn by_ip(&self, ip: &str, upstream_port: u16) -> Vec<ConnectionView> {
        self.filter(|e| e.record.upstream_port == upstream_port && e.record.client_ip == ip)
    }

    pub fn by_uuid(&self, uuid: &str, upstream_port: u16) -> Vec<ConnectionView> {
        self.filter(|e| {
            e.record.upstream_port == upstream_port && e.record.uuid.as_deref() == Some(uuid)
        })
    }

    /// Fires the session's kick signal and drops the record. The session
    /// observes the signal and closes both sockets shortly after.
    pub fn kick(&self, id: u64) -> bool {
        match self.sessions.remove(&id) {
            Some((_, entry)) => {
                entry.record.kick.notify_one();
                true
            }
            None => false,
        }
    }

    fn filter(&self, pred: impl Fn(&Entry) -> bool) -> Vec<ConnectionView> {
        let mut out: Vec<ConnectionView> = self
            .sessions
            .iter()
            .filter(|e| pred(e))
            .map(|e| view(*e.key(), e.value()))
            .collect();
        out.sort_by_key(|v| v.id);
        out
    }
}

fn view(id: u64, entry: &Entry) -> ConnectionView {
    ConnectionView {
        id,
        client_ip: entry.record.client_ip.clone(),
        domain: entry.record.domain.clone(),
        username: entry.record.username.clone(),
        uuid: entry.record.uuid.clone(),
        upstream_host: entry.record.upstream_host.clone(),
        upstream_port: entry.record.upstream_port,
        started_at_unix_ms: entry.started_at_unix_ms,
    }
}
