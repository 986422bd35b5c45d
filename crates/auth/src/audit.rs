//! Append-only encrypted audit log.
//!
//! Records go to disk as one sealed envelope per line (never rewritten)
//! and into an in-memory ring bounded by the retention window for queries.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use sentra_bus::{EventBus, Topic};
use sentra_vault::EncryptedLineLog;

use crate::AuthResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    pub fn new(actor: &str, action: &str, resource: &str, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            details: String::new(),
            session_id: None,
            success,
            duration_ms: 0,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub success: Option<bool>,
    pub limit: usize,
}

pub struct AuditLog {
    log: EncryptedLineLog,
    ring: Mutex<VecDeque<AuditRecord>>,
    retention: Duration,
    bus: EventBus,
}

impl AuditLog {
    pub fn new(log: EncryptedLineLog, retention_days: i64, bus: EventBus) -> Self {
        Self {
            log,
            ring: Mutex::new(VecDeque::new()),
            retention: Duration::days(retention_days.max(1)),
            bus,
        }
    }

    /// Load the on-disk log into the query ring.  Entries older than the
    /// retention window stay on disk but are not queryable.
    pub async fn load(&self) -> AuthResult<()> {
        let records: Vec<AuditRecord> = self.log.load_all().await?;
        let cutoff = Utc::now() - self.retention;

        let mut ring = self.ring.lock().await;
        ring.clear();
        for record in records.into_iter().filter(|r| r.ts >= cutoff) {
            ring.push_back(record);
        }
        Ok(())
    }

    /// Append a record.  The disk write happens before the ring update, so
    /// a crash can lose only in-memory queryability, never the record.
    /// A failed disk write is surfaced — audit history must not silently
    /// drop entries.
    pub async fn append(&self, record: AuditRecord) -> AuthResult<()> {
        self.log.append(&record).await?;

        {
            let cutoff = Utc::now() - self.retention;
            let mut ring = self.ring.lock().await;
            ring.push_back(record.clone());
            while ring.front().map(|r| r.ts < cutoff).unwrap_or(false) {
                ring.pop_front();
            }
        }

        self.bus.publish(
            Topic::AuditLogCreated,
            serde_json::json!({
                "action": record.action,
                "actor": record.actor,
                "success": record.success,
            }),
        );
        Ok(())
    }

    /// Best-effort append for non-critical paths: failures are logged and
    /// swallowed so auditing never takes the primary operation down.
    pub async fn try_append(&self, record: AuditRecord) {
        if let Err(err) = self.append(record).await {
            warn!(%err, "audit append failed");
        }
    }

    /// Filtered query, newest first, bounded by `limit` (0 = unbounded).
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        let ring = self.ring.lock().await;
        let mut results: Vec<AuditRecord> = ring
            .iter()
            .filter(|r| {
                query.actor.as_deref().map(|a| r.actor == a).unwrap_or(true)
                    && query.action.as_deref().map(|a| r.action == a).unwrap_or(true)
                    && query.resource.as_deref().map(|res| r.resource == res).unwrap_or(true)
                    && query
                        .time_range
                        .map(|(from, to)| r.ts >= from && r.ts <= to)
                        .unwrap_or(true)
                    && query.success.map(|s| r.success == s).unwrap_or(true)
            })
            .cloned()
            .collect();

        results.sort_by_key(|r| std::cmp::Reverse(r.ts));
        if query.limit > 0 {
            results.truncate(query.limit);
        }
        results
    }

    pub async fn len(&self) -> usize {
        self.ring.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(dir: &std::path::Path) -> AuditLog {
        AuditLog::new(
            EncryptedLineLog::new(dir.join("logs/audit.log"), [11u8; 32]),
            30,
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn append_then_query_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = audit(dir.path());

        for i in 0..3 {
            log.append(
                AuditRecord::new("admin", "auth.login", "auth", true)
                    .with_details(format!("attempt {i}")),
            )
            .await
            .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let results = log.query(&AuditQuery::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].ts >= results[1].ts);
        assert!(results[1].ts >= results[2].ts);
    }

    #[tokio::test]
    async fn filters_apply_conjunctively() {
        let dir = tempfile::tempdir().unwrap();
        let log = audit(dir.path());

        log.append(AuditRecord::new("admin", "auth.login", "auth", true)).await.unwrap();
        log.append(AuditRecord::new("admin", "auth.login", "auth", false)).await.unwrap();
        log.append(AuditRecord::new("analyst", "tool.execute", "tools", true)).await.unwrap();

        let failed_logins = log
            .query(&AuditQuery {
                action: Some("auth.login".to_string()),
                success: Some(false),
                ..AuditQuery::default()
            })
            .await;
        assert_eq!(failed_logins.len(), 1);
        assert_eq!(failed_logins[0].actor, "admin");

        let limited = log
            .query(&AuditQuery {
                limit: 2,
                ..AuditQuery::default()
            })
            .await;
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn records_survive_reload_in_order() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = audit(dir.path());
            log.append(AuditRecord::new("a", "one", "r", true)).await.unwrap();
            log.append(AuditRecord::new("a", "two", "r", true)).await.unwrap();
        }

        let reloaded = audit(dir.path());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len().await, 2);

        let results = reloaded.query(&AuditQuery::default()).await;
        assert_eq!(results[0].action, "two", "newest first after reload");
    }

    #[tokio::test]
    async fn appending_never_rewrites_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.log");
        let log = audit(dir.path());

        log.append(AuditRecord::new("a", "first", "r", true)).await.unwrap();
        let after_first = std::fs::read_to_string(&path).unwrap();

        log.append(AuditRecord::new("a", "second", "r", true)).await.unwrap();
        let after_second = std::fs::read_to_string(&path).unwrap();

        assert!(
            after_second.starts_with(&after_first),
            "existing audit lines must never change"
        );
        assert_eq!(after_second.lines().count(), 2);
    }

    #[tokio::test]
    async fn audit_events_reach_the_bus() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe(Topic::AuditLogCreated, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(
            EncryptedLineLog::new(dir.path().join("audit.log"), [11u8; 32]),
            30,
            bus,
        );
        log.append(AuditRecord::new("a", "x", "r", true)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
