use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub description: String,
    pub level: AuditLevel,
    pub actor_id: String,
    pub target_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        description: impl Into<String>,
        level: AuditLevel,
        actor_id: &str,
    ) -> Self {
        Self {
            action: action.to_string(),
            description: description.into(),
            level,
            actor_id: actor_id.to_string(),
            target_id: None,
            metadata: None,
        }
    }

    pub fn target(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Destination for audit events. Injected into the request state so tests
/// can substitute a recording or failing sink.
pub trait AuditSink {
    fn emit(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Sink used before a workspace is selected.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes to the workspace's audit_log table over its own connection, so an
/// audit write can never participate in (or roll back) a primary mutation's
/// transaction.
pub struct SqliteAuditSink {
    conn: Connection,
}

impl SqliteAuditSink {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(workspace.join("gradebook.sqlite3"))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl AuditSink for SqliteAuditSink {
    fn emit(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let metadata = event
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO audit_log(id, action, description, level, actor_id, target_id, metadata, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &event.action,
                &event.description,
                event.level.as_str(),
                &event.actor_id,
                &event.target_id,
                metadata,
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }
}

/// Delivery is best-effort: a failing sink must never fail or roll back the
/// mutation that produced the event.
pub fn emit_best_effort(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.emit(&event) {
        tracing::warn!(action = %event.action, error = %e, "audit event dropped");
    }
}
