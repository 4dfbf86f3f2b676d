//! Audit logging for governance decisions.
//!
//! Every admission decision the governor makes is recorded as an
//! `AuditEntry` and forwarded to the configured sinks.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use promptgate_core::QuotaKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub tenant: String,
    pub principal: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

/// Governance events worth recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request passed every gate
    Admitted { model: String },
    /// The principal may not use the requested model
    ModelDenied { model: String },
    /// A required permission was missing
    PermissionDenied { permission: String },
    /// A request or token quota was exhausted
    QuotaDenied { kind: QuotaKind },
    /// The counter store failed
    StoreUnavailable,
    /// The tenant has no policy in the current snapshot
    TenantUnknown,
    /// A new policy snapshot was swapped in
    PolicyReloaded { version: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Failed,
}

/// Where audit entries are written.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Keeps recorded entries in memory and forwards each to its sinks.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
    retain: bool,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .field("retain", &self.retain)
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    /// Logger that retains entries in memory and has no sinks.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks: Vec::new(),
            retain: true,
        }
    }

    /// Logger that only forwards to `sinks`, retaining nothing.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
            retain: false,
        }
    }

    /// Logger that forwards to the tracing subscriber.
    pub fn tracing() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }

    /// Keep entries in memory as well as forwarding them.
    pub fn retaining(mut self) -> Self {
        self.retain = true;
        self
    }

    fn guard(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log(
        &self,
        event: AuditEvent,
        tenant: &str,
        principal: &str,
        outcome: AuditOutcome,
        details: Option<String>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            tenant: tenant.into(),
            principal: principal.into(),
            outcome,
            details,
        };

        for sink in &self.sinks {
            sink.record(&entry);
        }

        if self.retain {
            self.guard().push(entry);
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.guard().clone()
    }

    pub fn entries_by_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        self.guard()
            .iter()
            .filter(|e| e.outcome == outcome)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn count(&self) -> usize {
        self.guard().len()
    }
}

/// Emits each entry through `tracing`: denials at warn, the rest at info.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        match entry.outcome {
            AuditOutcome::Allowed => tracing::info!(
                event = ?entry.event,
                tenant = %entry.tenant,
                principal = %entry.principal,
                details = ?entry.details,
                "AUDIT"
            ),
            AuditOutcome::Denied | AuditOutcome::Failed => tracing::warn!(
                event = ?entry.event,
                tenant = %entry.tenant,
                principal = %entry.principal,
                outcome = ?entry.outcome,
                details = ?entry.details,
                "AUDIT"
            ),
        }
    }
}
