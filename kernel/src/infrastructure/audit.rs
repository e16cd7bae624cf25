use serde::Serialize;
use tracing::{info, info_span};

/// Domain event for audit logging.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A kernel component came up.
    SystemStartup {
        /// Component name.
        component: String,
    },
    /// The kernel is going down.
    SystemShutdown {
        /// Why it stopped.
        reason: String,
    },
    /// A barrier left `Standing`.
    BarrierResolved {
        /// Barrier instance id.
        barrier_id: String,
        /// Barrier identifier from the plan definition.
        identifier: String,
        /// Owning plan execution.
        plan_execution_id: String,
        /// Terminal state reached.
        state: String,
    },
    /// Barrier instances were purged for finished plan executions.
    PlanExecutionsPurged {
        /// Purged plan executions.
        plan_execution_ids: Vec<String>,
        /// Number of barrier instances deleted.
        barriers_deleted: u64,
    },
}

/// Logs an audit event to the dedicated audit channel as structured JSON.
/// This uses a specific `target` which can be filtered by the subscriber to redirect to a secure file.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Barrier Audit Event");
}
