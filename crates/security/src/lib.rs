//! Access control for PromptGate: capability resolution, policy snapshots,
//! and audit logging.
//!
//! Provides:
//! - **Patterns**: Tagged model-reference matchers (exact / namespace / any)
//! - **Capabilities**: Union of role grants for a principal in a tenant
//! - **Snapshots**: Immutable policy sets behind a single swappable reference
//! - **Audit logging**: Structured governance decision logging

pub mod audit;
pub mod capability;
pub mod pattern;
pub mod permission;
pub mod snapshot;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use capability::{AllowedModels, Capabilities, CapabilityResolver, resolve_roles};
pub use pattern::ModelPattern;
pub use permission::Permission;
pub use snapshot::{PolicySnapshot, PolicyStore, RolePolicy, TenantPolicy};
