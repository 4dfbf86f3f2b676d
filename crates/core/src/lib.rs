//! # PromptGate Core
//!
//! Domain types, traits, and error definitions for the PromptGate
//! resource-governance layer. This crate has **zero framework dependencies**:
//! it defines the domain model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! The one piece of shared infrastructure the core depends on, the counter
//! store, is defined as a trait here. Implementations live in
//! `promptgate-quota`. This enables:
//! - Swapping the store via configuration
//! - Deterministic tests with an in-memory store and a manual clock
//! - Clean dependency graph (all crates depend inward on core)

pub mod clock;
pub mod error;
pub mod message;
pub mod principal;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, PolicyError, QuotaError, QuotaKind, Result, StoreError};
pub use message::{Message, Role};
pub use principal::{Principal, PrincipalId, TenantId};
pub use store::{CounterCheck, CounterOutcome, CounterStore};
