//! Core engine for the autonomous experiment agent.
//!
//! This crate owns the three subsystems that make up the agent's core:
//!
//! - [`governance`]: the two-stage autonomy gate (decision matrix + risk
//!   assessment), the approval workflow, and the notification store.
//! - [`registry`] + [`dispatch`] + [`ticker`]: the experiment lifecycle
//!   engine — a bounded worker pool, per-experiment metric refresh, and the
//!   state machine that owns every experiment record.
//! - [`sync`]: the durable write-through replication layer to a remote
//!   store.
//!
//! Nothing in this crate reaches for a module-level singleton. Every
//! component is constructed explicitly and threaded through via
//! [`context::CoreContext`]; tests build a `CoreContext` with in-memory
//! fakes instead of patching globals.

pub mod context;
pub mod dispatch;
pub mod experiment;
pub mod governance;
pub mod housekeeping;
pub mod registry;
pub mod sync;
pub mod task;
pub mod ticker;

pub use context::CoreContext;
