//! Reconciliation
//!
//! Drives local services toward the roles named by the designation file
//! and retries failed switches until they succeed or age out.

mod reconciler;
pub mod retry;

pub use reconciler::{Reconciler, TickOutcome};
pub use retry::{DrainStats, PendingSummary, PendingSwitch, RetryQueue, RoleSwitcher};
