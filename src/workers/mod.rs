//! Long-running background loops: notify dispatch and reconciliation.

pub mod notify_dispatcher;
pub mod reconciliation;
