//! Fail-open helpers for infrastructure side effects
//!
//! Snapshot persistence and similar bookkeeping must never change an agent's
//! control flow. Wrap those calls in [`fail_open`] so a failure is logged and
//! swallowed.
//!
//! Never use this for state transitions, routing, or review decisions: those
//! errors are part of the protocol and must reach the caller.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an infrastructure operation, logging and discarding any error
///
/// ```no_run
/// use troupe_core::fail_open::fail_open;
/// use troupe_core::Result;
///
/// async fn persist_snapshot() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let saved = fail_open("state_store::save", || persist_snapshot()).await;
///     assert!(saved.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
