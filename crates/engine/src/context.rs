//! Thread-bound transaction context
//!
//! Each transaction is bound to the logical execution (thread) that runs
//! it. The binding is what nested calls consult to join an enclosing
//! transaction instead of starting their own, and it must be cleared on
//! every exit path; a surviving binding is a leak that would make the next
//! call on this thread join a dead transaction.
//!
//! Cleanup is multi-strategy: cooperative take, explicit overwrite, then
//! verification, and only log-and-continue if all of that fails. A
//! process-wide registry mirrors the bindings so shutdown can report and
//! drop stale ones even when their threads are gone.

use crate::handle::TransactionHandle;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use tandem_core::{TandemError, TandemResult, TxId};
use tracing::{debug, error, warn};

/// The context bound to the current thread while a transaction runs.
#[derive(Clone)]
pub struct BoundContext {
    /// Transaction bound to this execution.
    pub tx_id: TxId,
    /// Business label of the invocation.
    pub business_key: String,
    /// Handle nested calls attach to.
    pub handle: TransactionHandle,
}

thread_local! {
    static CURRENT: RefCell<Option<BoundContext>> = const { RefCell::new(None) };
}

/// Process-wide mirror of live bindings, keyed by thread.
static REGISTRY: Lazy<DashMap<String, TxId>> = Lazy::new(DashMap::new);

fn thread_key() -> String {
    format!("{:?}", std::thread::current().id())
}

/// Bind a context to the current thread.
///
/// Fails if a context is already bound; the coordinator checks for an
/// enclosing transaction before calling this.
pub fn bind(ctx: BoundContext) -> TandemResult<()> {
    let tx_id = ctx.tx_id;
    let already = CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            true
        } else {
            *slot = Some(ctx);
            false
        }
    });
    if already {
        return Err(TandemError::internal(format!(
            "a transaction context is already bound to this thread (binding {})",
            tx_id
        )));
    }
    REGISTRY.insert(thread_key(), tx_id);
    Ok(())
}

/// The context bound to the current thread, if any.
pub fn current() -> Option<BoundContext> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Whether a context is bound to the current thread.
pub fn is_bound() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}

/// Clear the current thread's binding.
///
/// Never fails and never leaves a binding behind: after the cooperative
/// take, the slot is overwritten and verified, and any anomaly is logged
/// at error level rather than propagated.
pub fn unbind(expected: TxId) {
    let taken = CURRENT.with(|slot| slot.borrow_mut().take());
    match taken {
        Some(ctx) if ctx.tx_id == expected => {
            debug!(target: "tandem::context", tx_id = %expected, "context unbound");
        }
        Some(ctx) => {
            error!(
                target: "tandem::context",
                expected = %expected,
                found = %ctx.tx_id,
                "unbind found a different transaction bound; cleared it anyway"
            );
        }
        None => {
            debug!(target: "tandem::context", tx_id = %expected, "unbind found no binding");
        }
    }

    // Overwrite and verify
    CURRENT.with(|slot| *slot.borrow_mut() = None);
    let still_bound = CURRENT.with(|slot| slot.borrow().is_some());
    if still_bound {
        error!(
            target: "tandem::context",
            tx_id = %expected,
            "context still bound after cleanup; continuing"
        );
    }

    REGISTRY.remove(&thread_key());
}

/// Best-effort cleanup of every known binding at process shutdown.
///
/// Clears the current thread's slot and drops all registry entries;
/// bindings on other (possibly dead) threads are reported. Returns how
/// many registry entries were dropped.
pub fn shutdown_cleanup() -> usize {
    CURRENT.with(|slot| *slot.borrow_mut() = None);
    let stale: Vec<(String, TxId)> = REGISTRY
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    for (thread, tx_id) in &stale {
        warn!(
            target: "tandem::context",
            thread = %thread,
            tx_id = %tx_id,
            "clearing stale transaction binding at shutdown"
        );
    }
    REGISTRY.clear();
    stale.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TransactionHandle;
    use std::collections::BTreeMap;

    fn ctx(tx_id: TxId) -> BoundContext {
        BoundContext {
            tx_id,
            business_key: "test".into(),
            handle: TransactionHandle::new(tx_id, "test".into(), BTreeMap::new()),
        }
    }

    #[test]
    fn test_bind_current_unbind() {
        let tx = TxId::new();
        assert!(current().is_none());
        bind(ctx(tx)).unwrap();
        assert_eq!(current().unwrap().tx_id, tx);
        assert!(is_bound());
        unbind(tx);
        assert!(current().is_none());
    }

    #[test]
    fn test_double_bind_rejected() {
        let tx = TxId::new();
        bind(ctx(tx)).unwrap();
        let other = TxId::new();
        assert!(bind(ctx(other)).is_err());
        // Original binding intact
        assert_eq!(current().unwrap().tx_id, tx);
        unbind(tx);
    }

    #[test]
    fn test_unbind_is_tolerant() {
        let tx = TxId::new();
        // No binding: still succeeds
        unbind(tx);
        assert!(!is_bound());

        // Wrong expectation: clears anyway
        bind(ctx(tx)).unwrap();
        unbind(TxId::new());
        assert!(!is_bound());
    }

    #[test]
    fn test_bindings_are_per_thread() {
        let tx = TxId::new();
        bind(ctx(tx)).unwrap();
        let seen_elsewhere = std::thread::spawn(|| is_bound()).join().unwrap();
        assert!(!seen_elsewhere);
        unbind(tx);
    }

    #[test]
    fn test_shutdown_cleanup_clears_current_thread() {
        let tx = TxId::new();
        bind(ctx(tx)).unwrap();
        shutdown_cleanup();
        assert!(!is_bound());
    }
}
