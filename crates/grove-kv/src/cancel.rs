//! Cooperative cancellation for long-running store operations.
//!
//! A [`Cancel`] token is cloned into every party that should observe the
//! same cancellation. Store operations check it at operation entry, between
//! backend transactions, and at link-iteration boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A lightweight, cloneable cancellation token.
///
/// All clones share the same flag: cancelling one cancels them all. The
/// default token is never cancelled, which is the common case for one-shot
/// callers.
#[derive(Clone, Debug, Default)]
pub struct Cancel {
    cancelled: Arc<AtomicBool>,
}

impl Cancel {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
