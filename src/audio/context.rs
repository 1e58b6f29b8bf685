//! Audio context: the lifetime scope shared by every analysis tap of one
//! channel membership.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: u64,
    closed: AtomicBool,
}

/// Cheaply cloneable handle; every clone observes the same open/closed state
#[derive(Clone)]
pub struct AudioContext {
    inner: Arc<ContextInner>,
}

impl AudioContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the context. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }
}

impl Default for AudioContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_once_across_clones() {
        let ctx = AudioContext::new();
        let clone = ctx.clone();
        assert!(clone.is_open());
        assert!(ctx.close());
        assert!(!clone.close());
        assert!(!clone.is_open());
        assert_ne!(ctx.id(), AudioContext::new().id());
    }
}
