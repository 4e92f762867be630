//! Cooperative cancellation for long replicate loops.
//!
//! Checked between replicates, never inside one, so a cancelled run stops
//! within one replicate's worth of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SimError};

/// Shared cancellation flag. Clone freely — all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
    parent: Option<Arc<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    /// A new flag that also reads as cancelled once `self` is. Cancelling the
    /// child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self { inner: Arc::default(), parent: Some(Arc::new(self.clone())) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// `Err(SimError::Cancelled)` once [`CancelFlag::cancel`] has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SimError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Check an optional flag.
pub(crate) fn check(cancel: Option<&CancelFlag>) -> Result<()> {
    cancel.map_or(Ok(()), CancelFlag::check)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_flag_not_cancelled() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        assert!(flag.check().is_ok());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(SimError::Cancelled)));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancelFlag::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(child.clone().child().is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_optional_check() {
        assert!(check(None).is_ok());
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(check(Some(&flag)).is_err());
    }
}
