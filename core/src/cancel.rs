//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MergeError, Result};

/// Shared cancellation flag, checked at stage and layer boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Work already in progress finishes its current step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`MergeError::Cancelled`] if cancellation was requested.
    pub fn check(&self, before: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(MergeError::Cancelled(before.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check("extract").is_ok());

        other.cancel();
        assert!(flag.is_cancelled());
        let err = flag.check("merge").unwrap_err();
        assert_eq!(err.to_string(), "Cancelled before merge");
    }
}
