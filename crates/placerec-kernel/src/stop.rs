//! [`StopFlag`] – cooperative cancellation.
//!
//! The run controller hands a clone to its signal handler and checks the
//! flag between cycles; nothing is interrupted mid-cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop request. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop at the next cycle boundary.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = StopFlag::new();
        let handler = flag.clone();
        assert!(!flag.is_stopped());
        handler.request_stop();
        assert!(flag.is_stopped());
    }

    #[test]
    fn stop_is_visible_across_threads() {
        let flag = StopFlag::new();
        let remote = flag.clone();
        std::thread::spawn(move || remote.request_stop())
            .join()
            .unwrap();
        assert!(flag.is_stopped());
    }
}
