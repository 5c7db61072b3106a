//! Cooperative cancellation flag.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap-to-clone flag set once on user interrupt and polled by workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set this flag on Ctrl+C. Can only be installed once per process.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            if !flag.is_cancelled() {
                eprintln!("[cancel] Interrupt received, letting in-flight commands finish");
            }
            flag.cancel();
        })
        .map_err(|e| Error::internal_unexpected(format!("Failed to set Ctrl+C handler: {}", e)))
    }
}
