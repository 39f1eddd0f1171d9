//! Pause switch for document analysis
//!
//! Retraining pauses consumption of prediction requests and the training
//! reply resumes it. Each pause gets a generation number so a watchdog
//! armed for an older pause cannot resume a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AnalysisGate {
    open: Arc<watch::Sender<bool>>,
    generation: Arc<AtomicU64>,
}

impl Default for AnalysisGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisGate {
    /// A gate that starts open
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self {
            open: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Close the gate; returns the generation of this pause
    pub fn pause(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.open.send_replace(false);
        generation
    }

    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    /// Resume only if the current pause is still `generation`
    ///
    /// Returns true when this call reopened the gate.
    pub fn resume_if_current(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) == generation && !self.is_open() {
            self.resume();
            true
        } else {
            false
        }
    }

    /// Wait until the gate is open
    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }
}
