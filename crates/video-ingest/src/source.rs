use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{CaptureError, FrameBundle};

/// Device-side producer of frame bundles.
///
/// The pipeline calls `setup` then `start` once, loops over `acquire`/`release`,
/// and finally calls `stop`. A bundle returned by `acquire` is owned by the caller
/// until it is handed back through `release`.
pub trait FrameSource {
    /// Locate and open the device.
    fn setup(&mut self) -> Result<(), CaptureError>;

    /// Begin streaming the configured modalities.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Fetch the next bundle. With `block == false` an empty bundle means nothing
    /// was ready yet.
    fn acquire(&mut self, block: bool) -> Result<FrameBundle, CaptureError>;

    /// Return a bundle obtained from `acquire`.
    fn release(&mut self, bundle: FrameBundle);

    /// Stop streaming and close the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Acquire/release bookkeeping shared with observers of a source.
#[derive(Debug, Default)]
pub struct SourceStats {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SourceStats {
    pub fn record_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Bundles handed out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}
