use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};

use tracing::warn;

/// Cooperative stop request shared between the signal handler and the driver.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trigger this token on Ctrl+C. Only the first call in a process installs
    /// a handler; later tokens are left untouched.
    pub fn install_ctrlc_handler(&self) {
        static CTRL_HANDLER: Once = Once::new();

        let handler_flag = self.flag.clone();
        CTRL_HANDLER.call_once(move || {
            if let Err(err) = ctrlc::set_handler(move || {
                handler_flag.store(true, Ordering::SeqCst);
            }) {
                warn!("Failed to install Ctrl+C handler: {err}");
            }
        });
    }
}
