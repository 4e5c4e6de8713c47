use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Level-triggered stop request shared between a worker loop and whoever wants it to stop.
///
/// Nothing is interrupted: loops poll [`CancelToken::is_cancelled`] at their own boundaries,
/// so the reaction time is exactly one loop period.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
