//! # Fault Capture
//!
//! Routes panics that escape every other boundary into the log.
//!
//! The panic hook is process-wide state, so [`FaultCapture`] is created once
//! and handed to whoever needs it (usually [`crate::ServerBuilder`]).
//! Installing it again is a no-op.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct FaultCapture {
    installed: AtomicBool,
    captured: Arc<AtomicU64>,
}

impl FaultCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chains a logging hook in front of the current panic hook.
    /// Returns `false` if this capture was already installed.
    pub fn install(&self) -> bool {
        if self.installed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let captured = self.captured.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            captured.fetch_add(1, Ordering::Relaxed);
            let location = info.location().map(|l| l.to_string()).unwrap_or_default();
            tracing::error!(location = %location, "uncaught fault: {}", panic_message(info.payload()));
            previous(info);
        }));
        tracing::debug!("fault capture installed");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Panics observed since install.
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
