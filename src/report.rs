use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared sink for scan diagnostics.
///
/// Corruption found during the scan is never fatal; every finding is routed
/// through here so the caller can observe how noisy the scan was. Emission
/// goes through the `log` facade; counting is atomic so visitors on every
/// worker thread can report without extra locking.
#[derive(Debug, Default)]
pub struct Reporter {
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a non-fatal problem (bad record, multiply-claimed block,
    /// counter mismatch, ...). The scan continues.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        log::warn!("{args}");
    }

    /// Report an abandoned unit of work (unreadable subtree, skipped AG).
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        log::error!("{args}");
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
