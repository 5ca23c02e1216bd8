//! Progress reporting for long upgrades.
//!
//! The driver notifies the observer once per completed version. The
//! notification is fire-and-forget: no return value, no error propagation,
//! no backpressure.

use tracing::info;

/// Receives one notification per completed upgrade step.
pub trait ProgressObserver {
    /// Called after version `current_version` has been applied.
    ///
    /// `start_version` is the version the whole upgrade began from and
    /// `target_version` the version it is heading to.
    fn step_complete(&mut self, start_version: u32, current_version: u32, target_version: u32);
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn step_complete(&mut self, start_version: u32, current_version: u32, target_version: u32) {
        info!(
            start = start_version,
            current = current_version,
            target = target_version,
            "upgraded store version"
        );
    }
}

/// Discards progress notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn step_complete(&mut self, _: u32, _: u32, _: u32) {}
}
