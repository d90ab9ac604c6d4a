//! Crate-level error types.
//!
//! Three failure classes are surfaced, never recovered internally:
//! configuration problems, broken estimator invariants (fatal), and
//! degenerate frames (the frame is marked failed and processing continues).

use thiserror::Error;

/// Errors produced by the odometry engine.
#[derive(Debug, Error)]
pub enum OdometryError {
    /// Configuration rejected before the engine starts.
    #[error("malformed configuration: {0}")]
    MalformedConfig(String),

    /// An estimator invariant was broken. These are fatal: the trajectory or
    /// map state can no longer be trusted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The current frame could not be registered (too few usable residuals
    /// or the window limits were exceeded). The caller keeps the
    /// extrapolated trajectory and skips the map update for this frame.
    #[error("degenerate frame {frame_index}: {reason}")]
    DegenerateFrame { frame_index: usize, reason: String },
}

impl OdometryError {
    /// Whether processing may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OdometryError::DegenerateFrame { .. })
    }
}
