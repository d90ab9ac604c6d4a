//! Orchestration layer: the sliding-window filter and the per-frame
//! odometry driver built on top of it.

pub mod filter;
pub mod odometry;
