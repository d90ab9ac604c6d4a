//! Data association: local plane estimation and robust weighting.

mod neighborhood;
mod robust_kernels;

pub use neighborhood::{Neighborhood, compute_neighborhood};
pub use robust_kernels::RobustLoss;
