//! Sensor-data processing: everything that happens to a sweep before it
//! reaches the estimator.

pub mod preprocessing;
