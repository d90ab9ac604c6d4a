//! Final trajectory dump.
//!
//! Samples the continuous-time estimate at 100 Hz across the full run and
//! writes one line per sample: `0.0 t_ns T00..T33 w0..w5` with the
//! world-in-robot pose as a row-major 4×4.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::engine::odometry::TrajectorySample;
use crate::io::SequenceError;

/// Sampling rate of the dump.
pub const TRAJECTORY_RATE_HZ: f64 = 100.0;

/// Write the sampled trajectory (`trajectory_<utc>.txt` by convention).
pub fn write_trajectory(path: &Path, samples: &[TrajectorySample]) -> Result<(), SequenceError> {
    let file = File::create(path).map_err(|e| SequenceError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for sample in samples {
        let t_ns = (sample.time * 1e9).round() as i64;
        let m = sample.t_rm.matrix();
        write!(writer, "{:.12} {t_ns}", 0.0).map_err(|e| SequenceError::io(path, e))?;
        for row in 0..4 {
            for col in 0..4 {
                write!(writer, " {:.12}", m[(row, col)])
                    .map_err(|e| SequenceError::io(path, e))?;
            }
        }
        for i in 0..6 {
            write!(writer, " {:.12}", sample.w_mr_inr[i])
                .map_err(|e| SequenceError::io(path, e))?;
        }
        writeln!(writer).map_err(|e| SequenceError::io(path, e))?;
    }
    writer.flush().map_err(|e| SequenceError::io(path, e))
}
