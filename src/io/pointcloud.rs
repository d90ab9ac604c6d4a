//! Binary point-cloud files.
//!
//! One sweep per file, named `<microseconds>.bin`. Each record is 24 bytes,
//! little-endian: `f32 x, y, z, intensity, reserved, time_offset_s`. The
//! per-point timestamp is the file stamp plus the offset.

use std::fs;
use std::path::Path;

use nalgebra::Vector3;

use crate::core::types::Point3D;
use crate::io::SequenceError;

const RECORD_SIZE: usize = 24;

/// Sweep acquisition time (seconds) from a `<microseconds>.bin` file stem.
pub fn timestamp_from_stem(path: &Path) -> Result<f64, SequenceError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SequenceError::MalformedPointFile {
            path: path.display().to_string(),
            reason: "file name is not UTF-8".to_string(),
        })?;
    let micros: i64 = stem.parse().map_err(|_| SequenceError::MalformedPointFile {
        path: path.display().to_string(),
        reason: format!("file stem {stem:?} is not a microsecond timestamp"),
    })?;
    Ok(micros as f64 * 1e-6)
}

/// Read one sweep. Returns the points with absolute timestamps filled in;
/// world positions start at the raw positions.
pub fn read_point_bin(path: &Path) -> Result<(f64, Vec<Point3D>), SequenceError> {
    let file_time = timestamp_from_stem(path)?;
    let bytes = fs::read(path).map_err(|e| SequenceError::io(path, e))?;
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(SequenceError::MalformedPointFile {
            path: path.display().to_string(),
            reason: format!(
                "{} bytes is not a multiple of the {RECORD_SIZE}-byte record",
                bytes.len()
            ),
        });
    }

    let mut points = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    for record in bytes.chunks_exact(RECORD_SIZE) {
        let field = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&record[4 * i..4 * i + 4]);
            f32::from_le_bytes(buf)
        };
        let x = field(0);
        let y = field(1);
        let z = field(2);
        let intensity = field(3);
        // field(4) is reserved padding.
        let time_offset = field(5);

        let mut point = Point3D::from_raw(
            Vector3::new(x as f64, y as f64, z as f64),
            file_time + time_offset as f64,
        );
        point.intensity = intensity;
        points.push(point);
    }
    Ok((file_time, points))
}

/// Write a sweep in the same 24-byte record layout.
pub fn write_point_bin(path: &Path, points: &[Point3D]) -> Result<(), SequenceError> {
    let file_time = timestamp_from_stem(path)?;
    let mut bytes = Vec::with_capacity(points.len() * RECORD_SIZE);
    for point in points {
        let fields = [
            point.raw_pt.x as f32,
            point.raw_pt.y as f32,
            point.raw_pt.z as f32,
            point.intensity,
            0.0f32,
            (point.timestamp - file_time) as f32,
        ];
        for value in fields {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    fs::write(path, bytes).map_err(|e| SequenceError::io(path, e))
}
