//! Applanix-style CSV readers and pose exports.

use std::fs::File;
use std::path::Path;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::core::se3::Se3;
use crate::core::types::{ImuSample, PoseSample, TrajectoryFrame};
use crate::io::SequenceError;

fn parse_field(path: &Path, record: &csv::StringRecord, i: usize) -> Result<f64, SequenceError> {
    record
        .get(i)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .ok_or_else(|| SequenceError::MalformedCsv {
            path: path.display().to_string(),
            reason: format!("bad numeric field {i} in record {record:?}"),
        })
}

/// Read IMU samples from `GPSTime,angvel_z,angvel_y,angvel_x,accel_z,
/// accel_y,accel_x`.
///
/// The file's body axes coincide with the robot frame; only the reversed
/// column order is undone here.
pub fn read_imu_csv(path: &Path) -> Result<Vec<ImuSample>, SequenceError> {
    let file = File::open(path).map_err(|e| SequenceError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SequenceError::MalformedCsv {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let timestamp = parse_field(path, &record, 0)?;
        let ang_vel = Vector3::new(
            parse_field(path, &record, 3)?,
            parse_field(path, &record, 2)?,
            parse_field(path, &record, 1)?,
        );
        let lin_acc = Vector3::new(
            parse_field(path, &record, 6)?,
            parse_field(path, &record, 5)?,
            parse_field(path, &record, 4)?,
        );
        samples.push(ImuSample {
            timestamp,
            lin_acc,
            ang_vel,
        });
    }
    Ok(samples)
}

/// Read pose measurements from `GPSTime,T00..T23` (row-major top three rows
/// of the sensor-to-world transform).
pub fn read_pose_csv(path: &Path) -> Result<Vec<PoseSample>, SequenceError> {
    let file = File::open(path).map_err(|e| SequenceError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SequenceError::MalformedCsv {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let timestamp = parse_field(path, &record, 0)?;
        let mut values = [0.0f64; 12];
        for (i, value) in values.iter_mut().enumerate() {
            *value = parse_field(path, &record, i + 1)?;
        }
        let r = Matrix3::new(
            values[0], values[1], values[2], //
            values[4], values[5], values[6], //
            values[8], values[9], values[10],
        );
        let t = Vector3::new(values[3], values[7], values[11]);
        samples.push(PoseSample {
            timestamp,
            t_ms: Se3::new(r, t),
        });
    }
    Ok(samples)
}

/// Roll/pitch/heading (ZYX Euler) of a sensor-to-world rotation.
fn roll_pitch_heading(r: &Matrix3<f64>) -> (f64, f64, f64) {
    let rotation = Rotation3::from_matrix_unchecked(*r);
    let (roll, pitch, yaw) = rotation.euler_angles();
    (roll, pitch, yaw)
}

/// Write the per-frame ground-truth-shaped pose CSV.
pub fn write_lidar_poses_csv(
    path: &Path,
    frames: &[TrajectoryFrame],
) -> Result<(), SequenceError> {
    let file = File::create(path).map_err(|e| SequenceError::io(path, e))?;
    let mut writer = csv::Writer::from_writer(file);
    writer
        .write_record([
            "GPSTime", "easting", "northing", "altitude", "vel_east", "vel_north", "vel_up",
            "roll", "pitch", "heading", "angvel_z", "angvel_y", "angvel_x",
        ])
        .map_err(|e| SequenceError::MalformedCsv {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    for frame in frames {
        let pose = frame.mid_pose;
        let (roll, pitch, heading) = roll_pitch_heading(&pose.r);
        // Body twist of the world in the robot; the sensor's world-frame
        // velocity and body rates carry the opposite sign.
        let vel_world = -(pose.r * frame.mid_w.fixed_rows::<3>(0).into_owned());
        let ang_body = -frame.mid_w.fixed_rows::<3>(3).into_owned();
        let row = [
            frame.eval_timestamp,
            pose.t.x,
            pose.t.y,
            pose.t.z,
            vel_world.x,
            vel_world.y,
            vel_world.z,
            roll,
            pitch,
            heading,
            ang_body.z,
            ang_body.y,
            ang_body.x,
        ];
        writer
            .write_record(row.iter().map(|v| format!("{v:.12}")))
            .map_err(|e| SequenceError::MalformedCsv {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
    }
    writer.flush().map_err(|e| SequenceError::io(path, e))
}

/// Write per-frame mid poses in TUM format: `t x y z qx qy qz qw`.
pub fn write_lidar_poses_tum(
    path: &Path,
    frames: &[TrajectoryFrame],
) -> Result<(), SequenceError> {
    use std::io::Write;
    let mut file = File::create(path).map_err(|e| SequenceError::io(path, e))?;
    for frame in frames {
        let pose = frame.mid_pose;
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(pose.r));
        writeln!(
            file,
            "{:.9} {:.12} {:.12} {:.12} {:.12} {:.12} {:.12} {:.12}",
            frame.eval_timestamp, pose.t.x, pose.t.y, pose.t.z, q.i, q.j, q.k, q.w
        )
        .map_err(|e| SequenceError::io(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_read_imu_csv_reorders_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("imu.csv");
        std::fs::write(
            &path,
            "GPSTime,angvel_z,angvel_y,angvel_x,accel_z,accel_y,accel_x\n\
             10.5,0.3,0.2,0.1,-9.8,0.02,0.01\n",
        )
        .expect("write");

        let samples = read_imu_csv(&path).expect("read");
        assert_eq!(samples.len(), 1);
        assert_relative_eq!(samples[0].timestamp, 10.5);
        assert_relative_eq!(samples[0].ang_vel, Vector3::new(0.1, 0.2, 0.3));
        assert_relative_eq!(samples[0].lin_acc, Vector3::new(0.01, 0.02, -9.8));
    }

    #[test]
    fn test_read_imu_csv_rejects_bad_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("imu.csv");
        std::fs::write(
            &path,
            "GPSTime,angvel_z,angvel_y,angvel_x,accel_z,accel_y,accel_x\n\
             10.5,xyz,0.2,0.1,-9.8,0.02,0.01\n",
        )
        .expect("write");
        assert!(matches!(
            read_imu_csv(&path),
            Err(SequenceError::MalformedCsv { .. })
        ));
    }

    #[test]
    fn test_read_pose_csv_row_major_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("poses.csv");
        // Identity rotation, translation (1, 2, 3).
        std::fs::write(
            &path,
            "GPSTime,T00,T01,T02,T03,T10,T11,T12,T13,T20,T21,T22,T23\n\
             5.0,1,0,0,1,0,1,0,2,0,0,1,3\n",
        )
        .expect("write");

        let samples = read_pose_csv(&path).expect("read");
        assert_eq!(samples.len(), 1);
        assert_relative_eq!(samples[0].t_ms.t, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(samples[0].t_ms.r, Matrix3::identity());
    }

    #[test]
    fn test_tum_export_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lidar_poses_tum.txt");
        let mut frame = TrajectoryFrame::new(0.0, 0.1, 0.05);
        frame.mid_pose = Se3::new(Matrix3::identity(), Vector3::new(1.0, -2.0, 0.5));
        write_lidar_poses_tum(&path, &[frame]).expect("write");

        let contents = std::fs::read_to_string(&path).expect("read back");
        let fields: Vec<&str> = contents.split_whitespace().collect();
        assert_eq!(fields.len(), 8);
        assert!(fields[1].starts_with("1.0"));
        // Identity quaternion: qw = 1.
        assert!(fields[7].starts_with("1.0"));
    }
}
