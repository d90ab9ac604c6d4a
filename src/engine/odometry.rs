//! Per-frame odometry driver.
//!
//! One `register_frame` call runs the full pipeline for a sweep:
//! preprocessing, trajectory knot creation, the ICP association/solve loop,
//! the sliding-window solve with marginalization, and the delayed map
//! update. Degenerate frames leave the extrapolated trajectory in place,
//! skip the map update, and surface as a recoverable error.

use nalgebra::{DMatrix, Matrix3, Matrix6, SMatrix, Vector6};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::algorithms::mapping::{VoxelMap, VoxelMapConfig};
use crate::algorithms::matching::{RobustLoss, compute_neighborhood};
use crate::algorithms::trajectory::{
    InterpolatedState, KnotState, MotionPrior, extrapolate, interpolate,
    interpolate_with_jacobians,
};
use crate::config::{OdometryConfig, P2pLossFunc, TrajectoryPriorKind};
use crate::core::se3::Se3;
use crate::core::types::{
    DataFrame, ImuSample, Point3D, RegistrationSummary, TrajectoryFrame,
};
use crate::engine::filter::{
    Bracket, CostTerm, GaussNewtonParams, KnotKeys, SlidingWindowFilter, VarKey,
};
use crate::error::OdometryError;
use crate::sensors::preprocessing::{assign_alpha_timestamps, deskew, grid_subsample};

use rayon::prelude::*;

/// Fixed limits of the window problem; a frame tripping them is degenerate.
const MAX_ACTIVE_VARIABLES: usize = 100;
const MAX_COST_TERMS: usize = 100_000;

/// A continuous-time trajectory knot and its optimizer variables.
#[derive(Debug, Clone)]
pub struct TrajectoryKnot {
    pub time: f64,
    pub keys: KnotKeys,
    pub bias_key: VarKey,
    pub t_mi_key: VarKey,
    /// Last synced estimate; frozen once the knot is marginalized.
    pub state: KnotState,
    pub bias: Vector6<f64>,
    pub t_mi: Se3,
    pub marginalized: bool,
}

/// One 100 Hz-style sample of the estimated trajectory.
#[derive(Debug, Clone, Copy)]
pub struct TrajectorySample {
    pub time: f64,
    /// World-in-robot pose.
    pub t_rm: Se3,
    /// Body twist.
    pub w_mr_inr: Vector6<f64>,
}

/// Active-segment view used by the ICP loop: knot keys plus their current
/// store values.
#[derive(Debug, Clone)]
struct SegmentKnot {
    time: f64,
    keys: KnotKeys,
    state: KnotState,
}

struct IcpReport {
    failure: Option<String>,
    num_residuals: usize,
}

/// Continuous-time LiDAR-inertial odometry engine.
pub struct LioOdometry {
    config: OdometryConfig,
    prior: MotionPrior,
    /// Robot-from-sensor extrinsic (`T_sr⁻¹`), the form every pose chain
    /// here needs.
    t_rs: Se3,
    map: VoxelMap,
    frames: Vec<TrajectoryFrame>,
    knots: Vec<TrajectoryKnot>,
    filter: SlidingWindowFilter,
    /// Index of the first knot still eligible for marginalization.
    to_marginalize: usize,
    pool: rayon::ThreadPool,
}

impl LioOdometry {
    pub fn new(config: OdometryConfig) -> Result<Self, OdometryError> {
        config.validate()?;
        if config.delay_adding_points == 0 {
            return Err(OdometryError::MalformedConfig(
                "delay_adding_points must be at least 1".to_string(),
            ));
        }
        let prior = match config.trajectory_prior {
            TrajectoryPriorKind::WhiteNoiseOnJerk => MotionPrior::WhiteNoiseOnJerk {
                qc_diag: config.qc_diag_vector(),
            },
            TrajectoryPriorKind::Singer => MotionPrior::Singer {
                qc_diag: config.qc_diag_vector(),
                ad_diag: config.ad_diag_vector(),
            },
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| OdometryError::MalformedConfig(format!("thread pool: {e}")))?;
        let map = VoxelMap::new(VoxelMapConfig {
            voxel_size: config.size_voxel_map,
            max_points_per_voxel: config.max_num_points_in_voxel,
            min_distance_points: config.min_distance_points,
        });
        Ok(Self {
            prior,
            t_rs: config.t_sr_transform().inverse(),
            map,
            frames: Vec::new(),
            knots: Vec::new(),
            filter: SlidingWindowFilter::new(),
            to_marginalize: 0,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &OdometryConfig {
        &self.config
    }

    pub fn map(&self) -> &VoxelMap {
        &self.map
    }

    pub fn frames(&self) -> &[TrajectoryFrame] {
        &self.frames
    }

    pub fn knots(&self) -> &[TrajectoryKnot] {
        &self.knots
    }

    /// Times of the knots still present in the active window.
    pub fn active_knot_times(&self) -> Vec<f64> {
        self.knots
            .iter()
            .filter(|k| !k.marginalized)
            .map(|k| k.time)
            .collect()
    }

    /// Number of unlocked optimizer variables.
    pub fn num_variables(&self) -> usize {
        self.filter.num_variables()
    }

    /// Register one sweep.
    ///
    /// On `DegenerateFrame` the engine stays consistent and the next frame
    /// can be processed; every other error is fatal.
    pub fn register_frame(
        &mut self,
        frame: DataFrame,
    ) -> Result<RegistrationSummary, OdometryError> {
        let index = self.frames.len();

        if frame.pointcloud.is_empty() {
            let mut record =
                TrajectoryFrame::new(frame.timestamp, frame.timestamp, frame.timestamp);
            record.success = false;
            // Carry the last estimate so later frames extrapolate sanely.
            if let Some(prev) = self.frames.last() {
                record.begin_r = prev.end_r;
                record.begin_t = prev.end_t;
                record.end_r = prev.end_r;
                record.end_t = prev.end_t;
            }
            self.frames.push(record);
            return Err(OdometryError::DegenerateFrame {
                frame_index: index,
                reason: "empty point cloud".to_string(),
            });
        }

        let begin_timestamp = frame
            .pointcloud
            .iter()
            .map(|p| p.timestamp)
            .fold(f64::INFINITY, f64::min);
        let end_timestamp = frame
            .pointcloud
            .iter()
            .map(|p| p.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        if let Some(last) = self.knots.last() {
            if end_timestamp <= last.time {
                return Err(OdometryError::InvariantViolation(format!(
                    "knot times must be strictly increasing: sweep end {end_timestamp} \
                     is not after last knot {}",
                    last.time
                )));
            }
        }

        let mut record = TrajectoryFrame::new(begin_timestamp, end_timestamp, frame.timestamp);
        record.pose_samples = frame.pose_samples;
        self.frames.push(record);
        self.initialize_motion(index);

        let sweep = self.initialize_frame(index, frame.pointcloud);

        if index == 0 {
            self.initialize_first_frame();
            self.frames[0].points = sweep;
            self.update_map(0, 0)?;
            let frame = &self.frames[0];
            return Ok(RegistrationSummary {
                success: true,
                keypoints: Vec::new(),
                num_residuals: 0,
                r_ms: frame.end_r,
                t_ms: frame.end_t,
            });
        }

        let keypoint_voxel = if index < self.config.init_num_frames {
            self.config.init_sample_voxel_size
        } else {
            self.config.sample_voxel_size
        };
        let mut keypoints = grid_subsample(&sweep, keypoint_voxel);

        let report = self.icp(index, &mut keypoints, &frame.imu_samples)?;
        self.sync_knot_records()?;

        if let Some(reason) = report.failure {
            self.frames[index].success = false;
            log::warn!("frame {index} degenerate: {reason}");
            return Err(OdometryError::DegenerateFrame {
                frame_index: index,
                reason,
            });
        }

        self.frames[index].points = sweep;
        if index > self.config.delay_adding_points {
            self.update_map(index, index - self.config.delay_adding_points)?;
        }

        let frame = &self.frames[index];
        Ok(RegistrationSummary {
            success: true,
            keypoints,
            num_residuals: report.num_residuals,
            r_ms: frame.end_r,
            t_ms: frame.end_t,
        })
    }

    /// Frame history, with begin/mid/end poses rebuilt from the final
    /// trajectory when `use_final_state_value` is set.
    pub fn trajectory(&self) -> Result<Vec<TrajectoryFrame>, OdometryError> {
        let mut frames = self.frames.clone();
        if self.config.use_final_state_value && !self.knots.is_empty() {
            let records = self.knot_records();
            for frame in &mut frames {
                let begin = self.sensor_pose_at(&records, frame.begin_timestamp)?;
                frame.begin_r = begin.r;
                frame.begin_t = begin.t;
                frame.mid_pose = self.sensor_pose_at(&records, frame.eval_timestamp)?;
                let end = self.sensor_pose_at(&records, frame.end_timestamp)?;
                frame.end_r = end.r;
                frame.end_t = end.t;
            }
        }
        Ok(frames)
    }

    /// Sample `(T_rm, w)` over the full history at a fixed rate.
    pub fn sample_trajectory(
        &self,
        rate_hz: f64,
    ) -> Result<Vec<TrajectorySample>, OdometryError> {
        let (Some(first), Some(last)) = (self.frames.first(), self.frames.last()) else {
            return Ok(Vec::new());
        };
        if rate_hz <= 0.0 {
            return Err(OdometryError::MalformedConfig(
                "sample rate must be positive".to_string(),
            ));
        }
        let records = self.knot_records();
        let dt = 1.0 / rate_hz;
        let mut samples = Vec::new();
        let mut time = first.begin_timestamp;
        while time <= last.end_timestamp {
            let state = eval_state(&records, &self.prior, time)?;
            samples.push(TrajectorySample {
                time,
                t_rm: state.pose,
                w_mr_inr: state.velocity,
            });
            time += dt;
        }
        Ok(samples)
    }

    // ------------------------------------------------------------------
    // Per-frame steps
    // ------------------------------------------------------------------

    /// Initialize begin/end sensor poses for a new frame. Frame ≥ 2
    /// extrapolates by composing the relative motion of the last two sweep
    /// ends.
    fn initialize_motion(&mut self, index: usize) {
        if index == 0 {
            let pose = self.t_rs;
            let frame = &mut self.frames[0];
            frame.begin_r = pose.r;
            frame.begin_t = pose.t;
            frame.end_r = pose.r;
            frame.end_t = pose.t;
        } else if index == 1 {
            let prev = self.frames[0].end_pose();
            let frame = &mut self.frames[1];
            frame.begin_r = prev.r;
            frame.begin_t = prev.t;
            frame.end_r = prev.r;
            frame.end_t = prev.t;
        } else {
            let prev = self.frames[index - 1].end_pose();
            let prev2 = self.frames[index - 2].end_pose();
            let relative_r = prev.r * prev2.r.transpose();
            let end_r = relative_r * prev.r;
            let end_t = prev.t + relative_r * (prev.t - prev2.t);
            let frame = &mut self.frames[index];
            frame.begin_r = prev.r;
            frame.begin_t = prev.t;
            frame.end_r = end_r;
            frame.end_t = end_t;
        }
    }

    /// Shuffle, subsample, and de-skew the incoming sweep.
    fn initialize_frame(&self, index: usize, pointcloud: Vec<Point3D>) -> Vec<Point3D> {
        let frame = &self.frames[index];
        let mut points = pointcloud;
        assign_alpha_timestamps(&mut points, frame.begin_timestamp, frame.end_timestamp);

        let voxel_size = if index < self.config.init_num_frames {
            self.config.init_voxel_size
        } else {
            self.config.voxel_size
        };
        // Fixed seed: the shuffle randomizes which point a voxel keeps while
        // staying reproducible across runs.
        let mut rng = StdRng::seed_from_u64(0);
        points.shuffle(&mut rng);
        let mut sub = grid_subsample(&points, voxel_size);
        sub.shuffle(&mut rng);

        deskew(&mut sub, &frame.begin_pose(), &frame.end_pose());
        sub
    }

    /// Frame 0: freeze the sweep-begin knot outside the filter and open the
    /// window at the sweep-end knot.
    fn initialize_first_frame(&mut self) {
        let begin = self.frames[0].begin_timestamp;
        let end = self.frames[0].end_timestamp;
        let use_imu = self.config.use_imu;

        // The begin knot anchors the trajectory history but never enters
        // the optimization.
        let mut anchor = self.create_knot(
            begin,
            KnotState::identity(),
            Vector6::zeros(),
            Se3::identity(),
            true,
            true,
            true,
        );
        anchor.marginalized = true;
        self.knots.push(anchor);

        let t_mi_locked = !use_imu;
        let first = self.create_knot(
            end,
            KnotState::identity(),
            Vector6::zeros(),
            Se3::identity(),
            false,
            !use_imu,
            t_mi_locked,
        );
        self.knots.push(first);
        self.to_marginalize = 1;

        self.frames[0].mid_state_cov = SMatrix::<f64, 18, 18>::identity() * 1e-4;
    }

    #[allow(clippy::too_many_arguments)]
    fn create_knot(
        &mut self,
        time: f64,
        state: KnotState,
        bias: Vector6<f64>,
        t_mi: Se3,
        trajectory_locked: bool,
        bias_locked: bool,
        t_mi_locked: bool,
    ) -> TrajectoryKnot {
        let store = self.filter.store_mut();
        let keys = KnotKeys {
            pose: store.add_pose(state.pose, trajectory_locked),
            w: store.add_vector(state.w, trajectory_locked),
            dw: store.add_vector(state.dw, trajectory_locked),
        };
        let bias_key = store.add_vector(bias, bias_locked);
        let t_mi_key = store.add_pose(t_mi, t_mi_locked);
        TrajectoryKnot {
            time,
            keys,
            bias_key,
            t_mi_key,
            state,
            bias,
            t_mi,
            marginalized: false,
        }
    }

    fn knot_state_from_store(&self, index: usize) -> Result<KnotState, OdometryError> {
        let knot = &self.knots[index];
        let store = self.filter.store();
        Ok(KnotState {
            pose: store.pose(knot.keys.pose)?,
            w: store.vector(knot.keys.w)?,
            dw: store.vector(knot.keys.dw)?,
        })
    }

    /// The ICP + window-solve stage for frame ≥ 1.
    fn icp(
        &mut self,
        index: usize,
        keypoints: &mut [Point3D],
        imu_samples: &[ImuSample],
    ) -> Result<IcpReport, OdometryError> {
        let prev_knot_index = self.knots.len() - 1;
        let prev_time = self.knots[prev_knot_index].time;
        // The knot chain ends at the previous successful sweep; a failed
        // sweep in between is allowed, a missing end knot is not.
        if self.frames[index - 1].success
            && (self.frames[index - 1].end_timestamp - prev_time).abs() > 1e-9
        {
            return Err(OdometryError::InvariantViolation(
                "missing previous sweep end knot".to_string(),
            ));
        }
        let curr_time = self.frames[index].end_timestamp;

        // --- new knots, initialized by extrapolating the prior ---
        let prev_state = self.knot_state_from_store(prev_knot_index)?;
        let prev_bias = self.filter.store().vector(self.knots[prev_knot_index].bias_key)?;
        let prev_t_mi = self.filter.store().pose(self.knots[prev_knot_index].t_mi_key)?;
        let num_states = self.config.num_extra_states + 1;
        let span = curr_time - prev_time;
        for i in 1..=num_states {
            let knot_time = if i == num_states {
                curr_time
            } else {
                prev_time + span * (i as f64) / (num_states as f64)
            };
            let init = extrapolate(&self.prior, &prev_state, prev_time, knot_time);
            let state = KnotState {
                pose: init.pose,
                w: init.velocity,
                dw: init.acceleration,
            };
            let bias_locked = !self.config.use_imu;
            let t_mi_locked = !self.config.use_imu || self.config.t_mi_init_only;
            let knot =
                self.create_knot(knot_time, state, prev_bias, prev_t_mi, false, bias_locked, t_mi_locked);
            self.knots.push(knot);
        }

        // --- trajectory priors for the new pairs ---
        let mut prior_terms: Vec<CostTerm> = Vec::new();
        for i in prev_knot_index..self.knots.len() - 1 {
            prior_terms.push(CostTerm::TrajectoryPrior {
                t1: self.knots[i].time,
                k1: self.knots[i].keys,
                t2: self.knots[i + 1].time,
                k2: self.knots[i + 1].keys,
                prior: self.prior,
            });
        }
        if index == 1 {
            // Strong absolute priors anchor the first optimized knot.
            let first = &self.knots[prev_knot_index];
            prior_terms.push(CostTerm::PosePrior {
                key: first.keys.pose,
                value: Se3::identity(),
                information: Matrix6::identity() / 1e-4,
            });
            prior_terms.push(CostTerm::VectorPrior {
                key: first.keys.w,
                value: Vector6::zeros(),
                information: Matrix6::identity() / 1e-4,
            });
            prior_terms.push(CostTerm::VectorPrior {
                key: first.keys.dw,
                value: Vector6::zeros(),
                information: Matrix6::identity() / 1e-1,
            });
        }

        // --- IMU cost terms ---
        let mut imu_terms: Vec<CostTerm> = Vec::new();
        let mut imu_prior_terms: Vec<CostTerm> = Vec::new();
        let mut t_mi_terms: Vec<CostTerm> = Vec::new();
        if self.config.use_imu {
            self.build_imu_terms(
                index,
                prev_knot_index,
                imu_samples,
                &mut imu_terms,
                &mut imu_prior_terms,
                &mut t_mi_terms,
            )?;
        }

        // --- marginalization ---
        if index > self.config.delay_adding_points {
            let marg_time =
                self.frames[index - self.config.delay_adding_points - 1].end_timestamp;
            self.marginalize_until(marg_time)?;
        }

        // --- ICP loop ---
        let nb_voxels = if index < self.config.init_num_frames { 2 } else { 1 };
        let inner_params = GaussNewtonParams {
            max_iterations: self.config.max_iterations,
            ..GaussNewtonParams::default()
        };
        let mut meas_terms: Vec<CostTerm> = Vec::new();
        let mut num_residuals = 0usize;

        for iter in 0..self.config.num_iters_icp {
            let segment = self.active_segment(prev_knot_index)?;
            self.transform_keypoints(&segment, keypoints)?;

            let assoc: Vec<Option<CostTerm>> = {
                let this = &*self;
                let seg = &segment;
                let kps: &[Point3D] = keypoints;
                this.pool.install(|| {
                    kps.par_iter()
                        .map(|kp| this.associate(kp, seg, nb_voxels))
                        .collect::<Result<Vec<_>, OdometryError>>()
                })?
            };
            meas_terms.clear();
            meas_terms.extend(assoc.into_iter().flatten());
            num_residuals = meas_terms.len();

            if num_residuals < self.config.min_number_keypoints {
                log::error!(
                    "frame {index}: only {num_residuals} point-to-plane residuals \
                     (minimum {})",
                    self.config.min_number_keypoints
                );
                return Ok(IcpReport {
                    failure: Some(format!("{num_residuals} residuals")),
                    num_residuals,
                });
            }

            let transient: [&[CostTerm]; 5] = [
                &prior_terms,
                &meas_terms,
                &imu_terms,
                &imu_prior_terms,
                &t_mi_terms,
            ];
            self.filter.solve(&transient, &inner_params)?;

            let (diff_trans, diff_rot) = self.refresh_frame_poses(index, prev_knot_index)?;
            if index >= 2
                && diff_trans < self.config.threshold_translation_norm
                && diff_rot < self.config.threshold_orientation_norm
            {
                log::debug!("frame {index}: ICP converged after {} iterations", iter + 1);
                break;
            }
        }

        // --- guardrails before committing to the window ---
        if self.filter.num_variables() > MAX_ACTIVE_VARIABLES {
            return Ok(IcpReport {
                failure: Some(format!(
                    "{} active variables in the window",
                    self.filter.num_variables()
                )),
                num_residuals,
            });
        }
        let committed = prior_terms.len()
            + meas_terms.len()
            + imu_terms.len()
            + imu_prior_terms.len()
            + t_mi_terms.len();
        if self.filter.num_cost_terms() + committed > MAX_COST_TERMS {
            return Ok(IcpReport {
                failure: Some(format!(
                    "{} cost terms in the window",
                    self.filter.num_cost_terms() + committed
                )),
                num_residuals,
            });
        }

        // --- sliding-window solve over the committed problem ---
        self.filter.add_cost_terms(prior_terms);
        self.filter.add_cost_terms(meas_terms);
        self.filter.add_cost_terms(imu_terms);
        self.filter.add_cost_terms(imu_prior_terms);
        self.filter.add_cost_terms(t_mi_terms);

        log::debug!(
            "frame {index}: window solve with {} variables, {} cost terms",
            self.filter.num_variables(),
            self.filter.num_cost_terms()
        );
        let summary = self.filter.solve(&[], &GaussNewtonParams::default())?;

        if self.config.use_imu && self.config.t_mi_init_only {
            // New knots carry the (locked) gravity-frame estimate forward.
            let value = self
                .filter
                .store()
                .pose(self.knots[prev_knot_index].t_mi_key)?;
            for i in prev_knot_index + 1..self.knots.len() {
                let key = self.knots[i].t_mi_key;
                self.filter.store_mut().set_pose(key, value)?;
            }
        }

        self.refresh_frame_poses(index, prev_knot_index)?;
        self.extract_mid_state(index, prev_knot_index, &summary)?;

        // Leave the keypoints in their final world positions.
        let segment = self.active_segment(prev_knot_index)?;
        self.transform_keypoints(&segment, keypoints)?;

        Ok(IcpReport {
            failure: None,
            num_residuals,
        })
    }

    fn build_imu_terms(
        &self,
        index: usize,
        prev_knot_index: usize,
        imu_samples: &[ImuSample],
        imu_terms: &mut Vec<CostTerm>,
        imu_prior_terms: &mut Vec<CostTerm>,
        t_mi_terms: &mut Vec<CostTerm>,
    ) -> Result<(), OdometryError> {
        let config = &self.config;
        let acc_information = Matrix3::identity() / config.r_imu_acc;
        let gyro_information = Matrix3::identity() / config.r_imu_ang;

        let last = self.knots.len() - 1;
        for sample in imu_samples {
            let ts = sample.timestamp;
            if ts < self.knots[prev_knot_index].time || ts > self.knots[last].time {
                return Err(OdometryError::InvariantViolation(format!(
                    "IMU sample at {ts} outside bracketing knots [{}, {}]",
                    self.knots[prev_knot_index].time,
                    self.knots[last].time
                )));
            }
            let mut i = prev_knot_index;
            while i + 1 < last && ts >= self.knots[i + 1].time {
                i += 1;
            }
            let bracket = Bracket::Pair {
                t1: self.knots[i].time,
                k1: self.knots[i].keys,
                t2: self.knots[i + 1].time,
                k2: self.knots[i + 1].keys,
            };
            imu_terms.push(CostTerm::Gyroscope {
                bracket,
                prior: self.prior,
                query_time: ts,
                bias: self.knots[i].bias_key,
                meas: sample.ang_vel,
                information: gyro_information,
                loss: RobustLoss::L1,
            });
            if config.use_accel {
                imu_terms.push(CostTerm::Accelerometer {
                    bracket,
                    prior: self.prior,
                    query_time: ts,
                    bias: self.knots[i].bias_key,
                    t_mi: self.knots[i].t_mi_key,
                    gravity: config.gravity,
                    meas: sample.lin_acc,
                    information: acc_information,
                    loss: RobustLoss::L1,
                });
            }
        }

        if index == 1 {
            imu_prior_terms.push(CostTerm::VectorPrior {
                key: self.knots[prev_knot_index].bias_key,
                value: Vector6::zeros(),
                information: Matrix6::identity() / config.p0_imu,
            });
        }
        if !config.t_mi_init_only || index == 1 {
            let t_mi_cov = [1e-3, 1e-3, 1e-3, 0.1, 0.1, 1e-4];
            let mut information = Matrix6::zeros();
            for (i, cov) in t_mi_cov.iter().enumerate() {
                information[(i, i)] = 1.0 / cov;
            }
            t_mi_terms.push(CostTerm::PosePrior {
                key: self.knots[prev_knot_index].t_mi_key,
                value: Se3::identity(),
                information,
            });
        }

        // Random walks between adjacent knots of this frame.
        let mut bias_rw_information = Matrix6::identity();
        bias_rw_information /= config.q_imu;
        let qg = config.qg_diag_vector();
        let mut t_mi_rw_information = Matrix6::zeros();
        for i in 0..6 {
            t_mi_rw_information[(i, i)] = 1.0 / qg[i];
        }
        for i in prev_knot_index..self.knots.len() - 1 {
            imu_prior_terms.push(CostTerm::RelativeVector {
                from: self.knots[i].bias_key,
                to: self.knots[i + 1].bias_key,
                information: bias_rw_information,
            });
            if !config.t_mi_init_only {
                t_mi_terms.push(CostTerm::RelativePose {
                    from: self.knots[i].t_mi_key,
                    to: self.knots[i + 1].t_mi_key,
                    information: t_mi_rw_information,
                });
            }
        }
        Ok(())
    }

    /// Marginalize every knot with time ≤ `marg_time` out of the filter.
    fn marginalize_until(&mut self, marg_time: f64) -> Result<(), OdometryError> {
        let mut marg_keys: Vec<VarKey> = Vec::new();
        let mut locked_leftovers: Vec<VarKey> = Vec::new();
        let mut first_surviving = self.to_marginalize;
        for i in self.to_marginalize..self.knots.len() {
            if self.knots[i].time > marg_time + 1e-12 {
                break;
            }
            let knot = &self.knots[i];
            for key in [knot.keys.pose, knot.keys.w, knot.keys.dw, knot.bias_key, knot.t_mi_key] {
                if self.filter.store().is_locked(key)? {
                    locked_leftovers.push(key);
                } else {
                    marg_keys.push(key);
                }
            }
            first_surviving = i + 1;
        }
        if marg_keys.is_empty() {
            return Ok(());
        }
        log::info!(
            "marginalizing knots {}..{} ({} variables)",
            self.to_marginalize,
            first_surviving,
            marg_keys.len()
        );
        self.filter.marginalize(&marg_keys)?;
        for key in locked_leftovers {
            self.filter.store_mut().remove(key);
        }
        for knot in &mut self.knots[self.to_marginalize..first_surviving] {
            knot.marginalized = true;
        }
        self.to_marginalize = first_surviving;
        Ok(())
    }

    /// Snapshot of the active trajectory segment (previous sweep end
    /// onwards) from current store values.
    fn active_segment(&self, prev_knot_index: usize) -> Result<Vec<SegmentKnot>, OdometryError> {
        (prev_knot_index..self.knots.len())
            .map(|i| {
                Ok(SegmentKnot {
                    time: self.knots[i].time,
                    keys: self.knots[i].keys,
                    state: self.knot_state_from_store(i)?,
                })
            })
            .collect()
    }

    /// Recompute all keypoint world positions from the interpolated poses.
    fn transform_keypoints(
        &self,
        segment: &[SegmentKnot],
        keypoints: &mut [Point3D],
    ) -> Result<(), OdometryError> {
        let records: Vec<(f64, KnotState)> = segment.iter().map(|s| (s.time, s.state)).collect();
        let prior = self.prior;
        let t_rs = self.t_rs;
        self.pool.install(|| {
            keypoints.par_iter_mut().try_for_each(|kp| {
                let state = eval_state(&records, &prior, kp.timestamp)?;
                let t_ms = state.pose.inverse().compose(&t_rs);
                kp.pt = t_ms.transform(&kp.raw_pt);
                Ok(())
            })
        })
    }

    /// Associate one keypoint against the map; `None` when the neighborhood
    /// or the plane gate rejects it.
    fn associate(
        &self,
        keypoint: &Point3D,
        segment: &[SegmentKnot],
        nb_voxels: i32,
    ) -> Result<Option<CostTerm>, OdometryError> {
        let neighbors = self.map.search_neighbors(
            &keypoint.pt,
            nb_voxels,
            self.config.max_number_neighbors,
        );
        if neighbors.len() < self.config.min_number_neighbors {
            return Ok(None);
        }
        let neighborhood = compute_neighborhood(&neighbors)?;
        let weight = neighborhood.a2d.powf(self.config.power_planarity);

        let dist_to_plane = (keypoint.pt - neighbors[0]).dot(&neighborhood.normal).abs();
        if dist_to_plane >= self.config.p2p_max_dist {
            return Ok(None);
        }

        let scaled_normal = weight * neighborhood.normal;
        let information = scaled_normal * scaled_normal.transpose()
            + 1e-5 * nalgebra::Matrix3::identity();

        let loss = match self.config.p2p_loss_func {
            P2pLossFunc::L2 => RobustLoss::L2,
            P2pLossFunc::Dcs => RobustLoss::Dcs {
                k: self.config.p2p_loss_sigma,
            },
            P2pLossFunc::Cauchy => RobustLoss::Cauchy {
                k: self.config.p2p_loss_sigma,
            },
            P2pLossFunc::GemanMcClure => RobustLoss::GemanMcClure {
                k: self.config.p2p_loss_sigma,
            },
        };

        let Some(bracket) = bracket_for(segment, keypoint.timestamp) else {
            return Err(OdometryError::InvariantViolation(
                "association against an empty trajectory segment".to_string(),
            ));
        };
        Ok(Some(CostTerm::PointToPlane {
            bracket,
            prior: self.prior,
            query_time: keypoint.timestamp,
            raw_pt: keypoint.raw_pt,
            t_rs: self.t_rs,
            reference: neighbors[0],
            information,
            loss,
        }))
    }

    /// Update the frame's begin/mid/end sensor poses from the current
    /// estimate; returns the accumulated translation/rotation change.
    fn refresh_frame_poses(
        &mut self,
        index: usize,
        prev_knot_index: usize,
    ) -> Result<(f64, f64), OdometryError> {
        let segment = self.active_segment(prev_knot_index)?;
        let records: Vec<(f64, KnotState)> = segment.iter().map(|s| (s.time, s.state)).collect();

        let frame = &self.frames[index];
        let begin = eval_state(&records, &self.prior, frame.begin_timestamp)?;
        let end = eval_state(&records, &self.prior, frame.end_timestamp)?;
        let mid = eval_state(&records, &self.prior, frame.eval_timestamp)?;

        let begin_ms = begin.pose.inverse().compose(&self.t_rs);
        let end_ms = end.pose.inverse().compose(&self.t_rs);
        let mid_ms = mid.pose.inverse().compose(&self.t_rs);

        let frame = &mut self.frames[index];
        let diff_trans =
            (frame.begin_t - begin_ms.t).norm() + (frame.end_t - end_ms.t).norm();
        let diff_rot = rotation_angle_deg(&frame.begin_r, &begin_ms.r)
            + rotation_angle_deg(&frame.end_r, &end_ms.r);

        frame.begin_r = begin_ms.r;
        frame.begin_t = begin_ms.t;
        frame.end_r = end_ms.r;
        frame.end_t = end_ms.t;
        frame.mid_pose = mid_ms;

        Ok((diff_trans, diff_rot))
    }

    /// Extract velocity, acceleration, bias, gravity frame, and the 18×18
    /// covariance at the frame's eval time.
    fn extract_mid_state(
        &mut self,
        index: usize,
        prev_knot_index: usize,
        summary: &crate::engine::filter::SolveSummary,
    ) -> Result<(), OdometryError> {
        let eval_time = self.frames[index].eval_timestamp;
        let segment = self.active_segment(prev_knot_index)?;
        let records: Vec<(f64, KnotState)> = segment.iter().map(|s| (s.time, s.state)).collect();
        let state = eval_state(&records, &self.prior, eval_time)?;

        // Bracketing pair for the covariance chain (clamped to the segment).
        let mut i = 0;
        while i + 2 < segment.len() && eval_time >= segment[i + 1].time {
            i += 1;
        }
        let (k1, k2) = (&segment[i], &segment[i + 1]);

        let mid_b = self
            .filter
            .store()
            .vector(self.knots[prev_knot_index + i].bias_key)?;
        let mid_t_mi = self
            .filter
            .store()
            .pose(self.knots[prev_knot_index + i].t_mi_key)?;

        let keys = [
            k1.keys.pose, k1.keys.w, k1.keys.dw, k2.keys.pose, k2.keys.w, k2.keys.dw,
        ];
        let mid_cov = match summary.covariance(&keys) {
            Some(joint) => {
                let interp = interpolate_with_jacobians(
                    &self.prior,
                    &k1.state,
                    k1.time,
                    &k2.state,
                    k2.time,
                    eval_time.clamp(k1.time, k2.time),
                );
                let mut jac = DMatrix::zeros(18, 36);
                for var in 0..6 {
                    for r in 0..6 {
                        for c in 0..6 {
                            jac[(r, 6 * var + c)] = interp.pose_jac[var][(r, c)];
                            jac[(6 + r, 6 * var + c)] = interp.velocity_jac[var][(r, c)];
                            jac[(12 + r, 6 * var + c)] = interp.acceleration_jac[var][(r, c)];
                        }
                    }
                }
                let cov = &jac * joint * jac.transpose();
                SMatrix::<f64, 18, 18>::from_fn(|r, c| cov[(r, c)])
            }
            None => SMatrix::<f64, 18, 18>::identity(),
        };

        let frame = &mut self.frames[index];
        frame.mid_w = state.velocity;
        frame.mid_dw = state.acceleration;
        frame.mid_b = mid_b;
        frame.mid_t_mi = mid_t_mi;
        frame.mid_state_cov = mid_cov;
        Ok(())
    }

    /// Copy current store values into the knot records of active knots.
    fn sync_knot_records(&mut self) -> Result<(), OdometryError> {
        for i in 0..self.knots.len() {
            if self.knots[i].marginalized {
                continue;
            }
            let state = self.knot_state_from_store(i)?;
            let bias = self.filter.store().vector(self.knots[i].bias_key)?;
            let t_mi = self.filter.store().pose(self.knots[i].t_mi_key)?;
            let knot = &mut self.knots[i];
            knot.state = state;
            knot.bias = bias;
            knot.t_mi = t_mi;
        }
        Ok(())
    }

    fn knot_records(&self) -> Vec<(f64, KnotState)> {
        self.knots.iter().map(|k| (k.time, k.state)).collect()
    }

    fn sensor_pose_at(
        &self,
        records: &[(f64, KnotState)],
        time: f64,
    ) -> Result<Se3, OdometryError> {
        let state = eval_state(records, &self.prior, time)?;
        Ok(state.pose.inverse().compose(&self.t_rs))
    }

    /// Re-project the stored sweep of `update_index` through the posterior
    /// trajectory and fold it into the map.
    fn update_map(&mut self, index: usize, update_index: usize) -> Result<(), OdometryError> {
        let mut points = std::mem::take(&mut self.frames[update_index].points);
        if !points.is_empty() {
            let records = self.knot_records();
            let prior = self.prior;
            let t_rs = self.t_rs;
            self.pool.install(|| {
                points.par_iter_mut().try_for_each(|p| {
                    let state = eval_state(&records, &prior, p.timestamp)?;
                    let t_ms = state.pose.inverse().compose(&t_rs);
                    p.pt = t_ms.transform(&p.raw_pt);
                    Ok::<(), OdometryError>(())
                })
            })?;
            log::debug!(
                "map update: frame {update_index} adds {} points ({} voxels before)",
                points.len(),
                self.map.num_voxels()
            );
            self.map.add(points.iter().map(|p| p.pt));
        }
        let location = self.frames[index].end_t;
        self.map.remove(&location, self.config.max_distance);
        Ok(())
    }
}

/// Locate the bracket for a query time within the active segment.
fn bracket_for(segment: &[SegmentKnot], time: f64) -> Option<Bracket> {
    let first = segment.first()?;
    let last = segment.last()?;
    if segment.len() < 2 || time <= first.time {
        return Some(Bracket::Single {
            t: first.time,
            k: first.keys,
        });
    }
    if time >= last.time {
        return Some(Bracket::Single {
            t: last.time,
            k: last.keys,
        });
    }
    let mut i = 0;
    while i + 2 < segment.len() && time >= segment[i + 1].time {
        i += 1;
    }
    Some(Bracket::Pair {
        t1: segment[i].time,
        k1: segment[i].keys,
        t2: segment[i + 1].time,
        k2: segment[i + 1].keys,
    })
}

/// Evaluate the trajectory at `t` over a sorted knot record list,
/// extrapolating beyond either end.
fn eval_state(
    records: &[(f64, KnotState)],
    prior: &MotionPrior,
    t: f64,
) -> Result<InterpolatedState, OdometryError> {
    let (first, last) = match (records.first(), records.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => {
            return Err(OdometryError::InvariantViolation(
                "trajectory evaluation on an empty knot list".to_string(),
            ));
        }
    };
    if t <= first.0 {
        return Ok(extrapolate(prior, &first.1, first.0, t));
    }
    if t >= last.0 {
        return Ok(extrapolate(prior, &last.1, last.0, t));
    }
    let mut i = records.partition_point(|(time, _)| *time <= t);
    i = i.saturating_sub(1);
    let (t1, k1) = &records[i];
    let (t2, k2) = &records[i + 1];
    Ok(interpolate(prior, k1, *t1, k2, *t2, t))
}

/// Angle between two rotations in degrees.
fn rotation_angle_deg(a: &nalgebra::Matrix3<f64>, b: &nalgebra::Matrix3<f64>) -> f64 {
    let cos = ((a * b.transpose()).trace() - 1.0) * 0.5;
    cos.clamp(-1.0, 1.0).acos().to_degrees()
}
