//! Attitude estimation.
//!
//! [`OrientationFilter`] is an extended Kalman filter over the seven-element
//! state `[qw, qx, qy, qz, bx, by, bz]`: the device→reference quaternion and
//! the gyroscope bias.
//!
//! - **Predict** integrates the bias-corrected angular rate:
//!   `q̇ = ½ · q ⊗ (0, ω − b)`. The Jacobian is
//!   ```text
//!   F = | I + ½dt·Ω(ω−b)   −½dt·Ξ(q) |
//!       |       0              I     |
//!   ```
//!   and the process noise grows linearly with `dt`.
//! - **Gravity update** compares the normalised accelerometer reading with
//!   the gravity direction predicted in the device frame, correcting roll and
//!   pitch. Readings whose magnitude is far from `g` (the device is
//!   accelerating) are skipped.
//! - **Heading update** tilt-compensates the magnetometer with the current
//!   roll/pitch and corrects yaw with the resulting heading.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_perception::orientation::{OrientationConfig, OrientationFilter};
//! use chiroptera_types::Vec3;
//!
//! let mut filter = OrientationFilter::new(OrientationConfig::default(), chrono::Utc::now());
//! assert!(filter.predict(0.01, Vec3::new(0.0, 0.0, 0.1)));
//! assert!(!filter.predict(-0.01, Vec3::zero()));
//!
//! let level = Vec3::new(0.0, 0.0, 9.81);
//! filter.update(level, Some(Vec3::new(0.3, 0.0, -0.4)));
//! let (roll, pitch, _) = filter.current_state().euler();
//! assert!(roll.abs() < 0.05 && pitch.abs() < 0.05);
//! ```

use chiroptera_types::geometry::wrap_angle;
use chiroptera_types::linalg::{Matrix, Vector};
use chiroptera_types::{
    ChiropteraError, ImuSample, OrientationState, Quaternion, Vec3, elapsed_seconds,
    offset_by_seconds,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard gravity (m/s²).
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Horizontal magnetic field below this magnitude carries no usable heading.
const MIN_HORIZONTAL_FIELD: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Gyroscope white noise density (rad/s/√Hz).
    pub gyro_noise: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub gyro_bias_walk: f64,
    /// Noise of the normalised accelerometer direction (unitless).
    pub accel_noise: f64,
    /// Noise of the tilt-compensated magnetic heading (rad).
    pub heading_noise: f64,
    pub gravity: f64,
    /// Skip gravity updates when `| |a| − g | > accel_gate · g`.
    pub accel_gate: f64,
    pub initial_attitude_std: f64,
    pub initial_bias_std: f64,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            gyro_noise: 0.01,
            gyro_bias_walk: 1e-4,
            accel_noise: 0.05,
            heading_noise: 0.05,
            gravity: STANDARD_GRAVITY,
            accel_gate: 0.15,
            initial_attitude_std: 0.5,
            initial_bias_std: 0.05,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OrientationFilter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrientationFilter {
    config: OrientationConfig,
    state: OrientationState,
    initialized: bool,
}

impl OrientationFilter {
    /// Filter at the identity attitude with zero bias, stamped `timestamp`.
    pub fn new(config: OrientationConfig, timestamp: DateTime<Utc>) -> Self {
        Self {
            state: OrientationState {
                orientation: Quaternion::identity(),
                gyro_bias: Vec3::zero(),
                covariance: initial_covariance(&config),
                timestamp,
            },
            config,
            initialized: false,
        }
    }

    pub fn config(&self) -> &OrientationConfig {
        &self.config
    }

    /// Snapshot of the current estimate.
    pub fn current_state(&self) -> OrientationState {
        self.state
    }

    /// `true` once an absolute attitude has been set with
    /// [`initialize_from`][Self::initialize_from].
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Snap the attitude to the one implied by a gravity reading and an
    /// optional magnetometer reading (yaw 0 without one). Bias and
    /// covariance are reset.
    pub fn initialize_from(
        &mut self,
        accelerometer: Vec3,
        magnetometer: Option<Vec3>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ChiropteraError> {
        let up = accelerometer.normalized().ok_or_else(|| ChiropteraError::Sensor {
            component: "accelerometer".into(),
            details: "zero specific force, cannot level".into(),
        })?;
        let roll = up.y.atan2(up.z);
        let pitch = (-up.x).atan2((up.y * up.y + up.z * up.z).sqrt());
        let yaw = magnetometer
            .and_then(|m| tilt_compensated_heading(m, roll, pitch))
            .unwrap_or(0.0);

        self.state = OrientationState {
            orientation: Quaternion::from_euler(roll, pitch, yaw),
            gyro_bias: Vec3::zero(),
            covariance: initial_covariance(&self.config),
            timestamp,
        };
        self.initialized = true;
        tracing::info!(roll, pitch, yaw, "orientation initialised");
        Ok(())
    }

    /// Propagate by `dt` seconds with the raw gyroscope rate `ω` (rad/s).
    ///
    /// Returns `false` and leaves the state untouched when `dt` is negative
    /// or non-finite.
    pub fn predict(&mut self, dt: f64, angular_velocity: Vec3) -> bool {
        if !dt.is_finite() || dt < 0.0 {
            tracing::warn!(dt, "orientation sample out of order, discarded");
            return false;
        }
        if !angular_velocity.is_finite() {
            tracing::warn!("non-finite gyroscope sample, discarded");
            return false;
        }

        let q = self.state.orientation;
        let w = angular_velocity - self.state.gyro_bias;

        let mut f = Matrix::<7, 7>::identity();
        let omega = omega_matrix(w);
        let xi = xi_matrix(q);
        for r in 0..4 {
            for c in 0..4 {
                f[(r, c)] += 0.5 * dt * omega[(r, c)];
            }
            for c in 0..3 {
                f[(r, 4 + c)] = -0.5 * dt * xi[(r, c)];
            }
        }

        // Quaternion noise is the gyro noise mapped through ½Ξ(q).
        let mut qn = Matrix::<7, 7>::zeros();
        let gyro_var = self.config.gyro_noise * self.config.gyro_noise * dt;
        let q_block = (xi * xi.transpose()).scale(0.25 * gyro_var);
        for r in 0..4 {
            for c in 0..4 {
                qn[(r, c)] = q_block[(r, c)];
            }
        }
        let bias_var = self.config.gyro_bias_walk * self.config.gyro_bias_walk * dt;
        for i in 4..7 {
            qn[(i, i)] = bias_var;
        }

        let angle = w.norm() * dt;
        self.state.orientation = q.mul(Quaternion::from_axis_angle(w, angle)).normalized();
        self.state.covariance = (f * self.state.covariance * f.transpose() + qn).symmetrized();
        self.state.timestamp = offset_by_seconds(self.state.timestamp, dt);
        true
    }

    /// Propagate to `timestamp`. Samples older than the current state are
    /// dropped and `false` is returned.
    pub fn predict_at(&mut self, timestamp: DateTime<Utc>, angular_velocity: Vec3) -> bool {
        let dt = elapsed_seconds(self.state.timestamp, timestamp);
        if dt < 0.0 {
            tracing::warn!(dt, "orientation sample older than state, discarded");
            return false;
        }
        if !self.predict(dt, angular_velocity) {
            return false;
        }
        self.state.timestamp = timestamp;
        true
    }

    /// Correct with an accelerometer reading and, when present, a
    /// magnetometer reading. Returns `true` if any correction was applied.
    ///
    /// An uninitialised filter is snapped to the attitude the readings imply
    /// (see [`initialize_from`][Self::initialize_from]) instead of being
    /// corrected from the identity.
    pub fn update(&mut self, accelerometer: Vec3, magnetometer: Option<Vec3>) -> bool {
        if !self.initialized {
            if !self.within_gravity_gate(accelerometer) {
                return false;
            }
            let timestamp = self.state.timestamp;
            return self.initialize_from(accelerometer, magnetometer, timestamp).is_ok();
        }
        let gravity_applied = self.update_gravity(accelerometer);
        let heading_applied = magnetometer.is_some_and(|m| self.update_heading(m));
        gravity_applied || heading_applied
    }

    /// Roll/pitch correction from the gravity direction.
    pub fn update_gravity(&mut self, accelerometer: Vec3) -> bool {
        if !self.within_gravity_gate(accelerometer) {
            return false;
        }
        let measured = accelerometer.scale(1.0 / accelerometer.norm());

        let q = self.state.orientation;
        let (w, x, y, z) = (q.w, q.x, q.y, q.z);
        let predicted = Vec3::new(
            2.0 * (x * z - w * y),
            2.0 * (w * x + y * z),
            w * w - x * x - y * y + z * z,
        );
        let h = Matrix::<3, 7>::from_rows([
            [-2.0 * y, 2.0 * z, -2.0 * w, 2.0 * x, 0.0, 0.0, 0.0],
            [2.0 * x, 2.0 * w, 2.0 * z, 2.0 * y, 0.0, 0.0, 0.0],
            [2.0 * w, -2.0 * x, -2.0 * y, 2.0 * z, 0.0, 0.0, 0.0],
        ]);
        let innovation = Vector::<3>::from_column((measured - predicted).to_array());
        let var = self.config.accel_noise * self.config.accel_noise;
        self.correct(innovation, h, Matrix::from_diagonal([var; 3]))
    }

    fn within_gravity_gate(&self, accelerometer: Vec3) -> bool {
        let magnitude = accelerometer.norm();
        let g = self.config.gravity;
        if !magnitude.is_finite() || (magnitude - g).abs() > self.config.accel_gate * g {
            tracing::debug!(magnitude, "accelerometer outside gravity gate, skipped");
            return false;
        }
        true
    }

    /// Yaw correction from a tilt-compensated magnetic heading.
    pub fn update_heading(&mut self, magnetometer: Vec3) -> bool {
        if !magnetometer.is_finite() {
            return false;
        }
        let (roll, pitch, yaw) = self.state.orientation.to_euler();
        let Some(heading) = tilt_compensated_heading(magnetometer, roll, pitch) else {
            tracing::debug!("magnetometer has no horizontal component, skipped");
            return false;
        };

        let q = self.state.orientation;
        let (w, x, y, z) = (q.w, q.x, q.y, q.z);
        let a = 2.0 * (w * z + x * y);
        let b = 1.0 - 2.0 * (y * y + z * z);
        let denom = a * a + b * b;
        if denom < 1e-12 {
            return false;
        }
        let da = [2.0 * z, 2.0 * y, 2.0 * x, 2.0 * w];
        let db = [0.0, 0.0, -4.0 * y, -4.0 * z];
        let mut h = Matrix::<1, 7>::zeros();
        for i in 0..4 {
            h[(0, i)] = (b * da[i] - a * db[i]) / denom;
        }

        let innovation = Vector::<1>::from_column([wrap_angle(heading - yaw)]);
        let var = self.config.heading_noise * self.config.heading_noise;
        self.correct(innovation, h, Matrix::from_diagonal([var]))
    }

    /// Predict then correct with one IMU sample, initialising on the first
    /// sample. Returns `false` when the sample was dropped as out of order.
    pub fn apply_imu(&mut self, sample: &ImuSample) -> bool {
        if !self.initialized {
            return self
                .initialize_from(sample.accelerometer, sample.magnetometer, sample.timestamp)
                .is_ok();
        }
        if !self.predict_at(sample.timestamp, sample.gyroscope) {
            return false;
        }
        self.update(sample.accelerometer, sample.magnetometer);
        true
    }

    /// Kalman correction with Joseph-form covariance update.
    fn correct<const M: usize>(
        &mut self,
        innovation: Vector<M>,
        h: Matrix<M, 7>,
        r: Matrix<M, M>,
    ) -> bool {
        let p = self.state.covariance;
        let s = h * p * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            tracing::warn!("singular innovation covariance, update skipped");
            return false;
        };
        let k = p * h.transpose() * s_inv;
        let dx = (k * innovation).column();
        if dx.iter().any(|v| !v.is_finite()) {
            tracing::warn!("non-finite correction, update skipped");
            return false;
        }

        let q = self.state.orientation;
        self.state.orientation =
            Quaternion::new(q.w + dx[0], q.x + dx[1], q.y + dx[2], q.z + dx[3]).normalized();
        self.state.gyro_bias = self.state.gyro_bias + Vec3::new(dx[4], dx[5], dx[6]);

        let i_kh = Matrix::<7, 7>::identity() - k * h;
        self.state.covariance =
            (i_kh * p * i_kh.transpose() + k * r * k.transpose()).symmetrized();
        true
    }
}

/// Heading (yaw, rad) of the horizontal magnetic field after undoing
/// `roll` and `pitch`. `None` when the field is (nearly) vertical.
pub fn tilt_compensated_heading(magnetometer: Vec3, roll: f64, pitch: f64) -> Option<f64> {
    let level = Quaternion::from_euler(roll, pitch, 0.0).rotate(magnetometer);
    if level.x.hypot(level.y) < MIN_HORIZONTAL_FIELD {
        return None;
    }
    Some((-level.y).atan2(level.x))
}

fn initial_covariance(config: &OrientationConfig) -> Matrix<7, 7> {
    let a = config.initial_attitude_std * config.initial_attitude_std;
    let b = config.initial_bias_std * config.initial_bias_std;
    Matrix::from_diagonal([a, a, a, a, b, b, b])
}

/// `Ω(ω)` such that `q ⊗ (0, ω) = Ω(ω)·q`.
fn omega_matrix(w: Vec3) -> Matrix<4, 4> {
    Matrix::from_rows([
        [0.0, -w.x, -w.y, -w.z],
        [w.x, 0.0, w.z, -w.y],
        [w.y, -w.z, 0.0, w.x],
        [w.z, w.y, -w.x, 0.0],
    ])
}

/// `Ξ(q)` such that `q ⊗ (0, ω) = Ξ(q)·ω`.
fn xi_matrix(q: Quaternion) -> Matrix<4, 3> {
    Matrix::from_rows([
        [-q.x, -q.y, -q.z],
        [q.w, -q.z, q.y],
        [q.z, q.w, -q.x],
        [-q.y, q.x, q.w],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const EARTH_FIELD: Vec3 = Vec3::new(0.2, 0.0, -0.45);

    fn readings(truth: Quaternion) -> (Vec3, Vec3) {
        let accel = truth.inverse_rotate(Vec3::new(0.0, 0.0, STANDARD_GRAVITY));
        let mag = truth.inverse_rotate(EARTH_FIELD);
        (accel, mag)
    }

    fn attitude_trace(state: &OrientationState) -> f64 {
        state.covariance.diagonal()[..4].iter().sum()
    }

    #[test]
    fn omega_and_xi_agree_with_hamilton_product() {
        let q = Quaternion::from_euler(0.3, -0.2, 1.1);
        let w = Vec3::new(0.4, -0.7, 0.25);
        let expected = q.mul(Quaternion::new(0.0, w.x, w.y, w.z)).to_array();

        let via_omega = (omega_matrix(w) * Vector::<4>::from_column(q.to_array())).column();
        let via_xi = (xi_matrix(q) * Vector::<3>::from_column(w.to_array())).column();
        for i in 0..4 {
            assert!((via_omega[i] - expected[i]).abs() < 1e-12);
            assert!((via_xi[i] - expected[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn predict_integrates_constant_rate() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        for _ in 0..100 {
            assert!(f.predict(0.01, Vec3::new(0.0, 0.0, FRAC_PI_2)));
        }
        let yaw = f.current_state().orientation.yaw();
        assert!((yaw - FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn predict_grows_covariance() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        let before = f.current_state().covariance.trace();
        f.predict(0.1, Vec3::zero());
        assert!(f.current_state().covariance.trace() > before);
    }

    #[test]
    fn negative_dt_leaves_state_unchanged() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        f.predict(0.02, Vec3::new(0.1, 0.0, 0.0));
        let before = f.current_state();
        assert!(!f.predict(-0.01, Vec3::new(5.0, 5.0, 5.0)));
        assert!(!f.predict(f64::NAN, Vec3::zero()));
        assert_eq!(f.current_state(), before);
    }

    #[test]
    fn older_timestamp_is_rejected() {
        let t0 = Utc::now();
        let mut f = OrientationFilter::new(OrientationConfig::default(), t0);
        assert!(f.predict_at(offset_by_seconds(t0, 0.05), Vec3::new(0.0, 0.0, 0.3)));
        let before = f.current_state();
        assert!(!f.predict_at(offset_by_seconds(t0, 0.01), Vec3::new(0.0, 0.0, 3.0)));
        assert_eq!(f.current_state(), before);
        assert_eq!(before.timestamp, offset_by_seconds(t0, 0.05));
    }

    #[test]
    fn converges_within_fifty_updates_with_non_increasing_covariance() {
        let truth = Quaternion::from_euler(0.25, -0.15, 0.7);
        let (accel, mag) = readings(truth);
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());

        let mut trace = attitude_trace(&f.current_state());
        for _ in 0..50 {
            assert!(f.update(accel, Some(mag)));
            let next = attitude_trace(&f.current_state());
            assert!(next <= trace + 1e-12, "covariance grew: {trace} -> {next}");
            trace = next;
        }

        let (roll, pitch, yaw) = f.current_state().euler();
        assert!((roll - 0.25).abs() < 0.035, "roll {roll}");
        assert!((pitch + 0.15).abs() < 0.035, "pitch {pitch}");
        assert!(wrap_angle(yaw - 0.7).abs() < 0.035, "yaw {yaw}");
    }

    #[test]
    fn converges_to_a_fixed_point_at_large_attitudes() {
        let truths = [
            (0.25, -0.15, 0.7),
            (0.6, 0.4, 2.0),
            (-0.8, 0.5, 3.0),
            (0.3, -0.3, -2.8),
            (1.2, 0.2, 1.5),
        ];
        for (roll, pitch, yaw) in truths {
            let truth = Quaternion::from_euler(roll, pitch, yaw);
            let (accel, mag) = readings(truth);
            let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());

            let mut trace = attitude_trace(&f.current_state());
            let mut last_step = f64::INFINITY;
            for _ in 0..50 {
                let before = f.current_state().orientation;
                assert!(f.update(accel, Some(mag)));
                let state = f.current_state();
                last_step = state.orientation.angle_to(before);
                let next = attitude_trace(&state);
                assert!(next <= trace + 1e-12, "covariance grew at {roll}, {pitch}, {yaw}");
                trace = next;
            }

            let error = f.current_state().orientation.angle_to(truth);
            assert!(error < 1e-3, "error {error} at ({roll}, {pitch}, {yaw})");
            assert!(last_step < 1e-6, "still moving by {last_step} at ({roll}, {pitch}, {yaw})");
        }
    }

    #[test]
    fn update_waits_for_a_gravity_reading_before_initialising() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        assert!(!f.update(Vec3::new(0.0, 0.0, 20.0), None));
        assert!(!f.is_initialized());
        assert!(f.update(Vec3::new(0.0, 0.0, STANDARD_GRAVITY), None));
        assert!(f.is_initialized());
    }

    #[test]
    fn accelerometer_gate_skips_dynamic_readings() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        let before = f.current_state();
        assert!(!f.update_gravity(Vec3::new(0.0, 0.0, 15.0)));
        assert!(!f.update_gravity(Vec3::zero()));
        assert_eq!(f.current_state(), before);
    }

    #[test]
    fn initialise_from_recovers_attitude() {
        let truth = Quaternion::from_euler(-0.4, 0.3, -2.0);
        let (accel, mag) = readings(truth);
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        f.initialize_from(accel, Some(mag), Utc::now()).unwrap();
        assert!(f.is_initialized());
        assert!(f.current_state().orientation.angle_to(truth) < 1e-6);
    }

    #[test]
    fn initialise_without_gravity_fails() {
        let mut f = OrientationFilter::new(OrientationConfig::default(), Utc::now());
        let err = f.initialize_from(Vec3::zero(), None, Utc::now()).unwrap_err();
        assert!(matches!(err, ChiropteraError::Sensor { .. }));
        assert!(!f.is_initialized());
    }

    #[test]
    fn tracks_rotation_with_gyro_and_corrections() {
        let t0 = Utc::now();
        let rate = Vec3::new(0.0, 0.0, 0.5);
        let mut truth = Quaternion::from_euler(0.1, 0.05, 0.0);
        let mut f = OrientationFilter::new(OrientationConfig::default(), t0);

        let (accel, mag) = readings(truth);
        assert!(f.apply_imu(&ImuSample {
            timestamp: t0,
            accelerometer: accel,
            gyroscope: rate,
            magnetometer: Some(mag),
        }));

        for k in 1..=200 {
            truth = truth.mul(Quaternion::from_axis_angle(rate, 0.5 * 0.01)).normalized();
            let (accel, mag) = readings(truth);
            let sample = ImuSample {
                timestamp: offset_by_seconds(t0, 0.01 * k as f64),
                accelerometer: accel,
                gyroscope: rate,
                magnetometer: Some(mag),
            };
            assert!(f.apply_imu(&sample));
        }
        assert!(f.current_state().orientation.angle_to(truth) < 0.02);
    }
}
