//! Inertial dead reckoning.
//!
//! [`PositionFilter`] is a linear Kalman filter over `[p, v]` driven by
//! gravity-compensated acceleration. Without external hints it only
//! predicts, so its covariance grows without bound; [`PositionFilter::is_degraded`]
//! turns that growth into an explicit signal for callers that use the
//! translation estimate as a relative-motion aid.

use chiroptera_types::linalg::{Matrix, Vector};
use chiroptera_types::{PositionState, Quaternion, Vec3, elapsed_seconds, offset_by_seconds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orientation::STANDARD_GRAVITY;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Standard deviation of the acceleration input (m/s²).
    pub accel_noise: f64,
    pub gravity: f64,
    pub initial_position_std: f64,
    pub initial_velocity_std: f64,
    /// Velocity noise assumed by a [`PositionHint::Stationary`] update (m/s).
    pub stationary_velocity_std: f64,
    /// Position standard deviation (m) above which the estimate is degraded.
    pub degraded_position_std: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            accel_noise: 0.3,
            gravity: STANDARD_GRAVITY,
            initial_position_std: 0.01,
            initial_velocity_std: 0.01,
            stationary_velocity_std: 0.02,
            degraded_position_std: 0.5,
        }
    }
}

/// External information that can bound the dead-reckoning drift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PositionHint {
    /// Absolute position fix in the reference frame.
    AbsolutePosition { position: Vec3, std_meters: f64 },
    /// The device is known to be at rest (zero-velocity update).
    Stationary,
}

/// Linear acceleration in the reference frame.
///
/// The raw specific force is corrected by gravity expressed in the device
/// frame through `orientation`, then rotated into the reference frame.
pub fn gravity_compensate(specific_force: Vec3, orientation: Quaternion, gravity: f64) -> Vec3 {
    let gravity_device = orientation.inverse_rotate(Vec3::new(0.0, 0.0, gravity));
    orientation.rotate(specific_force - gravity_device)
}

#[derive(Debug, Clone)]
pub struct PositionFilter {
    config: PositionConfig,
    state: PositionState,
}

impl PositionFilter {
    pub fn new(config: PositionConfig, timestamp: DateTime<Utc>) -> Self {
        let p = config.initial_position_std * config.initial_position_std;
        let v = config.initial_velocity_std * config.initial_velocity_std;
        Self {
            state: PositionState {
                position: Vec3::zero(),
                velocity: Vec3::zero(),
                covariance: Matrix::from_diagonal([p, p, p, v, v, v]),
                timestamp,
            },
            config,
        }
    }

    pub fn current_state(&self) -> PositionState {
        self.state
    }

    /// Propagate by `dt` with a raw accelerometer reading and the device
    /// orientation at that instant.
    ///
    /// Returns `false` without touching the state for negative or
    /// non-finite `dt`.
    pub fn predict(&mut self, dt: f64, specific_force: Vec3, orientation: Quaternion) -> bool {
        if !dt.is_finite() || dt < 0.0 {
            tracing::warn!(dt, "position sample out of order, discarded");
            return false;
        }
        if !specific_force.is_finite() {
            return false;
        }
        let a = gravity_compensate(specific_force, orientation, self.config.gravity);

        let s = &mut self.state;
        s.position = s.position + s.velocity * dt + a * (0.5 * dt * dt);
        s.velocity = s.velocity + a * dt;

        let mut f = Matrix::<6, 6>::identity();
        let mut b = Matrix::<6, 3>::zeros();
        for i in 0..3 {
            f[(i, i + 3)] = dt;
            b[(i, i)] = 0.5 * dt * dt;
            b[(i + 3, i)] = dt;
        }
        let q = (b * b.transpose()).scale(self.config.accel_noise * self.config.accel_noise);
        s.covariance = (f * s.covariance * f.transpose() + q).symmetrized();
        s.timestamp = offset_by_seconds(s.timestamp, dt);
        true
    }

    /// Propagate to `timestamp`; older samples are dropped.
    pub fn predict_at(
        &mut self,
        timestamp: DateTime<Utc>,
        specific_force: Vec3,
        orientation: Quaternion,
    ) -> bool {
        let dt = elapsed_seconds(self.state.timestamp, timestamp);
        if !self.predict(dt, specific_force, orientation) {
            return false;
        }
        self.state.timestamp = timestamp;
        true
    }

    /// Apply an external hint. `None` is a no-op.
    pub fn update(&mut self, hint: Option<PositionHint>) -> bool {
        match hint {
            None => false,
            Some(PositionHint::AbsolutePosition {
                position,
                std_meters,
            }) => {
                let mut h = Matrix::<3, 6>::zeros();
                for i in 0..3 {
                    h[(i, i)] = 1.0;
                }
                let z = position - self.state.position;
                self.correct(z, h, std_meters * std_meters)
            }
            Some(PositionHint::Stationary) => {
                let mut h = Matrix::<3, 6>::zeros();
                for i in 0..3 {
                    h[(i, i + 3)] = 1.0;
                }
                let z = -self.state.velocity;
                let std = self.config.stationary_velocity_std;
                self.correct(z, h, std * std)
            }
        }
    }

    /// `true` once the position uncertainty exceeds the configured ceiling.
    pub fn is_degraded(&self) -> bool {
        self.state.position_std_meters() > self.config.degraded_position_std
    }

    fn correct(&mut self, innovation: Vec3, h: Matrix<3, 6>, variance: f64) -> bool {
        if !innovation.is_finite() || !variance.is_finite() || variance <= 0.0 {
            return false;
        }
        let p = self.state.covariance;
        let r = Matrix::<3, 3>::from_diagonal([variance; 3]);
        let Some(s_inv) = (h * p * h.transpose() + r).try_inverse() else {
            tracing::warn!("singular position innovation, hint skipped");
            return false;
        };
        let k = p * h.transpose() * s_inv;
        let dx = (k * Vector::<3>::from_column(innovation.to_array())).column();

        self.state.position = self.state.position + Vec3::new(dx[0], dx[1], dx[2]);
        self.state.velocity = self.state.velocity + Vec3::new(dx[3], dx[4], dx[5]);
        let i_kh = Matrix::<6, 6>::identity() - k * h;
        self.state.covariance = (i_kh * p * i_kh.transpose() + k * r * k.transpose()).symmetrized();
        true
    }
}
