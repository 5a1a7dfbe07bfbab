//! Multi-sensor distance fusion.
//!
//! [`MultiSensorDistanceFuser`] collapses same-instant range readings from
//! heterogeneous sensors into one [`SensorType::Fused`] measurement.
//!
//! 1. Each candidate with a distance gets `weight = confidence × prior`,
//!    with the prior taken from the [`FusionWeightPolicy`].
//! 2. The **anchor** is the candidate with the largest weight (ties broken by
//!    sensor rank, then distance, timestamp and direction, so the choice
//!    never depends on input order).
//! 3. Candidates pointing more than `angular_tolerance_deg` away from the
//!    anchor, or further than `temporal_tolerance_seconds` from it in time,
//!    are dropped.
//! 4. Survivors are summed in canonical order:
//!    ```text
//!    d      = Σ wᵢ·dᵢ / Σ wᵢ
//!    spread = sqrt(Σ wᵢ·(dᵢ − d)² / Σ wᵢ)
//!    conf   = (Σ wᵢ / Σ priorᵢ) / (1 + (spread / spread_scale)²)
//!    ```
//!    `conf` is a prior-weighted mean of the survivors' confidences, lowered
//!    when they disagree, and finally capped at `min(1, max confᵢ + ε)`.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_perception::fusion::{FusionConfig, MultiSensorDistanceFuser};
//! use chiroptera_types::{DistanceMeasurement, Quaternion, SensorType, Vec3};
//!
//! let now = chrono::Utc::now();
//! let ahead = Vec3::new(1.0, 0.0, 0.0);
//! let lidar = DistanceMeasurement::new(Some(2.00), SensorType::Lidar, 0.9, ahead, now);
//! let sonar = DistanceMeasurement::new(Some(2.10), SensorType::Sonar, 0.6, ahead, now);
//!
//! let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
//! let fused = fuser.fuse(&[lidar, sonar], Some(Quaternion::identity()));
//!
//! let d = fused.distance_meters.unwrap();
//! assert!(d > 2.0 && d < 2.05);
//! assert!(fused.confidence <= 0.9);
//! assert_eq!(fused.sensor_type, SensorType::Fused);
//! ```

use std::cmp::Ordering;

use chiroptera_types::{
    ChiropteraError, DistanceMeasurement, Quaternion, SensorType, Vec3, elapsed_seconds,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// FusionWeightPolicy
// ────────────────────────────────────────────────────────────────────────────

/// Per-sensor prior trust. Changed only through [`recalibrate`][Self::recalibrate].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeightPolicy {
    lidar: f64,
    time_of_flight: f64,
    stereo_vision: f64,
    sonar: f64,
}

impl Default for FusionWeightPolicy {
    fn default() -> Self {
        Self {
            lidar: 1.0,
            time_of_flight: 0.8,
            stereo_vision: 0.6,
            sonar: 0.4,
        }
    }
}

impl FusionWeightPolicy {
    /// Prior for `sensor`. Already-fused readings are never re-fused and
    /// carry a prior of zero.
    pub fn prior(&self, sensor: SensorType) -> f64 {
        match sensor {
            SensorType::Lidar => self.lidar,
            SensorType::TimeOfFlight => self.time_of_flight,
            SensorType::StereoVision => self.stereo_vision,
            SensorType::Sonar => self.sonar,
            SensorType::Fused => 0.0,
        }
    }

    /// Replace the prior for one sensor type.
    pub fn recalibrate(&mut self, sensor: SensorType, prior: f64) -> Result<(), ChiropteraError> {
        if !prior.is_finite() || prior < 0.0 {
            return Err(ChiropteraError::Config(format!(
                "prior for {sensor} must be a non-negative number, got {prior}"
            )));
        }
        let slot = match sensor {
            SensorType::Lidar => &mut self.lidar,
            SensorType::TimeOfFlight => &mut self.time_of_flight,
            SensorType::StereoVision => &mut self.stereo_vision,
            SensorType::Sonar => &mut self.sonar,
            SensorType::Fused => {
                return Err(ChiropteraError::Config(
                    "fused readings have no recalibratable prior".into(),
                ));
            }
        };
        tracing::info!(sensor = %sensor, old = *slot, new = prior, "fusion prior recalibrated");
        *slot = prior;
        Ok(())
    }
}

/// Fixed tie-break rank, highest first.
fn sensor_rank(sensor: SensorType) -> u8 {
    match sensor {
        SensorType::Lidar => 4,
        SensorType::TimeOfFlight => 3,
        SensorType::StereoVision => 2,
        SensorType::Sonar => 1,
        SensorType::Fused => 0,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MultiSensorDistanceFuser
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub angular_tolerance_deg: f64,
    pub temporal_tolerance_seconds: f64,
    /// Weighted spread (m) at which fused confidence is halved.
    pub spread_scale_meters: f64,
    pub confidence_epsilon: f64,
    pub priors: FusionWeightPolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            angular_tolerance_deg: 5.0,
            temporal_tolerance_seconds: 0.050,
            spread_scale_meters: 0.10,
            confidence_epsilon: 1e-9,
            priors: FusionWeightPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Weighted {
    m: DistanceMeasurement,
    distance: f64,
    weight: f64,
    prior: f64,
}

#[derive(Debug, Clone)]
pub struct MultiSensorDistanceFuser {
    config: FusionConfig,
}

impl MultiSensorDistanceFuser {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn policy(&self) -> &FusionWeightPolicy {
        &self.config.priors
    }

    pub fn recalibrate(&mut self, sensor: SensorType, prior: f64) -> Result<(), ChiropteraError> {
        self.config.priors.recalibrate(sensor, prior)
    }

    /// Fuse `candidates` into one reading annotated with `pose`.
    ///
    /// With no usable candidate the result has no distance and zero
    /// confidence. The output is independent of the order of `candidates`.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn fuse(
        &self,
        candidates: &[DistanceMeasurement],
        pose: Option<Quaternion>,
    ) -> DistanceMeasurement {
        let mut usable: Vec<Weighted> = candidates
            .iter()
            .filter_map(|m| {
                let distance = m.distance_meters?;
                let prior = self.config.priors.prior(m.sensor_type);
                let weight = m.confidence * prior;
                (weight > 0.0 && weight.is_finite()).then_some(Weighted {
                    m: *m,
                    distance,
                    weight,
                    prior,
                })
            })
            .collect();
        usable.sort_by(canonical_cmp);

        let Some(anchor) = usable.first().copied() else {
            return self.empty(candidates, pose);
        };

        let max_angle = self.config.angular_tolerance_deg.to_radians();
        let max_dt = self.config.temporal_tolerance_seconds;
        let survivors: Vec<Weighted> = usable
            .into_iter()
            .filter(|c| {
                c.m.direction.angle_to(anchor.m.direction) <= max_angle
                    && elapsed_seconds(anchor.m.timestamp, c.m.timestamp).abs() <= max_dt
            })
            .collect();

        let total_weight: f64 = survivors.iter().map(|c| c.weight).sum();
        let total_prior: f64 = survivors.iter().map(|c| c.prior).sum();
        let distance = survivors.iter().map(|c| c.weight * c.distance).sum::<f64>() / total_weight;
        let spread = (survivors
            .iter()
            .map(|c| c.weight * (c.distance - distance).powi(2))
            .sum::<f64>()
            / total_weight)
            .sqrt();
        let max_conf = survivors.iter().fold(0.0_f64, |m, c| m.max(c.m.confidence));

        let consistency = 1.0 / (1.0 + (spread / self.config.spread_scale_meters).powi(2));
        let confidence = ((total_weight / total_prior) * consistency)
            .min(max_conf + self.config.confidence_epsilon)
            .min(1.0);

        let direction = survivors
            .iter()
            .fold(Vec3::zero(), |acc, c| acc + c.m.direction * c.weight)
            .normalized()
            .unwrap_or(anchor.m.direction);
        let timestamp = survivors
            .iter()
            .map(|c| c.m.timestamp)
            .max()
            .unwrap_or(anchor.m.timestamp);

        tracing::debug!(
            distance,
            confidence,
            spread,
            survivors = survivors.len(),
            anchor = %anchor.m.sensor_type,
            "fused distance"
        );

        let fused = DistanceMeasurement::new(
            Some(distance),
            SensorType::Fused,
            confidence,
            direction,
            timestamp,
        );
        match pose {
            Some(q) => fused.with_pose(q),
            None => fused,
        }
    }

    /// Split readings gathered over a fusion tick into same-instant groups.
    ///
    /// Readings are visited oldest first; each joins the first group whose
    /// seed lies within both tolerances, otherwise it seeds a new group.
    pub fn coalesce(&self, readings: &[DistanceMeasurement]) -> Vec<Vec<DistanceMeasurement>> {
        let mut ordered = readings.to_vec();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| cmp_vec(a.direction, b.direction))
                .then_with(|| a.sensor_type.cmp(&b.sensor_type))
        });

        let max_angle = self.config.angular_tolerance_deg.to_radians();
        let max_dt = self.config.temporal_tolerance_seconds;
        let mut groups: Vec<Vec<DistanceMeasurement>> = Vec::new();
        for m in ordered {
            let slot = groups.iter_mut().find(|g| {
                let seed = &g[0];
                seed.direction.angle_to(m.direction) <= max_angle
                    && elapsed_seconds(seed.timestamp, m.timestamp).abs() <= max_dt
            });
            match slot {
                Some(g) => g.push(m),
                None => groups.push(vec![m]),
            }
        }
        groups
    }

    fn empty(&self, candidates: &[DistanceMeasurement], pose: Option<Quaternion>) -> DistanceMeasurement {
        let timestamp = candidates
            .iter()
            .map(|m| m.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        let direction = candidates
            .iter()
            .map(|m| m.direction)
            .min_by(|a, b| cmp_vec(*a, *b))
            .unwrap_or(Vec3::new(1.0, 0.0, 0.0));
        let out = DistanceMeasurement::no_reading(SensorType::Fused, direction, timestamp);
        match pose {
            Some(q) => out.with_pose(q),
            None => out,
        }
    }
}

/// Strongest candidate first; a total order over every field that
/// influences the output.
fn canonical_cmp(a: &Weighted, b: &Weighted) -> Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| sensor_rank(b.m.sensor_type).cmp(&sensor_rank(a.m.sensor_type)))
        .then_with(|| a.distance.total_cmp(&b.distance))
        .then_with(|| a.m.timestamp.cmp(&b.m.timestamp))
        .then_with(|| cmp_vec(a.m.direction, b.m.direction))
        .then_with(|| a.m.confidence.total_cmp(&b.m.confidence))
}

fn cmp_vec(a: Vec3, b: Vec3) -> Ordering {
    a.x.total_cmp(&b.x)
        .then_with(|| a.y.total_cmp(&b.y))
        .then_with(|| a.z.total_cmp(&b.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chiroptera_types::offset_by_seconds;
    use chrono::{DateTime, Utc};

    fn reading(d: f64, sensor: SensorType, conf: f64, dir: Vec3, t: DateTime<Utc>) -> DistanceMeasurement {
        DistanceMeasurement::new(Some(d), sensor, conf, dir, t)
    }

    fn ahead() -> Vec3 {
        Vec3::new(1.0, 0.0, 0.0)
    }

    fn sample_set(t: DateTime<Utc>) -> Vec<DistanceMeasurement> {
        vec![
            reading(2.02, SensorType::Lidar, 0.9, ahead(), t),
            reading(1.97, SensorType::TimeOfFlight, 0.7, Vec3::new(1.0, 0.02, 0.0), t),
            reading(2.10, SensorType::StereoVision, 0.5, ahead(), offset_by_seconds(t, 0.01)),
            reading(2.05, SensorType::Sonar, 0.8, Vec3::new(1.0, 0.0, 0.03), offset_by_seconds(t, -0.02)),
        ]
    }

    #[test]
    fn no_candidates_gives_no_reading() {
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let out = fuser.fuse(&[], None);
        assert!(out.distance_meters.is_none());
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.sensor_type, SensorType::Fused);
    }

    #[test]
    fn readings_without_distance_are_ignored() {
        let t = Utc::now();
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let out = fuser.fuse(&[DistanceMeasurement::no_reading(SensorType::Lidar, ahead(), t)], None);
        assert!(out.distance_meters.is_none());
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.timestamp, t);
    }

    #[test]
    fn result_is_bounded_by_candidates() {
        let t = Utc::now();
        let set = sample_set(t);
        let out = MultiSensorDistanceFuser::new(FusionConfig::default()).fuse(&set, None);
        let d = out.distance_meters.unwrap();
        assert!((1.97..=2.10).contains(&d));
        assert!(out.confidence <= 0.9 + 1e-9);
        assert!(out.confidence > 0.0);
    }

    #[test]
    fn permutation_does_not_change_output() {
        let t = Utc::now();
        let set = sample_set(t);
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let pose = Some(Quaternion::from_euler(0.0, 0.1, 0.5));
        let reference = fuser.fuse(&set, pose);

        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1], [3, 0, 2, 1]];
        for order in orders {
            let permuted: Vec<_> = order.iter().map(|&i| set[i]).collect();
            assert_eq!(fuser.fuse(&permuted, pose), reference, "order {order:?}");
        }
    }

    #[test]
    fn random_sets_stay_bounded_and_order_independent() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};

        const SENSORS: [SensorType; 4] = [
            SensorType::Lidar,
            SensorType::TimeOfFlight,
            SensorType::StereoVision,
            SensorType::Sonar,
        ];
        let mut rng = StdRng::seed_from_u64(0xf05e);
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let t = Utc::now();

        for round in 0..5000 {
            let n = rng.random_range(1..=6);
            // Jitter stays inside the angular and temporal tolerances, so every
            // candidate survives anchoring.
            let mut set: Vec<_> = (0..n)
                .map(|_| {
                    let dir = Vec3::new(
                        1.0,
                        rng.random_range(-0.02..=0.02),
                        rng.random_range(-0.02..=0.02),
                    );
                    reading(
                        rng.random_range(0.2..8.0),
                        SENSORS[rng.random_range(0..SENSORS.len())],
                        rng.random_range(0.05..=1.0),
                        dir,
                        offset_by_seconds(t, rng.random_range(-0.02..=0.02)),
                    )
                })
                .collect();
            let pose = rng.random_bool(0.5).then(|| Quaternion::from_euler(0.0, 0.0, 0.3));

            let out = fuser.fuse(&set, pose);
            let d = out.distance_meters.expect("every candidate carries a distance");
            let lo = set.iter().filter_map(|m| m.distance_meters).fold(f64::INFINITY, f64::min);
            let hi = set.iter().filter_map(|m| m.distance_meters).fold(f64::NEG_INFINITY, f64::max);
            let max_conf = set.iter().map(|m| m.confidence).fold(0.0, f64::max);
            assert!(d >= lo - 1e-9 && d <= hi + 1e-9, "round {round}: {d} outside [{lo}, {hi}]");
            assert!(out.confidence <= max_conf + 1e-9, "round {round}: confidence {}", out.confidence);
            assert!(out.confidence <= 1.0);

            set.shuffle(&mut rng);
            assert_eq!(fuser.fuse(&set, pose), out, "round {round}: order changed the result");
        }
    }

    #[test]
    fn off_axis_and_stale_candidates_are_excluded() {
        let t = Utc::now();
        let set = vec![
            reading(3.0, SensorType::Lidar, 0.9, ahead(), t),
            // 10° off the anchor.
            reading(1.0, SensorType::TimeOfFlight, 0.9, Vec3::from_spherical(10f64.to_radians(), 0.0), t),
            // 80 ms later.
            reading(1.0, SensorType::StereoVision, 0.9, ahead(), offset_by_seconds(t, 0.08)),
        ];
        let out = MultiSensorDistanceFuser::new(FusionConfig::default()).fuse(&set, None);
        assert_eq!(out.distance_meters, Some(3.0));
        assert!((out.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn disagreement_lowers_confidence() {
        let t = Utc::now();
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let agree = fuser.fuse(
            &[
                reading(2.0, SensorType::Lidar, 0.8, ahead(), t),
                reading(2.0, SensorType::TimeOfFlight, 0.8, ahead(), t),
            ],
            None,
        );
        let disagree = fuser.fuse(
            &[
                reading(2.0, SensorType::Lidar, 0.8, ahead(), t),
                reading(2.6, SensorType::TimeOfFlight, 0.8, ahead(), t),
            ],
            None,
        );
        assert!((agree.confidence - 0.8).abs() < 1e-9);
        assert!(disagree.confidence < 0.5 * agree.confidence);
    }

    #[test]
    fn higher_prior_dominates_the_mean() {
        let t = Utc::now();
        let out = MultiSensorDistanceFuser::new(FusionConfig::default()).fuse(
            &[
                reading(1.0, SensorType::Lidar, 0.8, ahead(), t),
                reading(1.1, SensorType::Sonar, 0.8, ahead(), t),
            ],
            None,
        );
        let d = out.distance_meters.unwrap();
        assert!((d - (1.0 * 1.0 + 1.1 * 0.4) / 1.4).abs() < 1e-12);
    }

    #[test]
    fn pose_is_attached() {
        let t = Utc::now();
        let q = Quaternion::from_euler(0.1, 0.2, 0.3);
        let out = MultiSensorDistanceFuser::new(FusionConfig::default())
            .fuse(&[reading(1.0, SensorType::Lidar, 0.5, ahead(), t)], Some(q));
        assert_eq!(out.pose, Some(q));
    }

    #[test]
    fn recalibration_changes_priors_and_validates() {
        let mut fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        fuser.recalibrate(SensorType::Sonar, 0.9).unwrap();
        assert_eq!(fuser.policy().prior(SensorType::Sonar), 0.9);
        assert!(fuser.recalibrate(SensorType::Lidar, -1.0).is_err());
        assert!(fuser.recalibrate(SensorType::Fused, 1.0).is_err());
        assert_eq!(fuser.policy().prior(SensorType::Lidar), 1.0);
    }

    #[test]
    fn coalesce_groups_by_direction_and_time() {
        let t = Utc::now();
        let left = Vec3::new(0.0, 1.0, 0.0);
        let readings = vec![
            reading(2.0, SensorType::Lidar, 0.9, ahead(), t),
            reading(3.0, SensorType::Lidar, 0.9, left, t),
            reading(2.1, SensorType::Sonar, 0.6, ahead(), offset_by_seconds(t, 0.01)),
            reading(2.0, SensorType::Lidar, 0.9, ahead(), offset_by_seconds(t, 0.5)),
        ];
        let fuser = MultiSensorDistanceFuser::new(FusionConfig::default());
        let groups = fuser.coalesce(&readings);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 4);
        assert!(groups.iter().any(|g| g.len() == 2 && g.iter().all(|m| m.direction == ahead())));

        let mut reversed = readings.clone();
        reversed.reverse();
        assert_eq!(fuser.coalesce(&reversed), groups);
    }
}
