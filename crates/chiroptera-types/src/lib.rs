pub mod geometry;
pub mod linalg;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use geometry::{Quaternion, Vec3};
pub use linalg::Matrix;

// ────────────────────────────────────────────────────────────────────────────
// Acoustic ranging
// ────────────────────────────────────────────────────────────────────────────

/// Parameters of one linear frequency-modulated ping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChirpWaveform {
    pub start_frequency_hz: f64,
    pub end_frequency_hz: f64,
    pub duration_seconds: f64,
    pub sample_rate_hz: u32,
    /// Peak amplitude relative to full scale, `0.0..=1.0`.
    pub amplitude_scale: f64,
}

impl Default for ChirpWaveform {
    fn default() -> Self {
        Self {
            start_frequency_hz: 18_000.0,
            end_frequency_hz: 21_000.0,
            duration_seconds: 0.010,
            sample_rate_hz: 44_100,
            amplitude_scale: 0.8,
        }
    }
}

impl ChirpWaveform {
    /// Number of samples the chirp occupies at its sample rate.
    pub fn sample_count(&self) -> usize {
        (self.duration_seconds * f64::from(self.sample_rate_hz)).round() as usize
    }
}

/// Mono PCM capture, nominal full scale ±1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
    pub start_timestamp: DateTime<Utc>,
}

impl AudioBuffer {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate_hz)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoStatus {
    Detected,
    NoEchoDetected,
}

/// Outcome of correlating one recording against its transmitted chirp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EchoDetectionResult {
    /// Round-trip delay; `0.0` when no usable echo was found.
    pub delay_seconds: f64,
    pub peak_correlation_magnitude: f64,
    pub signal_to_noise_ratio_db: f64,
    pub sidelobe_floor: f64,
    pub confidence: f64,
    pub status: EchoStatus,
}

impl EchoDetectionResult {
    pub fn no_echo(peak: f64, snr_db: f64, sidelobe_floor: f64) -> Self {
        Self {
            delay_seconds: 0.0,
            peak_correlation_magnitude: peak,
            signal_to_noise_ratio_db: snr_db,
            sidelobe_floor,
            confidence: 0.0,
            status: EchoStatus::NoEchoDetected,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.status == EchoStatus::Detected
    }
}

/// One recording window handed to the processing task after a ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingCapture {
    pub recorded: AudioBuffer,
    /// Beam direction in the device frame.
    pub direction: Vec3,
}

// ────────────────────────────────────────────────────────────────────────────
// Distance measurements
// ────────────────────────────────────────────────────────────────────────────

/// Closed set of ranging sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Lidar,
    TimeOfFlight,
    Sonar,
    StereoVision,
    Fused,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Lidar => "lidar",
            SensorType::TimeOfFlight => "time_of_flight",
            SensorType::Sonar => "sonar",
            SensorType::StereoVision => "stereo_vision",
            SensorType::Fused => "fused",
        }
    }
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single directional range reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceMeasurement {
    /// Strictly positive when present.
    pub distance_meters: Option<f64>,
    pub sensor_type: SensorType,
    pub confidence: f64,
    /// Unit vector in the device frame.
    pub direction: Vec3,
    pub timestamp: DateTime<Utc>,
    /// Device orientation at `timestamp`, attached by the fuser.
    pub pose: Option<Quaternion>,
}

impl DistanceMeasurement {
    /// Build a reading, normalising `direction` and clamping `confidence`.
    ///
    /// Non-positive or non-finite distances are treated as "no reading".
    /// A zero-length direction falls back to the device +x axis.
    pub fn new(
        distance_meters: Option<f64>,
        sensor_type: SensorType,
        confidence: f64,
        direction: Vec3,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let distance_meters = distance_meters.filter(|d| d.is_finite() && *d > 0.0);
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            distance_meters,
            sensor_type,
            confidence,
            direction: direction.normalized().unwrap_or(Vec3::new(1.0, 0.0, 0.0)),
            timestamp,
            pose: None,
        }
    }

    pub fn no_reading(sensor_type: SensorType, direction: Vec3, timestamp: DateTime<Utc>) -> Self {
        Self::new(None, sensor_type, 0.0, direction, timestamp)
    }

    pub fn with_pose(mut self, pose: Quaternion) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn has_distance(&self) -> bool {
        self.distance_meters.is_some()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inertial state
// ────────────────────────────────────────────────────────────────────────────

/// One IMU event. All vectors are in the device frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: DateTime<Utc>,
    /// Specific force in m/s².
    pub accelerometer: Vec3,
    /// Angular rate in rad/s.
    pub gyroscope: Vec3,
    /// Magnetic field, any consistent unit. Absent on IMUs without one.
    pub magnetometer: Option<Vec3>,
}

/// Orientation estimate: attitude quaternion plus gyroscope bias.
///
/// Covariance ordering is `[qw, qx, qy, qz, bx, by, bz]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationState {
    pub orientation: Quaternion,
    pub gyro_bias: Vec3,
    pub covariance: Matrix<7, 7>,
    pub timestamp: DateTime<Utc>,
}

impl OrientationState {
    /// Roll, pitch and yaw in radians.
    pub fn euler(&self) -> (f64, f64, f64) {
        self.orientation.to_euler()
    }
}

/// Dead-reckoned translation. Ordering `[px, py, pz, vx, vy, vz]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub covariance: Matrix<6, 6>,
    pub timestamp: DateTime<Utc>,
}

impl PositionState {
    /// Largest per-axis position standard deviation in metres.
    pub fn position_std_meters(&self) -> f64 {
        self.covariance.diagonal()[..3]
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.max(0.0).sqrt()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Room scans
// ────────────────────────────────────────────────────────────────────────────

/// Commands accepted by a ranging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSignal {
    StartPing,
    StopPing,
    StartSweep,
    SweepComplete,
    StopSweep,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    #[default]
    Idle,
    Sweeping,
    Reconstructing,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Wall,
    Floor,
    Ceiling,
    Slanted,
}

/// Plane `normal · x + offset = 0` with `normal` pointing back at the scan
/// origin, so `offset` is the perpendicular distance from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallPlane {
    pub normal: Vec3,
    pub offset: f64,
    pub support: usize,
    pub kind: SurfaceKind,
}

impl WallPlane {
    pub fn signed_distance(&self, p: Vec3) -> f64 {
        self.normal.dot(p) + self.offset
    }
}

/// Finalised reconstruction of one sweep. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomModel {
    pub scan_id: Uuid,
    pub walls: Vec<WallPlane>,
    pub corners: Vec<Vec3>,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub area: f64,
    pub volume: f64,
    pub point_count: usize,
    pub finalized_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the ranging event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "chiroptera-runtime::session"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    FusedDistance(DistanceMeasurement),
    Echo {
        result: EchoDetectionResult,
        distance_meters: Option<f64>,
    },
    Orientation(OrientationState),
    Position(PositionState),
    ScanPhaseChanged {
        scan_id: Option<Uuid>,
        phase: ScanPhase,
    },
    RoomFinalized(RoomModel),
    Fault {
        component: String,
        message: String,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every Chiroptera crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChiropteraError {
    #[error("Invalid waveform configuration: {0}")]
    InvalidWaveformConfig(String),

    #[error("Recording too short: {recorded} samples, chirp needs {required}")]
    InsufficientRecording { recorded: usize, required: usize },

    #[error("Sample rate mismatch: recorded {recorded} Hz, transmitted {transmitted} Hz")]
    SampleRateMismatch { recorded: u32, transmitted: u32 },

    #[error("Insufficient geometry: {0}")]
    InsufficientGeometry(String),

    #[error("Invalid scan state: expected {expected:?}, found {found:?}")]
    InvalidScanState { expected: ScanPhase, found: ScanPhase },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sensor fault on {component}: {details}")]
    Sensor { component: String, details: String },
}

impl ChiropteraError {
    /// `true` when a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChiropteraError::InsufficientRecording { .. }
                | ChiropteraError::InsufficientGeometry(_)
                | ChiropteraError::Sensor { .. }
        )
    }
}

/// Signed seconds from `from` to `to`.
pub fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let d = to - from;
    match d.num_nanoseconds() {
        Some(ns) => ns as f64 * 1e-9,
        None => d.num_milliseconds() as f64 * 1e-3,
    }
}

/// `t` shifted by a (possibly fractional) number of seconds.
pub fn offset_by_seconds(t: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    t + chrono::Duration::nanoseconds((seconds * 1e9).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_waveform_sample_count() {
        let w = ChirpWaveform::default();
        assert_eq!(w.sample_count(), 441);
    }

    #[test]
    fn measurement_normalises_inputs() {
        let now = Utc::now();
        let m = DistanceMeasurement::new(
            Some(2.0),
            SensorType::Lidar,
            1.7,
            Vec3::new(0.0, 3.0, 0.0),
            now,
        );
        assert_eq!(m.confidence, 1.0);
        assert!((m.direction.norm() - 1.0).abs() < 1e-12);
        assert!(m.pose.is_none());

        let bad = DistanceMeasurement::new(Some(-1.0), SensorType::Sonar, 0.5, Vec3::zero(), now);
        assert!(bad.distance_meters.is_none());
        assert_eq!(bad.direction, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn sensor_type_serialises_snake_case() {
        let json = serde_json::to_string(&SensorType::TimeOfFlight).unwrap();
        assert_eq!(json, "\"time_of_flight\"");
        assert_eq!(SensorType::StereoVision.to_string(), "stereo_vision");
    }

    #[test]
    fn event_roundtrip() {
        let m = DistanceMeasurement::new(
            Some(1.25),
            SensorType::Fused,
            0.9,
            Vec3::new(1.0, 0.0, 0.0),
            Utc::now(),
        )
        .with_pose(Quaternion::identity());
        let event = Event::new("chiroptera-runtime::session", EventPayload::FusedDistance(m));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        match back.payload {
            EventPayload::FusedDistance(b) => assert_eq!(b.distance_meters, Some(1.25)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn error_display_and_retryability() {
        let err = ChiropteraError::InsufficientRecording {
            recorded: 10,
            required: 441,
        };
        assert!(err.to_string().contains("441"));
        assert!(err.is_retryable());
        assert!(!ChiropteraError::InvalidWaveformConfig("x".into()).is_retryable());
    }

    #[test]
    fn elapsed_seconds_is_signed() {
        let t0 = Utc::now();
        let t1 = offset_by_seconds(t0, 0.25);
        assert!((elapsed_seconds(t0, t1) - 0.25).abs() < 1e-9);
        assert!((elapsed_seconds(t1, t0) + 0.25).abs() < 1e-9);
    }

    #[test]
    fn wall_plane_distance() {
        let wall = WallPlane {
            normal: Vec3::new(-1.0, 0.0, 0.0),
            offset: 3.0,
            support: 100,
            kind: SurfaceKind::Wall,
        };
        assert!(wall.signed_distance(Vec3::new(3.0, 1.0, 0.0)).abs() < 1e-12);
        assert!((wall.signed_distance(Vec3::zero()) - 3.0).abs() < 1e-12);
    }
}
