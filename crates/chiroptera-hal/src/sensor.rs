//! Driver traits for ranging, inertial and acoustic hardware.
//!
//! Every driver carries a stable string identifier so the
//! [`SensorRegistry`][crate::registry::SensorRegistry] can address it.

use chiroptera_types::{AudioBuffer, ChiropteraError, DistanceMeasurement, ImuSample, SensorType, Vec3};
use chrono::{DateTime, Utc};

/// A directional depth sensor (LiDAR, time-of-flight, stereo depth, …).
pub trait RangeSensor: Send + Sync {
    /// Stable identifier, e.g. `"tof_front"`.
    fn id(&self) -> &str;

    fn sensor_type(&self) -> SensorType;

    /// Measure along `direction` (device frame) at `timestamp`.
    ///
    /// A sensor that sees nothing returns a reading without a distance; an
    /// `Err` means the driver itself failed.
    ///
    /// # Errors
    ///
    /// [`ChiropteraError::Sensor`] when the hardware cannot be read.
    fn measure(
        &mut self,
        direction: Vec3,
        timestamp: DateTime<Utc>,
    ) -> Result<DistanceMeasurement, ChiropteraError>;
}

/// Accelerometer + gyroscope, optionally with a magnetometer.
pub trait ImuDevice: Send + Sync {
    fn id(&self) -> &str;

    /// Read one sample stamped `timestamp`.
    fn read(&mut self, timestamp: DateTime<Utc>) -> Result<ImuSample, ChiropteraError>;
}

/// Speaker + microphone pair used for sonar pings.
pub trait EchoDevice: Send + Sync {
    fn id(&self) -> &str;

    fn sample_rate_hz(&self) -> u32;

    /// Play `chirp` towards `direction` and return `record_seconds` of
    /// capture starting at the emission instant.
    fn ping(
        &mut self,
        chirp: &AudioBuffer,
        direction: Vec3,
        record_seconds: f64,
    ) -> Result<AudioBuffer, ChiropteraError>;
}
