//! Simulated drivers for running the full stack without hardware.
//!
//! Every simulated driver observes one shared [`SimScene`]: a device posed
//! inside a rectangular [`SimRoom`]. Range sensors ray-cast to the nearest
//! wall, the IMU reports gravity and the earth field in the device frame, and
//! the echo device writes a delayed, attenuated copy of the transmitted chirp
//! into its recording.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_hal::sim::{SimRegistry, SimRoom};
//! use chiroptera_types::{SensorType, Vec3};
//! use chrono::Utc;
//!
//! let sim = SimRegistry::builder()
//!     .with_room(SimRoom::from_dimensions(6.0, 8.0, 2.5, 1.2))
//!     .with_range_sensor("lidar", SensorType::Lidar)
//!     .with_seed(7);
//! let mut registry = sim.build();
//!
//! let readings = registry.sample_all(Vec3::new(1.0, 0.0, 0.0), Utc::now());
//! assert_eq!(readings.len(), 1);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use chiroptera_types::{
    AudioBuffer, ChiropteraError, DistanceMeasurement, ImuSample, Quaternion, SensorType, Vec3,
};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::registry::SensorRegistry;
use crate::sensor::{EchoDevice, ImuDevice, RangeSensor};

const SIM_GRAVITY: f64 = 9.80665;
const SIM_SPEED_OF_SOUND: f64 = 343.0;

// ─────────────────────────────────────────────────────────────────────────────
// Room and scene
// ─────────────────────────────────────────────────────────────────────────────

/// Axis-aligned box room in the world frame (+z up).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimRoom {
    pub min: Vec3,
    pub max: Vec3,
}

impl SimRoom {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// A `length × width × height` room centred on the origin in x and y,
    /// with the floor `floor_depth` metres below the origin.
    pub fn from_dimensions(length: f64, width: f64, height: f64, floor_depth: f64) -> Self {
        Self::new(
            Vec3::new(-length / 2.0, -width / 2.0, -floor_depth),
            Vec3::new(length / 2.0, width / 2.0, height - floor_depth),
        )
    }

    /// Distance from `origin` (inside the room) to the first wall along the
    /// world-frame direction `dir`.
    pub fn range(&self, origin: Vec3, dir: Vec3) -> Option<f64> {
        let dir = dir.normalized()?;
        let o = origin.to_array();
        let d = dir.to_array();
        let lo = self.min.to_array();
        let hi = self.max.to_array();
        (0..3)
            .filter(|&i| d[i].abs() > 1e-12)
            .map(|i| {
                let bound = if d[i] > 0.0 { hi[i] } else { lo[i] };
                (bound - o[i]) / d[i]
            })
            .filter(|t| *t > 0.0)
            .min_by(f64::total_cmp)
    }
}

impl Default for SimRoom {
    fn default() -> Self {
        Self::from_dimensions(6.0, 8.0, 2.5, 1.2)
    }
}

#[derive(Debug, Clone, Copy)]
struct SceneState {
    room: SimRoom,
    position: Vec3,
    orientation: Quaternion,
    /// Body-frame angular rate.
    angular_velocity: Vec3,
}

/// Ground truth shared by every simulated driver of one registry.
#[derive(Debug, Clone)]
pub struct SimScene {
    inner: Arc<Mutex<SceneState>>,
}

impl SimScene {
    pub fn new(room: SimRoom) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SceneState {
                room,
                position: Vec3::zero(),
                orientation: Quaternion::identity(),
                angular_velocity: Vec3::zero(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SceneState> {
        // A poisoned lock still holds a valid pose.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room(&self) -> SimRoom {
        self.lock().room
    }

    pub fn orientation(&self) -> Quaternion {
        self.lock().orientation
    }

    pub fn set_orientation(&self, orientation: Quaternion) {
        self.lock().orientation = orientation.normalized();
    }

    pub fn position(&self) -> Vec3 {
        self.lock().position
    }

    pub fn set_position(&self, position: Vec3) {
        self.lock().position = position;
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.lock().angular_velocity
    }

    pub fn set_angular_velocity(&self, angular_velocity: Vec3) {
        self.lock().angular_velocity = angular_velocity;
    }

    /// Rotate the device by its angular velocity for `dt` seconds.
    pub fn step(&self, dt: f64) {
        let mut s = self.lock();
        let w = s.angular_velocity;
        let dq = Quaternion::from_axis_angle(w, w.norm() * dt);
        s.orientation = s.orientation.mul(dq).normalized();
    }

    /// True range along a device-frame direction at the current pose.
    pub fn true_range(&self, device_direction: Vec3) -> Option<f64> {
        let s = self.lock();
        let world = s.orientation.rotate(device_direction);
        s.room.range(s.position, world)
    }
}

fn gaussian(rng: &mut StdRng, std: f64) -> f64 {
    if std <= 0.0 {
        return 0.0;
    }
    // Box–Muller.
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    std * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

// ─────────────────────────────────────────────────────────────────────────────
// Range sensor
// ─────────────────────────────────────────────────────────────────────────────

/// Noise model of one simulated range sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeNoise {
    pub std_meters: f64,
    pub confidence: f64,
    pub max_range_meters: f64,
    /// Probability that a reading comes back empty.
    pub dropout: f64,
}

impl RangeNoise {
    /// Typical figures per sensor family.
    pub fn for_sensor(sensor_type: SensorType) -> Self {
        let (std_meters, confidence, max_range_meters) = match sensor_type {
            SensorType::Lidar => (0.01, 0.95, 12.0),
            SensorType::TimeOfFlight => (0.02, 0.85, 4.0),
            SensorType::StereoVision => (0.05, 0.7, 8.0),
            SensorType::Sonar | SensorType::Fused => (0.03, 0.6, 10.0),
        };
        Self {
            std_meters,
            confidence,
            max_range_meters,
            dropout: 0.0,
        }
    }
}

pub struct SimRangeSensor {
    id: String,
    sensor_type: SensorType,
    noise: RangeNoise,
    scene: SimScene,
    rng: StdRng,
}

impl SimRangeSensor {
    pub fn new(id: impl Into<String>, sensor_type: SensorType, noise: RangeNoise, scene: SimScene, seed: u64) -> Self {
        Self {
            id: id.into(),
            sensor_type,
            noise,
            scene,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RangeSensor for SimRangeSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    fn measure(&mut self, direction: Vec3, timestamp: DateTime<Utc>) -> Result<DistanceMeasurement, ChiropteraError> {
        let dropped = self.noise.dropout > 0.0 && self.rng.random_bool(self.noise.dropout.clamp(0.0, 1.0));
        let distance = self
            .scene
            .true_range(direction)
            .filter(|d| !dropped && *d <= self.noise.max_range_meters)
            .map(|d| d + gaussian(&mut self.rng, self.noise.std_meters));
        match distance {
            Some(d) => Ok(DistanceMeasurement::new(
                Some(d),
                self.sensor_type,
                self.noise.confidence,
                direction,
                timestamp,
            )),
            None => Ok(DistanceMeasurement::no_reading(self.sensor_type, direction, timestamp)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IMU
// ─────────────────────────────────────────────────────────────────────────────

pub struct SimImu {
    id: String,
    scene: SimScene,
    earth_field: Vec3,
    accel_noise: f64,
    gyro_noise: f64,
    gyro_bias: Vec3,
    with_magnetometer: bool,
    rng: StdRng,
}

impl SimImu {
    pub fn new(id: impl Into<String>, scene: SimScene, seed: u64) -> Self {
        Self {
            id: id.into(),
            scene,
            earth_field: Vec3::new(0.2, 0.0, -0.45),
            accel_noise: 0.02,
            gyro_noise: 0.002,
            gyro_bias: Vec3::zero(),
            with_magnetometer: true,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_gyro_bias(mut self, bias: Vec3) -> Self {
        self.gyro_bias = bias;
        self
    }

    pub fn without_magnetometer(mut self) -> Self {
        self.with_magnetometer = false;
        self
    }

    fn jitter(&mut self, std: f64) -> Vec3 {
        Vec3::new(
            gaussian(&mut self.rng, std),
            gaussian(&mut self.rng, std),
            gaussian(&mut self.rng, std),
        )
    }
}

impl ImuDevice for SimImu {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&mut self, timestamp: DateTime<Utc>) -> Result<ImuSample, ChiropteraError> {
        let q = self.scene.orientation();
        let accelerometer = q.inverse_rotate(Vec3::new(0.0, 0.0, SIM_GRAVITY)) + self.jitter(self.accel_noise);
        let gyroscope = self.scene.angular_velocity() + self.gyro_bias + self.jitter(self.gyro_noise);
        let magnetometer = self.with_magnetometer.then(|| q.inverse_rotate(self.earth_field));
        Ok(ImuSample {
            timestamp,
            accelerometer,
            gyroscope,
            magnetometer,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Echo device
// ─────────────────────────────────────────────────────────────────────────────

pub struct SimEchoDevice {
    id: String,
    scene: SimScene,
    sample_rate_hz: u32,
    noise_amplitude: f32,
    rng: StdRng,
}

impl SimEchoDevice {
    pub fn new(id: impl Into<String>, scene: SimScene, sample_rate_hz: u32, seed: u64) -> Self {
        Self {
            id: id.into(),
            scene,
            sample_rate_hz,
            noise_amplitude: 0.01,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_noise_amplitude(mut self, amplitude: f32) -> Self {
        self.noise_amplitude = amplitude.max(0.0);
        self
    }
}

impl EchoDevice for SimEchoDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn ping(&mut self, chirp: &AudioBuffer, direction: Vec3, record_seconds: f64) -> Result<AudioBuffer, ChiropteraError> {
        if chirp.sample_rate_hz != self.sample_rate_hz {
            return Err(ChiropteraError::Sensor {
                component: self.id.clone(),
                details: format!(
                    "chirp sampled at {} Hz, device runs at {} Hz",
                    chirp.sample_rate_hz, self.sample_rate_hz
                ),
            });
        }
        let fs = f64::from(self.sample_rate_hz);
        let len = (record_seconds.max(0.0) * fs).round() as usize;
        let mut samples: Vec<f32> = (0..len)
            .map(|_| {
                if self.noise_amplitude > 0.0 {
                    self.rng.random_range(-self.noise_amplitude..=self.noise_amplitude)
                } else {
                    0.0
                }
            })
            .collect();

        if let Some(d) = self.scene.true_range(direction) {
            let lag = (2.0 * d / SIM_SPEED_OF_SOUND * fs).round() as usize;
            let gain = (1.0 / (1.0 + d)) as f32;
            for (slot, s) in samples.iter_mut().skip(lag).zip(&chirp.samples) {
                *slot += gain * s;
            }
        }

        Ok(AudioBuffer {
            samples,
            sample_rate_hz: self.sample_rate_hz,
            start_timestamp: chirp.start_timestamp,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`SensorRegistry`] populated with simulated drivers.
pub struct SimRegistry {
    scene: SimScene,
    range_sensors: Vec<(String, SensorType, RangeNoise)>,
    imus: Vec<String>,
    echo_devices: Vec<(String, u32)>,
    seed: u64,
}

impl SimRegistry {
    pub fn builder() -> Self {
        Self {
            scene: SimScene::new(SimRoom::default()),
            range_sensors: Vec::new(),
            imus: Vec::new(),
            echo_devices: Vec::new(),
            seed: 0,
        }
    }

    /// Replace the room. Call before handing out [`SimRegistry::scene`].
    pub fn with_room(mut self, room: SimRoom) -> Self {
        self.scene = SimScene::new(room);
        self
    }

    pub fn with_range_sensor(self, id: &str, sensor_type: SensorType) -> Self {
        self.with_noisy_range_sensor(id, sensor_type, RangeNoise::for_sensor(sensor_type))
    }

    pub fn with_noisy_range_sensor(mut self, id: &str, sensor_type: SensorType, noise: RangeNoise) -> Self {
        self.range_sensors.push((id.to_string(), sensor_type, noise));
        self
    }

    pub fn with_imu(mut self, id: &str) -> Self {
        self.imus.push(id.to_string());
        self
    }

    pub fn with_echo_device(mut self, id: &str, sample_rate_hz: u32) -> Self {
        self.echo_devices.push((id.to_string(), sample_rate_hz));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Handle to the shared ground truth, for steering the simulated device.
    pub fn scene(&self) -> SimScene {
        self.scene.clone()
    }

    pub fn build(self) -> SensorRegistry {
        let mut registry = SensorRegistry::new();
        let mut seed = self.seed;
        let mut next_seed = || {
            seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            seed
        };
        for (id, sensor_type, noise) in self.range_sensors {
            registry.register_range_sensor(Box::new(SimRangeSensor::new(
                id,
                sensor_type,
                noise,
                self.scene.clone(),
                next_seed(),
            )));
        }
        for id in self.imus {
            registry.register_imu(Box::new(SimImu::new(id, self.scene.clone(), next_seed())));
        }
        for (id, rate) in self.echo_devices {
            registry.register_echo_device(Box::new(SimEchoDevice::new(id, self.scene.clone(), rate, next_seed())));
        }
        registry
    }
}
