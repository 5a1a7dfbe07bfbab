//! [`SensorRegistry`] – central driver registry.
//!
//! Holds every registered [`RangeSensor`], [`ImuDevice`] and [`EchoDevice`]
//! by identifier. [`SensorRegistry::sample_all`] polls every range sensor
//! along one direction, which is how a sweep gathers same-instant fusion
//! candidates. Drivers are kept in identifier order so polling is
//! deterministic.

use std::collections::BTreeMap;

use chiroptera_types::{ChiropteraError, DistanceMeasurement, ImuSample, Vec3};
use chrono::{DateTime, Utc};

use crate::sensor::{EchoDevice, ImuDevice, RangeSensor};

#[derive(Default)]
pub struct SensorRegistry {
    range_sensors: BTreeMap<String, Box<dyn RangeSensor>>,
    imus: BTreeMap<String, Box<dyn ImuDevice>>,
    echo_devices: BTreeMap<String, Box<dyn EchoDevice>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range sensor, replacing any driver with the same `id`.
    pub fn register_range_sensor(&mut self, sensor: Box<dyn RangeSensor>) {
        tracing::debug!(id = sensor.id(), sensor = %sensor.sensor_type(), "range sensor registered");
        self.range_sensors.insert(sensor.id().to_string(), sensor);
    }

    pub fn register_imu(&mut self, imu: Box<dyn ImuDevice>) {
        self.imus.insert(imu.id().to_string(), imu);
    }

    pub fn register_echo_device(&mut self, device: Box<dyn EchoDevice>) {
        self.echo_devices.insert(device.id().to_string(), device);
    }

    pub fn range_sensor_ids(&self) -> Vec<&str> {
        self.range_sensors.keys().map(String::as_str).collect()
    }

    pub fn imu_ids(&self) -> Vec<&str> {
        self.imus.keys().map(String::as_str).collect()
    }

    pub fn echo_device_ids(&self) -> Vec<&str> {
        self.echo_devices.keys().map(String::as_str).collect()
    }

    /// Poll every range sensor along `direction`.
    ///
    /// A failing driver is logged and skipped so one faulty sensor never
    /// blocks the others.
    pub fn sample_all(&mut self, direction: Vec3, timestamp: DateTime<Utc>) -> Vec<DistanceMeasurement> {
        self.range_sensors
            .iter_mut()
            .filter_map(|(id, sensor)| match sensor.measure(direction, timestamp) {
                Ok(m) => Some(m),
                Err(err) => {
                    tracing::warn!(sensor = %id, error = %err, "range sensor failed");
                    None
                }
            })
            .collect()
    }

    /// Read one sample from the IMU registered as `id`.
    ///
    /// # Errors
    ///
    /// [`ChiropteraError::Sensor`] when no such IMU is registered or the
    /// read fails.
    pub fn read_imu(&mut self, id: &str, timestamp: DateTime<Utc>) -> Result<ImuSample, ChiropteraError> {
        match self.imus.get_mut(id) {
            Some(imu) => imu.read(timestamp),
            None => Err(not_registered("IMU", id)),
        }
    }

    /// Mutable handle to the echo device registered as `id`.
    pub fn echo_device(&mut self, id: &str) -> Result<&mut dyn EchoDevice, ChiropteraError> {
        match self.echo_devices.get_mut(id) {
            Some(device) => Ok(device.as_mut()),
            None => Err(not_registered("echo device", id)),
        }
    }
}

fn not_registered(kind: &str, id: &str) -> ChiropteraError {
    ChiropteraError::Sensor {
        component: id.to_string(),
        details: format!("{kind} '{id}' is not registered"),
    }
}
