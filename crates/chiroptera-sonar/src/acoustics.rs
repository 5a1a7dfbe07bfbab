//! Speed of sound and round-trip conversions.
//!
//! The echo travels to the target and back, so a delay `τ` corresponds to a
//! one-way distance of `τ · c / 2`.

use serde::{Deserialize, Serialize};

/// Speed of sound used when temperature compensation is off (m/s).
pub const DEFAULT_SPEED_OF_SOUND: f64 = 343.0;

/// Speed of sound in dry air at 0 °C (m/s).
const SPEED_AT_ZERO_CELSIUS: f64 = 331.3;
const ZERO_CELSIUS_IN_KELVIN: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticConfig {
    /// Fixed propagation speed (m/s), used unless compensation is enabled.
    pub speed_of_sound_mps: f64,
    /// Derive the speed from `air_temperature_celsius` instead.
    pub temperature_compensation: bool,
    pub air_temperature_celsius: f64,
}

impl Default for AcousticConfig {
    fn default() -> Self {
        Self {
            speed_of_sound_mps: DEFAULT_SPEED_OF_SOUND,
            temperature_compensation: false,
            air_temperature_celsius: 20.0,
        }
    }
}

impl AcousticConfig {
    /// Effective propagation speed in m/s.
    pub fn speed_of_sound(&self) -> f64 {
        if self.temperature_compensation {
            speed_of_sound_at(self.air_temperature_celsius)
        } else {
            self.speed_of_sound_mps
        }
    }

    pub fn distance_from_delay(&self, delay_seconds: f64) -> f64 {
        distance_from_delay(delay_seconds, self.speed_of_sound())
    }

    pub fn delay_from_distance(&self, distance_meters: f64) -> f64 {
        delay_from_distance(distance_meters, self.speed_of_sound())
    }
}

/// Speed of sound in dry air at `celsius`.
pub fn speed_of_sound_at(celsius: f64) -> f64 {
    SPEED_AT_ZERO_CELSIUS * (1.0 + celsius / ZERO_CELSIUS_IN_KELVIN).max(0.0).sqrt()
}

/// One-way distance for a round-trip `delay_seconds`.
pub fn distance_from_delay(delay_seconds: f64, speed_of_sound: f64) -> f64 {
    delay_seconds * speed_of_sound / 2.0
}

/// Round-trip delay for a target at `distance_meters`.
pub fn delay_from_distance(distance_meters: f64, speed_of_sound: f64) -> f64 {
    2.0 * distance_meters / speed_of_sound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_formula_for_short_delays() {
        let cfg = AcousticConfig::default();
        assert!(!cfg.temperature_compensation);
        for delay in [0.001, 0.01, 0.1, 0.5] {
            let expected = delay * 343.0 / 2.0;
            assert!((cfg.distance_from_delay(delay) - expected).abs() < 1e-12, "delay {delay}");
            assert!((distance_from_delay(delay, 343.0) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn delay_is_the_inverse_of_distance() {
        let cfg = AcousticConfig::default();
        for d in [0.001, 0.01, 0.1, 0.5] {
            let delay = cfg.delay_from_distance(d);
            assert!((delay - 2.0 * d / 343.0).abs() < 1e-15);
            assert!((cfg.distance_from_delay(delay) - d).abs() < 1e-12);
        }
    }

    #[test]
    fn compensation_disabled_by_default() {
        let cfg = AcousticConfig {
            air_temperature_celsius: -30.0,
            ..Default::default()
        };
        assert_eq!(cfg.speed_of_sound(), DEFAULT_SPEED_OF_SOUND);
    }

    #[test]
    fn temperature_compensation() {
        assert!((speed_of_sound_at(0.0) - 331.3).abs() < 1e-9);
        assert!((speed_of_sound_at(20.0) - 343.2).abs() < 0.1);

        let cfg = AcousticConfig {
            temperature_compensation: true,
            air_temperature_celsius: 35.0,
            ..Default::default()
        };
        assert!(cfg.speed_of_sound() > 350.0);
    }
}
