//! Configuration file – reads/writes `~/.chiroptera/config.toml`.
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! ```toml
//! [session.correlator.acoustics]
//! temperature_compensation = true
//! air_temperature_celsius = 24.0
//!
//! [simulation]
//! room_length_m = 5.0
//! seed = 99
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chiroptera_runtime::SessionConfig;
use chiroptera_types::ChiropteraError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parameters of the simulated room used by `scan` and `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub room_length_m: f64,
    pub room_width_m: f64,
    pub room_height_m: f64,
    /// Floor distance below the device.
    pub floor_depth_m: f64,
    pub azimuth_step_deg: f64,
    pub elevation_step_deg: f64,
    pub max_elevation_deg: f64,
    /// Simulated time between two sweep directions.
    pub dwell_seconds: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            room_length_m: 6.0,
            room_width_m: 8.0,
            room_height_m: 2.5,
            floor_depth_m: 1.2,
            azimuth_step_deg: 5.0,
            elevation_step_deg: 10.0,
            max_elevation_deg: 80.0,
            dwell_seconds: 0.1,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub simulation: SimulationConfig,
}

pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".chiroptera").join("config.toml")
}

/// The effective configuration: file (or defaults) plus environment
/// overrides.
pub fn load_effective() -> Result<Config, ChiropteraError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// `None` when the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ChiropteraError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ChiropteraError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| ChiropteraError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `CHIROPTERA_*` environment overrides.
///
/// | Variable | Field |
/// |---|---|
/// | `CHIROPTERA_SPEED_OF_SOUND` | `session.correlator.acoustics.speed_of_sound_mps` |
/// | `CHIROPTERA_AIR_TEMPERATURE` | `air_temperature_celsius`, and turns temperature compensation on |
/// | `CHIROPTERA_SAMPLE_RATE` | `session.waveform.sample_rate_hz` |
/// | `CHIROPTERA_MIN_CONFIDENCE` | `session.reconstruction.min_confidence` |
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_overrides(cfg: &mut Config) {
    let acoustics = &mut cfg.session.correlator.acoustics;
    if let Some(v) = env_number::<f64>("CHIROPTERA_SPEED_OF_SOUND") {
        acoustics.speed_of_sound_mps = v;
    }
    if let Some(v) = env_number::<f64>("CHIROPTERA_AIR_TEMPERATURE") {
        acoustics.air_temperature_celsius = v;
        acoustics.temperature_compensation = true;
    }
    if let Some(v) = env_number::<u32>("CHIROPTERA_SAMPLE_RATE") {
        cfg.session.waveform.sample_rate_hz = v;
    }
    if let Some(v) = env_number::<f64>("CHIROPTERA_MIN_CONFIDENCE") {
        cfg.session.reconstruction.min_confidence = v;
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

pub fn save(cfg: &Config) -> Result<(), ChiropteraError> {
    save_to(cfg, &config_path())
}

/// Write `cfg`, creating the directory. Owner-only permissions on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ChiropteraError> {
    let io_err = |what: &str, e: std::io::Error| ChiropteraError::Config(format!("{what}: {e}"));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create config directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to restrict config directory", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ChiropteraError::Config(format!("failed to serialise config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err("failed to write config", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err("failed to write config", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_points_to_chiroptera_dir() {
        let p = config_path_for_home("/home/someone");
        assert!(p.to_string_lossy().contains(".chiroptera"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.session.correlator.min_snr_db = 9.0;
        cfg.session.fusion.angular_tolerance_deg = 3.0;
        cfg.simulation.seed = 1234;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[simulation]\nroom_length_m = 4.0\n\n[session.correlator]\nmin_correlation = 0.5\n",
        )
        .expect("write");

        let loaded = load_from(&path).expect("load").expect("some");
        assert_eq!(loaded.simulation.room_length_m, 4.0);
        assert_eq!(loaded.simulation.room_width_m, 8.0);
        assert_eq!(loaded.session.correlator.min_correlation, 0.5);
        assert_eq!(loaded.session.correlator.min_snr_db, 6.0);
        assert_eq!(loaded.session.waveform.sample_rate_hz, 44_100);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[simulation\nseed = ").expect("write");
        assert!(matches!(load_from(&path), Err(ChiropteraError::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let parent = path.parent().expect("parent");
        let dir_mode = fs::metadata(parent).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    // Each override test uses its own variable, so they can run in parallel.

    #[test]
    fn air_temperature_override_enables_compensation() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CHIROPTERA_AIR_TEMPERATURE", "30") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("CHIROPTERA_AIR_TEMPERATURE") };

        let acoustics = cfg.session.correlator.acoustics;
        assert!(acoustics.temperature_compensation);
        assert_eq!(acoustics.air_temperature_celsius, 30.0);
    }

    #[test]
    fn sample_rate_override() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CHIROPTERA_SAMPLE_RATE", "48000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("CHIROPTERA_SAMPLE_RATE") };
        assert_eq!(cfg.session.waveform.sample_rate_hz, 48_000);
    }

    #[test]
    fn unparseable_override_is_ignored() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CHIROPTERA_MIN_CONFIDENCE", "very") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("CHIROPTERA_MIN_CONFIDENCE") };
        assert_eq!(cfg.session.reconstruction.min_confidence, 0.3);
    }

    #[test]
    fn speed_of_sound_override() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CHIROPTERA_SPEED_OF_SOUND", "340.5") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("CHIROPTERA_SPEED_OF_SOUND") };
        assert_eq!(cfg.session.correlator.acoustics.speed_of_sound_mps, 340.5);
    }
}
