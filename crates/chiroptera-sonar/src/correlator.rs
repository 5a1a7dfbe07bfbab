//! Echo detection by normalised cross-correlation.
//!
//! For every lag `L` at which the transmitted chirp `t` fits inside the
//! recording `r`:
//!
//! ```text
//! c(L) = Σ r[L+i]·t[i] / (‖t‖ · ‖r[L..L+N]‖)
//! ```
//!
//! The recording window energy is taken from a prefix sum, so the scan is a
//! single `O(R·N)` pass. `|c| ≤ 1` and reaches 1 only for a scaled copy of
//! the chirp.
//!
//! Scoring of the best lag:
//!
//! - **sidelobe floor** – RMS of `|c|` over lags more than one chirp length
//!   away from the peak.
//! - **SNR** – mean energy of the chirp-length window at the peak versus the
//!   mean energy of every other unblanked sample, in dB (capped at ±120).
//! - **confidence** – `peak_quality · snr_quality` where
//!   `peak_quality = (peak − floor) / (1 − floor)` and
//!   `snr_quality = snr_db / 30`, both clamped to `[0, 1]`.
//!
//! The echo is accepted only when the peak reaches `min_correlation` and the
//! SNR reaches `min_snr_db`.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_sonar::chirp::ChirpGenerator;
//! use chiroptera_sonar::correlator::{CorrelatorConfig, EchoCorrelator};
//! use chiroptera_types::{AudioBuffer, ChirpWaveform};
//!
//! let now = chrono::Utc::now();
//! let chirp = ChirpGenerator::new().generate(&ChirpWaveform::default(), now).unwrap();
//!
//! // Echo arriving 200 samples after emission.
//! let mut samples = vec![0.0_f32; 2_000];
//! for (i, s) in chirp.samples.iter().enumerate() {
//!     samples[200 + i] += 0.5 * s;
//! }
//! let recorded = AudioBuffer { samples, sample_rate_hz: 44_100, start_timestamp: now };
//!
//! let result = EchoCorrelator::new(CorrelatorConfig::default())
//!     .detect_echo(&recorded, &chirp)
//!     .unwrap();
//! assert!(result.is_detected());
//! assert!((result.delay_seconds * 44_100.0 - 200.0).abs() < 1.0);
//! ```

use chiroptera_types::{
    AudioBuffer, ChiropteraError, DistanceMeasurement, EchoDetectionResult, EchoStatus,
    SensorType, Vec3, offset_by_seconds,
};
use serde::{Deserialize, Serialize};

use crate::acoustics::AcousticConfig;

/// Windows with less energy per sample than this are treated as silence.
const ENERGY_FLOOR: f64 = 1e-12;
const SNR_CAP_DB: f64 = 120.0;
/// SNR at which the SNR term of the confidence saturates.
const SNR_FULL_CONFIDENCE_DB: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Minimum normalised correlation peak for a detection.
    pub min_correlation: f64,
    /// Minimum peak-window SNR for a detection (dB).
    pub min_snr_db: f64,
    /// Lags earlier than this are ignored (direct speaker→microphone path).
    pub blanking_seconds: f64,
    /// Echoes further than this are reported as "no reading".
    pub max_range_meters: f64,
    pub acoustics: AcousticConfig,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            min_correlation: 0.3,
            min_snr_db: 6.0,
            blanking_seconds: 0.0,
            max_range_meters: 10.0,
            acoustics: AcousticConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoCorrelator {
    config: CorrelatorConfig,
}

impl EchoCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Locate the echo of `transmitted` inside `recorded`.
    ///
    /// The recording is assumed to start at the emission instant, so the lag
    /// of the best match is the round-trip delay.
    ///
    /// # Errors
    ///
    /// - [`ChiropteraError::InsufficientRecording`] when `recorded` is shorter
    ///   than `transmitted`.
    /// - [`ChiropteraError::SampleRateMismatch`] when the two buffers disagree
    ///   on sample rate.
    /// - [`ChiropteraError::InvalidWaveformConfig`] for an empty or silent
    ///   chirp.
    #[tracing::instrument(skip_all, fields(recorded = recorded.samples.len(), transmitted = transmitted.samples.len()))]
    pub fn detect_echo(
        &self,
        recorded: &AudioBuffer,
        transmitted: &AudioBuffer,
    ) -> Result<EchoDetectionResult, ChiropteraError> {
        let r = &recorded.samples;
        let t = &transmitted.samples;
        let n = t.len();

        if n == 0 {
            return Err(ChiropteraError::InvalidWaveformConfig(
                "transmitted chirp is empty".into(),
            ));
        }
        if recorded.sample_rate_hz != transmitted.sample_rate_hz {
            return Err(ChiropteraError::SampleRateMismatch {
                recorded: recorded.sample_rate_hz,
                transmitted: transmitted.sample_rate_hz,
            });
        }
        if r.len() < n {
            return Err(ChiropteraError::InsufficientRecording {
                recorded: r.len(),
                required: n,
            });
        }

        let t_energy: f64 = t.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        if t_energy <= ENERGY_FLOOR * n as f64 {
            return Err(ChiropteraError::InvalidWaveformConfig(
                "transmitted chirp is silent".into(),
            ));
        }
        let t_norm = t_energy.sqrt();

        // prefix[i] = Σ r[..i]²
        let mut prefix = Vec::with_capacity(r.len() + 1);
        prefix.push(0.0_f64);
        let mut acc = 0.0;
        for &s in r {
            acc += f64::from(s) * f64::from(s);
            prefix.push(acc);
        }
        let window_energy = |lag: usize| (prefix[lag + n] - prefix[lag]).max(0.0);

        let fs = f64::from(recorded.sample_rate_hz);
        let first_lag = ((self.config.blanking_seconds.max(0.0) * fs).ceil() as usize).min(r.len() - n);
        let last_lag = r.len() - n;

        let corr: Vec<f64> = (first_lag..=last_lag)
            .map(|lag| {
                let e = window_energy(lag);
                if e <= ENERGY_FLOOR * n as f64 {
                    return 0.0;
                }
                let dot: f64 = r[lag..lag + n]
                    .iter()
                    .zip(t)
                    .map(|(&a, &b)| f64::from(a) * f64::from(b))
                    .sum();
                (dot / (t_norm * e.sqrt())).clamp(-1.0, 1.0)
            })
            .collect();

        let (peak_idx, peak) = corr
            .iter()
            .map(|c| c.abs())
            .enumerate()
            .fold((0, 0.0_f64), |best, (i, c)| if c > best.1 { (i, c) } else { best });
        let peak_lag = first_lag + peak_idx;

        let sidelobe_floor = {
            let (sum_sq, count) = corr
                .iter()
                .enumerate()
                .filter(|(i, _)| i.abs_diff(peak_idx) >= n)
                .fold((0.0, 0usize), |(s, k), (_, c)| (s + c * c, k + 1));
            if count == 0 { 0.0 } else { (sum_sq / count as f64).sqrt() }
        };

        // Blanked samples are excluded from the noise estimate.
        let signal_energy = window_energy(peak_lag) / n as f64;
        let rest = r.len() - first_lag - n;
        let noise_energy = if rest == 0 {
            0.0
        } else {
            (prefix[r.len()] - prefix[first_lag] - window_energy(peak_lag)).max(0.0) / rest as f64
        };
        let snr_db = snr_db(signal_energy, noise_energy);

        let passes = peak >= self.config.min_correlation && snr_db >= self.config.min_snr_db;
        if !passes {
            tracing::debug!(peak, snr_db, sidelobe_floor, "no echo above thresholds");
            return Ok(EchoDetectionResult::no_echo(peak, snr_db, sidelobe_floor));
        }
        // A zero delay is the emission itself, not a reflection.
        if peak_lag == 0 {
            tracing::debug!(peak, snr_db, "correlation peak at zero lag, no usable echo");
            return Ok(EchoDetectionResult::no_echo(peak, snr_db, sidelobe_floor));
        }

        let peak_quality = if sidelobe_floor >= 1.0 {
            0.0
        } else {
            ((peak - sidelobe_floor) / (1.0 - sidelobe_floor)).clamp(0.0, 1.0)
        };
        let snr_quality = (snr_db / SNR_FULL_CONFIDENCE_DB).clamp(0.0, 1.0);
        let confidence = peak_quality * snr_quality;
        let delay_seconds = peak_lag as f64 / fs;

        tracing::debug!(delay_seconds, peak, snr_db, confidence, "echo detected");

        Ok(EchoDetectionResult {
            delay_seconds,
            peak_correlation_magnitude: peak,
            signal_to_noise_ratio_db: snr_db,
            sidelobe_floor,
            confidence,
            status: EchoStatus::Detected,
        })
    }

    /// Detect the echo and fold it into a sonar [`DistanceMeasurement`]
    /// along `direction` (device frame), timestamped at the emission time.
    ///
    /// A missing echo or one beyond `max_range_meters` yields a reading with
    /// no distance and zero confidence.
    pub fn range(
        &self,
        recorded: &AudioBuffer,
        transmitted: &AudioBuffer,
        direction: Vec3,
    ) -> Result<(EchoDetectionResult, DistanceMeasurement), ChiropteraError> {
        let result = self.detect_echo(recorded, transmitted)?;
        let timestamp = transmitted.start_timestamp;

        if !result.is_detected() {
            let m = DistanceMeasurement::no_reading(SensorType::Sonar, direction, timestamp);
            return Ok((result, m));
        }

        let distance = self.config.acoustics.distance_from_delay(result.delay_seconds);
        if distance > self.config.max_range_meters {
            tracing::debug!(distance, max = self.config.max_range_meters, "echo beyond range gate");
            let m = DistanceMeasurement::no_reading(SensorType::Sonar, direction, timestamp);
            return Ok((result, m));
        }

        let m = DistanceMeasurement::new(
            Some(distance),
            SensorType::Sonar,
            result.confidence,
            direction,
            timestamp,
        );
        Ok((result, m))
    }

    /// Time at which the echo reached the microphone.
    pub fn arrival_time(
        transmitted: &AudioBuffer,
        result: &EchoDetectionResult,
    ) -> chrono::DateTime<chrono::Utc> {
        offset_by_seconds(transmitted.start_timestamp, result.delay_seconds)
    }
}

fn snr_db(signal: f64, noise: f64) -> f64 {
    if noise <= ENERGY_FLOOR {
        return if signal <= ENERGY_FLOOR { 0.0 } else { SNR_CAP_DB };
    }
    if signal <= ENERGY_FLOOR {
        return -SNR_CAP_DB;
    }
    (10.0 * (signal / noise).log10()).clamp(-SNR_CAP_DB, SNR_CAP_DB)
}
