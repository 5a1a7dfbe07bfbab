//! Linear chirp synthesis.
//!
//! A chirp sweeps linearly from `start_frequency_hz` to `end_frequency_hz`
//! over `duration_seconds`. Its phase is
//!
//! ```text
//! φ(t) = 2π · (f0·t + (f1 − f0)·t² / (2T))
//! ```
//!
//! so the instantaneous frequency `φ'(t) / 2π` moves from `f0` at `t = 0` to
//! `f1` at `t = T`. The sweep is shaped by a Hann window to keep the spectrum
//! tight and scaled by `amplitude_scale`.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_sonar::chirp::ChirpGenerator;
//! use chiroptera_types::ChirpWaveform;
//!
//! let chirp = ChirpGenerator::new()
//!     .generate(&ChirpWaveform::default(), chrono::Utc::now())
//!     .unwrap();
//! assert_eq!(chirp.samples.len(), 441);
//! assert_eq!(chirp.samples[0], 0.0);
//! ```

use std::f64::consts::TAU;

use chiroptera_types::{AudioBuffer, ChiropteraError, ChirpWaveform};
use chrono::{DateTime, Utc};

/// Stateless chirp synthesiser. The same waveform always yields the same
/// samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChirpGenerator;

impl ChirpGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Synthesise `waveform`, stamping the buffer with `emitted_at`.
    ///
    /// # Errors
    ///
    /// [`ChiropteraError::InvalidWaveformConfig`] when the waveform cannot be
    /// rendered (see [`validate`]).
    pub fn generate(
        &self,
        waveform: &ChirpWaveform,
        emitted_at: DateTime<Utc>,
    ) -> Result<AudioBuffer, ChiropteraError> {
        validate(waveform)?;

        let n = waveform.sample_count();
        let fs = f64::from(waveform.sample_rate_hz);
        let f0 = waveform.start_frequency_hz;
        let sweep_rate = (waveform.end_frequency_hz - f0) / waveform.duration_seconds;

        let samples = (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                let phase = TAU * (f0 * t + 0.5 * sweep_rate * t * t);
                (waveform.amplitude_scale * hann(i, n) * phase.sin()) as f32
            })
            .collect();

        tracing::debug!(
            samples = n,
            start_hz = f0,
            end_hz = waveform.end_frequency_hz,
            "chirp generated"
        );

        Ok(AudioBuffer {
            samples,
            sample_rate_hz: waveform.sample_rate_hz,
            start_timestamp: emitted_at,
        })
    }
}

/// Check that `waveform` describes a renderable chirp.
pub fn validate(waveform: &ChirpWaveform) -> Result<(), ChiropteraError> {
    let invalid = |msg: String| Err(ChiropteraError::InvalidWaveformConfig(msg));

    let ChirpWaveform {
        start_frequency_hz: f0,
        end_frequency_hz: f1,
        duration_seconds: duration,
        sample_rate_hz,
        amplitude_scale,
    } = *waveform;

    if ![f0, f1, duration, amplitude_scale].iter().all(|v| v.is_finite()) {
        return invalid("waveform parameters must be finite".into());
    }
    if duration <= 0.0 {
        return invalid(format!("duration must be positive, got {duration} s"));
    }
    if sample_rate_hz == 0 {
        return invalid("sample rate must be non-zero".into());
    }
    if f0 < 0.0 {
        return invalid(format!("start frequency must be non-negative, got {f0} Hz"));
    }
    if f0 >= f1 {
        return invalid(format!(
            "start frequency {f0} Hz must be below end frequency {f1} Hz"
        ));
    }
    let nyquist = f64::from(sample_rate_hz) / 2.0;
    if f1 > nyquist {
        return invalid(format!(
            "end frequency {f1} Hz exceeds Nyquist limit {nyquist} Hz"
        ));
    }
    if !(0.0..=1.0).contains(&amplitude_scale) {
        return invalid(format!(
            "amplitude scale must lie in [0, 1], got {amplitude_scale}"
        ));
    }
    if waveform.sample_count() == 0 {
        return invalid("duration is shorter than one sample".into());
    }
    Ok(())
}

/// Hann window coefficient for sample `i` of `n`.
fn hann(i: usize, n: usize) -> f64 {
    if n <= 1 {
        return 1.0;
    }
    0.5 * (1.0 - (TAU * i as f64 / (n - 1) as f64).cos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn generation_is_deterministic() {
        let g = ChirpGenerator::new();
        let w = ChirpWaveform::default();
        let t = now();
        let a = g.generate(&w, t).unwrap();
        let b = g.generate(&w, t).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.start_timestamp, t);
        assert_eq!(a.sample_rate_hz, 44_100);
    }

    #[test]
    fn window_tapers_both_ends_and_respects_amplitude() {
        let w = ChirpWaveform::default();
        let chirp = ChirpGenerator::new().generate(&w, now()).unwrap();
        let n = chirp.samples.len();
        assert_eq!(chirp.samples[0], 0.0);
        assert!(chirp.samples[n - 1].abs() < 1e-6);
        let peak = chirp.samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.8 + 1e-6);
        assert!(peak > 0.7);
    }

    #[test]
    fn instantaneous_frequency_sweeps_upwards() {
        // Count zero crossings in the first and last quarter.
        let w = ChirpWaveform {
            start_frequency_hz: 1_000.0,
            end_frequency_hz: 4_000.0,
            duration_seconds: 0.1,
            sample_rate_hz: 48_000,
            amplitude_scale: 1.0,
        };
        let s = ChirpGenerator::new().generate(&w, now()).unwrap().samples;
        let crossings = |xs: &[f32]| xs.windows(2).filter(|p| (p[0] < 0.0) != (p[1] < 0.0)).count();
        let q = s.len() / 4;
        assert!(crossings(&s[3 * q..]) > 2 * crossings(&s[..q]));
    }

    #[test]
    fn single_sample_chirp_uses_unit_window() {
        let w = ChirpWaveform {
            start_frequency_hz: 0.0,
            end_frequency_hz: 10.0,
            duration_seconds: 1.0 / 44_100.0,
            sample_rate_hz: 44_100,
            amplitude_scale: 0.5,
        };
        let chirp = ChirpGenerator::new().generate(&w, now()).unwrap();
        assert_eq!(chirp.samples.len(), 1);
        assert_eq!(hann(0, 1), 1.0);
    }

    #[test]
    fn rejects_invalid_waveforms() {
        let g = ChirpGenerator::new();
        let base = ChirpWaveform::default();
        let cases = [
            ChirpWaveform { duration_seconds: 0.0, ..base },
            ChirpWaveform { duration_seconds: -0.01, ..base },
            ChirpWaveform { sample_rate_hz: 0, ..base },
            ChirpWaveform { start_frequency_hz: 21_000.0, ..base },
            ChirpWaveform { end_frequency_hz: 30_000.0, ..base },
            ChirpWaveform { amplitude_scale: 1.5, ..base },
            ChirpWaveform { start_frequency_hz: f64::NAN, ..base },
            ChirpWaveform { duration_seconds: 1e-9, ..base },
        ];
        for w in cases {
            let err = g.generate(&w, now()).unwrap_err();
            assert!(
                matches!(err, ChiropteraError::InvalidWaveformConfig(_)),
                "{w:?} gave {err:?}"
            );
        }
    }
}
