//! `chiroptera-sonar` – acoustic ranging.
//!
//! Emits linear frequency-modulated chirps through the device speaker and
//! finds their echoes in the microphone capture.
//!
//! # Modules
//!
//! - [`chirp`] – [`ChirpGenerator`][chirp::ChirpGenerator]: Hann-windowed
//!   linear sweep synthesis.
//! - [`correlator`] – [`EchoCorrelator`][correlator::EchoCorrelator]:
//!   normalised cross-correlation, SNR and confidence scoring, conversion to
//!   a sonar distance reading.
//! - [`acoustics`] – speed of sound and delay/distance conversions.

pub mod acoustics;
pub mod chirp;
pub mod correlator;
