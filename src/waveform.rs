//! Waveform codec.
//!
//! Arbitrary waveforms travel to the instrument as signed 16-bit DAC codes in
//! decimal text. A real-valued sample sequence is rescaled so its extremes land
//! on the code range limits:
//!
//! ```text
//! scale  = (max - min) / 2
//! offset = min + scale
//! code   = round((sample - offset) / scale * 32767), clamped to i16
//! ```
//!
//! A flat sequence (`max == min`) has no range to map and encodes to all-zero
//! codes. The codes serialize as comma-separated integers with no trailing
//! separator.
//!
//! Stored-waveform catalog listings are decoded here as well: the names are
//! the text between a `,"` delimiter and the waveform file extension.

use crate::error::{AppResult, FgenError};
use regex::Regex;
use std::collections::BTreeSet;

/// Full-scale DAC code
pub const FULL_SCALE_CODE: f64 = 32767.0;

/// Fewest points the instrument accepts for an arbitrary waveform
pub const MIN_POINTS: usize = 8;

/// Longest arbitrary waveform name the instrument accepts
pub const MAX_NAME_LEN: usize = 12;

/// A named sample sequence with its playback rate
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    name: String,
    samples: Vec<f64>,
    sample_rate: f64,
}

impl Waveform {
    /// Build a waveform, validating everything the instrument would reject.
    ///
    /// # Errors
    /// `FgenError::Configuration` if the name is not a valid arbitrary
    /// waveform name, fewer than [`MIN_POINTS`] samples are given, any sample
    /// is not finite, or the sample rate is not positive.
    pub fn new(name: impl Into<String>, samples: Vec<f64>, sample_rate: f64) -> AppResult<Self> {
        let name = name.into();
        validate_name(&name)?;

        if samples.len() < MIN_POINTS {
            return Err(FgenError::Configuration(format!(
                "Waveform '{}' has {} samples; at least {} are required",
                name,
                samples.len(),
                MIN_POINTS
            )));
        }
        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            return Err(FgenError::Configuration(format!(
                "Waveform '{}' sample {} is not finite",
                name, index
            )));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(FgenError::Configuration(format!(
                "Sample rate must be positive, got {}",
                sample_rate
            )));
        }

        Ok(Self {
            name,
            samples,
            sample_rate,
        })
    }

    /// Waveform name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw samples
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Playback rate in samples per second
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Encode the samples into DAC codes.
    pub fn encode(&self) -> EncodedWaveform {
        encode(&self.samples)
    }
}

/// Check an arbitrary waveform name: a letter followed by letters, digits or
/// underscores, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(name: &str) -> AppResult<()> {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !starts_with_letter || !rest_ok || name.len() > MAX_NAME_LEN {
        return Err(FgenError::Configuration(format!(
            "Invalid waveform name '{}': use a letter followed by up to {} letters, digits or underscores",
            name,
            MAX_NAME_LEN - 1
        )));
    }
    Ok(())
}

/// DAC codes plus the mapping needed to get back to sample values
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedWaveform {
    /// Signed 16-bit codes, one per sample
    pub codes: Vec<i16>,
    /// Half the sample range
    pub scale: f64,
    /// Midpoint of the sample range
    pub offset: f64,
}

impl EncodedWaveform {
    /// Comma-separated decimal codes, no trailing separator.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.codes.len() * 7);
        for (i, code) in self.codes.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&code.to_string());
        }
        out
    }

    /// Map the codes back to sample values.
    pub fn decode(&self) -> Vec<f64> {
        self.codes
            .iter()
            .map(|&code| f64::from(code) / FULL_SCALE_CODE * self.scale + self.offset)
            .collect()
    }

    /// Size of one quantization step in sample units.
    pub fn quantum(&self) -> f64 {
        self.scale / FULL_SCALE_CODE
    }
}

/// Encode samples into signed 16-bit DAC codes.
pub fn encode(samples: &[f64]) -> EncodedWaveform {
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });

    if samples.is_empty() {
        return EncodedWaveform {
            codes: Vec::new(),
            scale: 0.0,
            offset: 0.0,
        };
    }

    // Halved before subtracting so ranges near f64::MAX stay finite
    let scale = 0.5 * max - 0.5 * min;
    let offset = 0.5 * max + 0.5 * min;

    // Degenerate range: nothing to scale against
    if scale.is_nan() || scale <= 0.0 {
        return EncodedWaveform {
            codes: vec![0; samples.len()],
            scale: 0.0,
            offset,
        };
    }

    let codes = samples
        .iter()
        .map(|&s| {
            let code = ((s - offset) / scale * FULL_SCALE_CODE).round();
            code.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
        })
        .collect();

    EncodedWaveform {
        codes,
        scale,
        offset,
    }
}

/// Decode a waveform catalog listing into the set of stored names.
///
/// A listing looks like
/// `+1024,+4193280,"ramp.arb,ARB,512","pulse.arb,ARB,512"`; every name that
/// sits between `,"` and `.<extension>` is returned. Entries with other
/// extensions are skipped.
pub fn decode_catalog(listing: &str, extension: &str) -> BTreeSet<String> {
    let pattern = format!(r#","([^",]*?)\.{}"#, regex::escape(extension));
    // The pattern is built from an escaped literal and always compiles
    let Ok(regex) = Regex::new(&pattern) else {
        return BTreeSet::new();
    };
    regex
        .captures_iter(listing)
        .map(|caps| caps[1].to_string())
        .collect()
}
