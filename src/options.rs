//! Per-operation options.
//!
//! Each session operation takes an explicit options struct. Every field has a
//! default, so callers only name what they change; the set of accepted names
//! is fixed by the struct, and [`parse_options`] rejects anything else before
//! a single command is built.
//!
//! ```
//! use rust_fgen::options::{parse_options, PulseOptions};
//!
//! let opts: PulseOptions = parse_options("duty_cycle = 10.0\nrepetition_frequency = 100.0").unwrap();
//! assert_eq!(opts.duty_cycle, Some(10.0));
//!
//! let err = parse_options::<PulseOptions>("duty = 10.0").unwrap_err();
//! assert!(err.is_configuration());
//! ```

use crate::channel::Channel;
use crate::error::{AppResult, FgenError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default amplitude for configure/load operations, in volts peak-to-peak
pub const DEFAULT_AMPLITUDE: f64 = 0.1;

/// Validation shared by every options struct
pub trait OperationOptions {
    /// Check value ranges and relationships between fields.
    fn validate(&self) -> AppResult<()>;
}

/// Parse TOML text into an options struct and validate it.
///
/// # Errors
/// `FgenError::Configuration` for unknown option names, wrong value types or
/// values that fail [`OperationOptions::validate`].
pub fn parse_options<T>(text: &str) -> AppResult<T>
where
    T: DeserializeOwned + OperationOptions,
{
    let options: T = toml::from_str(text)
        .map_err(|e| FgenError::Configuration(format!("Invalid options: {}", e.message())))?;
    options.validate()?;
    Ok(options)
}

fn require_positive(field: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FgenError::Configuration(format!(
            "{} must be a positive number, got {}",
            field, value
        )))
    }
}

fn require_finite(field: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FgenError::Configuration(format!(
            "{} must be finite, got {}",
            field, value
        )))
    }
}

// =============================================================================
// Pulse
// =============================================================================

/// Options for `Session::configure_pulse`
///
/// Exactly two of `duty_cycle`, `duration` and `repetition_frequency` must be
/// given; the third is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PulseOptions {
    /// Channel to configure
    pub channel: Channel,
    /// Duty cycle in percent
    pub duty_cycle: Option<f64>,
    /// Pulse duration in milliseconds
    pub duration: Option<f64>,
    /// Repetition frequency in Hz
    pub repetition_frequency: Option<f64>,
    /// Amplitude in volts peak-to-peak
    pub amplitude: f64,
    /// DC offset in volts
    pub offset: f64,
}

impl Default for PulseOptions {
    fn default() -> Self {
        Self {
            channel: Channel::One,
            duty_cycle: None,
            duration: None,
            repetition_frequency: None,
            amplitude: DEFAULT_AMPLITUDE,
            offset: 0.0,
        }
    }
}

impl OperationOptions for PulseOptions {
    fn validate(&self) -> AppResult<()> {
        PulseTiming::derive(self)?;
        require_positive("amplitude", self.amplitude)?;
        require_finite("offset", self.offset)
    }
}

/// Complete pulse timing after derivation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseTiming {
    /// Duty cycle in percent
    pub duty_cycle: f64,
    /// Pulse duration in milliseconds
    pub duration: f64,
    /// Repetition frequency in Hz
    pub repetition_frequency: f64,
}

impl PulseTiming {
    /// Fill in the missing timing value.
    ///
    /// - `repetition_frequency = duration * 100 / duty_cycle`
    /// - `duration = repetition_frequency * duty_cycle / 100`
    /// - `duty_cycle = duration * 100 / repetition_frequency`
    ///
    /// # Errors
    /// `FgenError::InsufficientPulseParameters` unless exactly two values are
    /// supplied; `FgenError::Configuration` for non-positive values or a duty
    /// cycle outside (0, 100).
    pub fn derive(options: &PulseOptions) -> AppResult<Self> {
        let supplied = [
            options.duty_cycle,
            options.duration,
            options.repetition_frequency,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count();
        if supplied != 2 {
            return Err(FgenError::InsufficientPulseParameters { supplied });
        }

        let timing = match (
            options.duty_cycle,
            options.duration,
            options.repetition_frequency,
        ) {
            (Some(duty), Some(duration), None) => {
                require_positive("duty_cycle", duty)?;
                require_positive("duration", duration)?;
                Self {
                    duty_cycle: duty,
                    duration,
                    repetition_frequency: duration * 100.0 / duty,
                }
            }
            (Some(duty), None, Some(frequency)) => {
                require_positive("duty_cycle", duty)?;
                require_positive("repetition_frequency", frequency)?;
                Self {
                    duty_cycle: duty,
                    duration: frequency * duty / 100.0,
                    repetition_frequency: frequency,
                }
            }
            (None, Some(duration), Some(frequency)) => {
                require_positive("duration", duration)?;
                require_positive("repetition_frequency", frequency)?;
                Self {
                    duty_cycle: duration * 100.0 / frequency,
                    duration,
                    repetition_frequency: frequency,
                }
            }
            _ => return Err(FgenError::InsufficientPulseParameters { supplied }),
        };

        if timing.duty_cycle >= 100.0 {
            return Err(FgenError::Configuration(format!(
                "duty_cycle must be below 100%, got {}",
                timing.duty_cycle
            )));
        }
        Ok(timing)
    }

    /// Pulse width in seconds, as the instrument expects it.
    pub fn width_seconds(&self) -> f64 {
        self.duration / 1000.0
    }
}

// =============================================================================
// Modulation
// =============================================================================

/// Options for `Session::configure_modulation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModulationOptions {
    /// Channel providing the modulating signal; the other channel is the carrier
    pub modulating_channel: Channel,
    /// Modulation depth in percent
    pub depth: f64,
}

impl Default for ModulationOptions {
    fn default() -> Self {
        Self {
            modulating_channel: Channel::One,
            depth: 100.0,
        }
    }
}

impl ModulationOptions {
    /// Channel that carries the modulated output.
    pub fn carrier(&self) -> Channel {
        self.modulating_channel.other()
    }
}

impl OperationOptions for ModulationOptions {
    fn validate(&self) -> AppResult<()> {
        if !(0.0..=120.0).contains(&self.depth) {
            return Err(FgenError::Configuration(format!(
                "depth must be within 0-120%, got {}",
                self.depth
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Trigger / burst
// =============================================================================

/// Where burst triggers come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Rear-panel trigger input
    #[default]
    #[serde(alias = "ext")]
    External,
    /// Software (`*TRG`) trigger over the bus
    #[serde(alias = "software")]
    Bus,
    /// Internal timer
    #[serde(alias = "tim")]
    Timer,
}

impl TriggerSource {
    /// Mnemonic used by `TRIGn:SOUR`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            TriggerSource::External => "EXT",
            TriggerSource::Bus => "BUS",
            TriggerSource::Timer => "TIM",
        }
    }
}

/// Options for `Session::configure_trigger`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerOptions {
    /// Channels to arm
    pub channels: Vec<Channel>,
    /// Trigger source
    pub source: TriggerSource,
    /// Timer period in seconds, used with `TriggerSource::Timer`
    pub timer_interval: f64,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            channels: Channel::ALL.to_vec(),
            source: TriggerSource::External,
            timer_interval: 1.0,
        }
    }
}

impl OperationOptions for TriggerOptions {
    fn validate(&self) -> AppResult<()> {
        if self.channels.is_empty() {
            return Err(FgenError::Configuration(
                "channels must name at least one channel".to_string(),
            ));
        }
        if self.source == TriggerSource::Timer {
            require_positive("timer_interval", self.timer_interval)?;
        }
        Ok(())
    }
}

// =============================================================================
// Waveforms and states
// =============================================================================

/// Options for `Session::load_waveform`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadWaveformOptions {
    /// Channel to load into
    pub channel: Channel,
    /// Amplitude in volts peak-to-peak
    pub amplitude: f64,
    /// DC offset in volts
    pub offset: f64,
    /// Storage folder; the configured folder when unset
    pub folder: Option<String>,
    /// Playback rate; the stored rate when unset
    pub sample_rate: Option<f64>,
}

impl Default for LoadWaveformOptions {
    fn default() -> Self {
        Self {
            channel: Channel::One,
            amplitude: DEFAULT_AMPLITUDE,
            offset: 0.0,
            folder: None,
            sample_rate: None,
        }
    }
}

impl OperationOptions for LoadWaveformOptions {
    fn validate(&self) -> AppResult<()> {
        require_positive("amplitude", self.amplitude)?;
        require_finite("offset", self.offset)?;
        if let Some(rate) = self.sample_rate {
            require_positive("sample_rate", rate)?;
        }
        Ok(())
    }
}

/// Options for `Session::upload_waveform`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadOptions {
    /// Channel to upload to
    pub channel: Channel,
    /// Amplitude in volts peak-to-peak
    pub amplitude: f64,
    /// DC offset in volts
    pub offset: f64,
    /// Storage folder for the persisted copy; the configured folder when unset
    pub folder: Option<String>,
    /// Store the waveform in non-volatile memory after upload
    pub persist: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            channel: Channel::One,
            amplitude: DEFAULT_AMPLITUDE,
            offset: 0.0,
            folder: None,
            persist: true,
        }
    }
}

impl OperationOptions for UploadOptions {
    fn validate(&self) -> AppResult<()> {
        require_positive("amplitude", self.amplitude)?;
        require_finite("offset", self.offset)
    }
}

/// Options for `Session::load_state` and `Session::store_state`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateOptions {
    /// Storage folder; the configured folder when unset
    pub folder: Option<String>,
}

impl OperationOptions for StateOptions {
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(duty: Option<f64>, duration: Option<f64>, freq: Option<f64>) -> PulseOptions {
        PulseOptions {
            duty_cycle: duty,
            duration,
            repetition_frequency: freq,
            ..Default::default()
        }
    }

    #[test]
    fn derives_duration_from_frequency() {
        let timing = PulseTiming::derive(&pulse(Some(10.0), None, Some(100.0))).unwrap();
        assert_eq!(timing.duration, 10.0);
        assert_eq!(timing.repetition_frequency, 100.0);
    }

    #[test]
    fn derives_frequency_from_duration() {
        let timing = PulseTiming::derive(&pulse(Some(10.0), Some(1.0), None)).unwrap();
        assert_eq!(timing.repetition_frequency, 10.0);
        assert_eq!(timing.width_seconds(), 0.001);
    }

    #[test]
    fn derives_duty_cycle() {
        let timing = PulseTiming::derive(&pulse(None, Some(10.0), Some(100.0))).unwrap();
        assert_eq!(timing.duty_cycle, 10.0);
    }

    #[test]
    fn needs_exactly_two_timing_values() {
        for opts in [
            pulse(None, None, None),
            pulse(Some(10.0), None, None),
            pulse(None, None, Some(100.0)),
            pulse(Some(10.0), Some(1.0), Some(10.0)),
        ] {
            let err = PulseTiming::derive(&opts).unwrap_err();
            assert!(matches!(err, FgenError::InsufficientPulseParameters { .. }));
        }
    }

    #[test]
    fn rejects_non_positive_timing() {
        assert!(PulseTiming::derive(&pulse(Some(0.0), Some(1.0), None)).is_err());
        assert!(PulseTiming::derive(&pulse(Some(10.0), None, Some(-5.0))).is_err());
        assert!(PulseTiming::derive(&pulse(None, Some(200.0), Some(1.0))).is_err());
    }

    #[test]
    fn unknown_option_name_is_rejected() {
        let err = parse_options::<TriggerOptions>("sauce = \"bus\"").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("sauce"));
    }

    #[test]
    fn trigger_options_from_toml() {
        let opts: TriggerOptions =
            parse_options("channels = [2]\nsource = \"timer\"\ntimer_interval = 0.5").unwrap();
        assert_eq!(opts.channels, vec![Channel::Two]);
        assert_eq!(opts.source, TriggerSource::Timer);
        assert_eq!(opts.source.mnemonic(), "TIM");

        let alias: TriggerOptions = parse_options("source = \"software\"").unwrap();
        assert_eq!(alias.source, TriggerSource::Bus);
        assert_eq!(alias.channels, Channel::ALL.to_vec());
    }

    #[test]
    fn invalid_channel_number_is_rejected() {
        assert!(parse_options::<UploadOptions>("channel = 3").is_err());
    }

    #[test]
    fn modulation_carrier_is_the_other_channel() {
        let opts = ModulationOptions::default();
        assert_eq!(opts.carrier(), Channel::Two);

        let opts: ModulationOptions = parse_options("modulating_channel = 2").unwrap();
        assert_eq!(opts.carrier(), Channel::One);

        assert!(parse_options::<ModulationOptions>("depth = 150.0").is_err());
    }

    #[test]
    fn pulse_options_validate_through_parse() {
        let err = parse_options::<PulseOptions>("duty_cycle = 10.0").unwrap_err();
        assert!(matches!(
            err,
            FgenError::InsufficientPulseParameters { supplied: 1 }
        ));
    }
}
