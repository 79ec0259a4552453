//! Command sequencer.
//!
//! Builds the ordered command lines for each operation. A [`CommandBlock`] is
//! sent as one newline-joined write, so the instrument sees the whole state
//! transition without anything interleaved. Builders that reconfigure a
//! channel switch its output off in the same block; only [`go`] turns outputs
//! back on.
//!
//! Note that `APPLY` switches the output on as a side effect, which is why
//! blocks that use it follow it with an explicit `OUTPn OFF`.

use crate::channel::Channel;
use crate::config::{SafetyConfig, SineDefaults};
use crate::options::{
    LoadWaveformOptions, ModulationOptions, PulseOptions, PulseTiming, TriggerOptions,
    TriggerSource,
};
use crate::waveform::EncodedWaveform;
use std::fmt;

/// Identity query
pub const IDENTITY_QUERY: &str = "*IDN?";

/// Software trigger
pub const SOFTWARE_TRIGGER: &str = "*TRG";

/// Ordered command lines sent as a single write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBlock {
    lines: Vec<String>,
}

impl CommandBlock {
    /// Empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one command line.
    pub fn push(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    /// Append every line of `other`, keeping its order.
    pub fn append(&mut self, other: CommandBlock) -> &mut Self {
        self.lines.extend(other.lines);
        self
    }

    /// Lines in send order
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Wire text: lines joined with `\n`.
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

impl fmt::Display for CommandBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines.join("; "))
    }
}

impl<S: Into<String>> FromIterator<S> for CommandBlock {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().map(Into::into).collect(),
        }
    }
}

// =============================================================================
// Single lines and queries
// =============================================================================

/// `OUTPn ON|OFF`
pub fn output(channel: Channel, on: bool) -> String {
    format!("OUTP{} {}", channel.number(), if on { "ON" } else { "OFF" })
}

/// Volatile-memory catalog query for a channel
pub fn volatile_catalog_query(channel: Channel) -> String {
    format!("SOUR{}:DATA:VOL:CAT?", channel.number())
}

/// Stored-waveform catalog query for a folder such as `INT:\stim`
pub fn catalog_query(folder_path: &str) -> String {
    format!("MMEM:CAT:DATA:ARB? \"{}\"", folder_path)
}

/// Waveform attribute that can be queried from volatile memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Peak over RMS
    CrestFactor,
    /// Normalized peak-to-peak amplitude
    PeakToPeak,
}

impl Attribute {
    /// Query line for `name` on `channel`.
    pub fn query(self, channel: Channel, name: &str) -> String {
        let mnemonic = match self {
            Attribute::CrestFactor => "CFAC",
            Attribute::PeakToPeak => "PTP",
        };
        format!(
            "SOUR{}:DATA:ATTR:{}? \"{}\"",
            channel.number(),
            mnemonic,
            name
        )
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::CrestFactor => write!(f, "crest factor"),
            Attribute::PeakToPeak => write!(f, "peak-to-peak"),
        }
    }
}

/// Arbitrary-data upload line: `SOURn:DATA:ARB:DAC name,c0,c1,...`
pub fn arb_data(channel: Channel, name: &str, encoded: &EncodedWaveform) -> String {
    format!(
        "SOUR{}:DATA:ARB:DAC {},{}",
        channel.number(),
        name,
        encoded.to_wire()
    )
}

// =============================================================================
// Blocks
// =============================================================================

/// Outputs on or off for each channel.
pub fn outputs(channels: &[Channel], on: bool) -> CommandBlock {
    channels.iter().map(|&ch| output(ch, on)).collect()
}

/// Enable outputs. No trigger is sent.
pub fn go(channels: &[Channel]) -> CommandBlock {
    outputs(channels, true)
}

/// Disable outputs, then pulse the software trigger.
pub fn stop(channels: &[Channel]) -> CommandBlock {
    let mut block = outputs(channels, false);
    block.push(SOFTWARE_TRIGGER);
    block
}

/// Idle sine on both channels, outputs off, volatile memory cleared.
pub fn reset(defaults: &SineDefaults) -> CommandBlock {
    let mut block = CommandBlock::new();
    for channel in Channel::ALL {
        block.push(format!(
            "SOUR{}:APPLY:SIN {},{},{}",
            channel.number(),
            defaults.frequency_hz,
            defaults.amplitude_volts,
            defaults.offset_volts
        ));
    }
    for channel in Channel::ALL {
        block.push(output(channel, false));
    }
    for channel in Channel::ALL {
        block.push(format!("SOUR{}:DATA:VOL:CLE", channel.number()));
    }
    block
}

/// Pulse train with a held width, output left off.
pub fn pulse(options: &PulseOptions, timing: &PulseTiming) -> CommandBlock {
    let n = options.channel.number();
    let mut block = CommandBlock::new();
    block
        .push(format!(
            "SOUR{}:APPLY:PULS {},{},{}",
            n, timing.repetition_frequency, options.amplitude, options.offset
        ))
        .push(format!("SOUR{}:FUNC:PULS:HOLD WIDT", n))
        .push(format!(
            "SOUR{}:FUNC:PULS:WIDT {}",
            n,
            timing.width_seconds()
        ))
        .push(output(options.channel, false))
        .push(format!("SOUR{}:VOLT {}", n, options.amplitude));
    block
}

/// Carrier channel amplitude-modulated by the other channel, output left off.
pub fn modulation(options: &ModulationOptions) -> CommandBlock {
    let carrier = options.carrier();
    let c = carrier.number();
    let mut block = CommandBlock::new();
    block
        .push(format!(
            "SOUR{}:AM:SOUR CH{}",
            c,
            options.modulating_channel.number()
        ))
        .push(format!("SOUR{}:AM:DEPT {}", c, options.depth))
        .push(format!("SOUR{}:AM:STAT ON", c))
        .push(output(carrier, false));
    block
}

/// Single-cycle triggered burst on each selected channel.
pub fn burst(options: &TriggerOptions) -> CommandBlock {
    let mut block = CommandBlock::new();
    for channel in &options.channels {
        let n = channel.number();
        block
            .push(format!("SOUR{}:BURS:MODE TRIG", n))
            .push(format!("SOUR{}:BURS:NCYC 1", n))
            .push(format!("SOUR{}:BURS:STAT ON", n))
            .push(format!("TRIG{}:SOUR {}", n, options.source.mnemonic()));
        if options.source == TriggerSource::Timer {
            block.push(format!("TRIG{}:TIM {}", n, options.timer_interval));
        }
    }
    block
}

/// Amplitude change on one channel.
pub fn voltage(channel: Channel, volts: f64) -> CommandBlock {
    std::iter::once(format!("SOUR{}:VOLT {}", channel.number(), volts)).collect()
}

/// Output off, volatile memory cleared, output off again.
pub fn clear_memory(channel: Channel) -> CommandBlock {
    let mut block = CommandBlock::new();
    block
        .push(output(channel, false))
        .push(format!("SOUR{}:DATA:VOL:CLE", channel.number()))
        .push(output(channel, false));
    block
}

fn select_arb(
    block: &mut CommandBlock,
    channel: Channel,
    name: &str,
    sample_rate: Option<f64>,
    amplitude: f64,
    offset: f64,
) {
    let n = channel.number();
    block.push(format!("SOUR{}:FUNC:ARB {}", n, name));
    if let Some(rate) = sample_rate {
        block.push(format!("SOUR{}:FUNC:ARB:SRAT {}", n, rate));
    }
    block
        .push(format!("SOUR{}:FUNC ARB", n))
        .push(format!("SOUR{}:VOLT {}", n, amplitude))
        .push(format!("SOUR{}:VOLT:OFFS {}", n, offset));
}

/// Select a volatile arbitrary waveform as the channel's active function.
///
/// When `store_path` is given, the selection is also written to mass storage.
pub fn arb_activate(
    channel: Channel,
    name: &str,
    sample_rate: Option<f64>,
    amplitude: f64,
    offset: f64,
    store_path: Option<&str>,
) -> CommandBlock {
    let mut block = CommandBlock::new();
    block.push(output(channel, false));
    select_arb(&mut block, channel, name, sample_rate, amplitude, offset);
    if let Some(path) = store_path {
        block.push(format!("MMEM:STOR:DATA{} \"{}\"", channel.number(), path));
    }
    block
}

/// Load a stored waveform into volatile memory (unless already resident) and
/// make it the channel's active function.
pub fn load_waveform(path: &str, resident: bool, options: &LoadWaveformOptions) -> CommandBlock {
    let channel = options.channel;
    let quoted = format!("\"{}\"", path);
    let mut block = CommandBlock::new();
    block.push(output(channel, false));
    if !resident {
        block.push(format!("MMEM:LOAD:DATA{} {}", channel.number(), quoted));
    }
    select_arb(
        &mut block,
        channel,
        &quoted,
        options.sample_rate,
        options.amplitude,
        options.offset,
    );
    block
}

/// Recall an instrument state file.
pub fn load_state(path: &str) -> CommandBlock {
    std::iter::once(format!("MMEM:LOAD:STAT \"{}\"", path)).collect()
}

/// Save the instrument state to a file.
pub fn store_state(path: &str) -> CommandBlock {
    std::iter::once(format!("MMEM:STOR:STAT \"{}\"", path)).collect()
}

// =============================================================================
// Voltage guard
// =============================================================================

/// Amplitude limit above which a change must be confirmed by the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageGuard {
    threshold: f64,
}

impl VoltageGuard {
    /// Guard with an explicit threshold in volts
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Guard from the `[safety]` configuration section
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(config.threshold_volts())
    }

    /// Threshold in volts
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// True when `volts` may only be applied after confirmation.
    pub fn requires_confirmation(&self, volts: f64) -> bool {
        volts > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::encode;

    fn lines(block: &CommandBlock) -> Vec<&str> {
        block.lines().iter().map(String::as_str).collect()
    }

    #[test]
    fn clear_memory_brackets_the_clear() {
        let block = clear_memory(Channel::One);
        assert_eq!(lines(&block), vec!["OUTP1 OFF", "SOUR1:DATA:VOL:CLE", "OUTP1 OFF"]);
        assert_eq!(block.render(), "OUTP1 OFF\nSOUR1:DATA:VOL:CLE\nOUTP1 OFF");
    }

    #[test]
    fn stop_triggers_but_go_does_not() {
        let stop = stop(&Channel::ALL);
        assert_eq!(lines(&stop), vec!["OUTP1 OFF", "OUTP2 OFF", "*TRG"]);

        let go = go(&[Channel::Two]);
        assert_eq!(lines(&go), vec!["OUTP2 ON"]);
    }

    #[test]
    fn reset_turns_outputs_off_after_apply() {
        let block = reset(&SineDefaults::default());
        assert_eq!(
            lines(&block),
            vec![
                "SOUR1:APPLY:SIN 1000,0.1,0",
                "SOUR2:APPLY:SIN 1000,0.1,0",
                "OUTP1 OFF",
                "OUTP2 OFF",
                "SOUR1:DATA:VOL:CLE",
                "SOUR2:DATA:VOL:CLE",
            ]
        );
    }

    #[test]
    fn pulse_block_order() {
        let options = PulseOptions {
            channel: Channel::Two,
            duty_cycle: Some(10.0),
            repetition_frequency: Some(100.0),
            ..Default::default()
        };
        let timing = PulseTiming::derive(&options).unwrap();
        let block = pulse(&options, &timing);
        assert_eq!(
            lines(&block),
            vec![
                "SOUR2:APPLY:PULS 100,0.1,0",
                "SOUR2:FUNC:PULS:HOLD WIDT",
                "SOUR2:FUNC:PULS:WIDT 0.01",
                "OUTP2 OFF",
                "SOUR2:VOLT 0.1",
            ]
        );
    }

    #[test]
    fn modulation_targets_the_carrier() {
        let block = modulation(&ModulationOptions::default());
        assert_eq!(
            lines(&block),
            vec![
                "SOUR2:AM:SOUR CH1",
                "SOUR2:AM:DEPT 100",
                "SOUR2:AM:STAT ON",
                "OUTP2 OFF",
            ]
        );
    }

    #[test]
    fn burst_adds_timer_only_for_timer_source() {
        let external = burst(&TriggerOptions::default());
        assert_eq!(external.len(), 8);
        assert!(external.lines().iter().all(|l| !l.contains(":TIM ")));
        assert_eq!(external.lines()[3], "TRIG1:SOUR EXT");

        let timer = burst(&TriggerOptions {
            channels: vec![Channel::One],
            source: TriggerSource::Timer,
            timer_interval: 0.25,
        });
        assert_eq!(
            lines(&timer),
            vec![
                "SOUR1:BURS:MODE TRIG",
                "SOUR1:BURS:NCYC 1",
                "SOUR1:BURS:STAT ON",
                "TRIG1:SOUR TIM",
                "TRIG1:TIM 0.25",
            ]
        );
    }

    #[test]
    fn upload_line_and_activation() {
        let encoded = encode(&[-1.0, 1.0]);
        assert_eq!(
            arb_data(Channel::One, "ramp", &encoded),
            "SOUR1:DATA:ARB:DAC ramp,-32767,32767"
        );

        let block = arb_activate(Channel::One, "ramp", Some(1e6), 0.5, 0.0, Some("INT:\\ramp.arb"));
        assert_eq!(
            lines(&block),
            vec![
                "OUTP1 OFF",
                "SOUR1:FUNC:ARB ramp",
                "SOUR1:FUNC:ARB:SRAT 1000000",
                "SOUR1:FUNC ARB",
                "SOUR1:VOLT 0.5",
                "SOUR1:VOLT:OFFS 0",
                "MMEM:STOR:DATA1 \"INT:\\ramp.arb\"",
            ]
        );
    }

    #[test]
    fn load_skips_mass_storage_when_resident() {
        let options = LoadWaveformOptions::default();
        let fresh = load_waveform("INT:\\ramp.arb", false, &options);
        assert_eq!(fresh.lines()[0], "OUTP1 OFF");
        assert_eq!(fresh.lines()[1], "MMEM:LOAD:DATA1 \"INT:\\ramp.arb\"");
        assert_eq!(fresh.lines()[2], "SOUR1:FUNC:ARB \"INT:\\ramp.arb\"");

        let resident = load_waveform("INT:\\ramp.arb", true, &options);
        assert_eq!(resident.len(), fresh.len() - 1);
        assert!(resident.lines().iter().all(|l| !l.starts_with("MMEM:LOAD")));
        assert_eq!(
            resident.lines().iter().filter(|l| l.starts_with("OUTP")).count(),
            1
        );
    }

    #[test]
    fn voltage_guard_threshold() {
        let guard = VoltageGuard::from_config(&SafetyConfig::default());
        assert!((guard.threshold() - 0.95).abs() < 1e-12);
        assert!(!guard.requires_confirmation(0.5));
        assert!(!guard.requires_confirmation(0.95));
        assert!(guard.requires_confirmation(0.96));
    }

    #[test]
    fn attribute_queries() {
        assert_eq!(
            Attribute::CrestFactor.query(Channel::Two, "ramp"),
            "SOUR2:DATA:ATTR:CFAC? \"ramp\""
        );
        assert_eq!(
            Attribute::PeakToPeak.query(Channel::One, "ramp"),
            "SOUR1:DATA:ATTR:PTP? \"ramp\""
        );
    }
}
