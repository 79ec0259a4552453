//! Output channels and their logical state.

use crate::options::TriggerSource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the generator's two output channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    /// Channel 1
    One,
    /// Channel 2
    Two,
}

impl Channel {
    /// Both channels, in order
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    /// Channel number as used in command headers (`OUTP1`, `SOUR2`).
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    /// The other channel.
    pub fn other(self) -> Channel {
        match self {
            Channel::One => Channel::Two,
            Channel::Two => Channel::One,
        }
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.number() - 1)
    }
}

impl TryFrom<u8> for Channel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(format!("channel must be 1 or 2, got {}", other)),
        }
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.number()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

/// Active waveform function on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum WaveFunction {
    /// Sine at a fixed frequency
    Sine {
        /// Frequency in Hz
        frequency: f64,
    },
    /// Pulse train
    Pulse {
        /// Repetition frequency
        frequency: f64,
        /// Pulse width in seconds
        width: f64,
    },
    /// Arbitrary waveform played from volatile memory
    Arbitrary {
        /// Name or storage path of the waveform
        name: String,
        /// Playback rate, if set
        sample_rate: Option<f64>,
    },
    /// Amplitude-modulated by the other channel
    Modulated {
        /// Modulation source
        source: Channel,
        /// Modulation depth in percent
        depth: f64,
    },
    /// Not known to this session, e.g. after loading a stored state
    Unknown,
}

/// Burst/trigger progress of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BurstState {
    /// Running continuously
    #[default]
    Idle,
    /// Waiting for its first trigger
    Armed,
    /// Has fired at least once and remains armed
    Fired {
        /// Triggers received since arming
        count: u32,
    },
}

impl BurstState {
    /// Whether the channel is in triggered burst mode.
    pub fn is_armed(self) -> bool {
        !matches!(self, BurstState::Idle)
    }

    /// State after one trigger event.
    pub fn on_trigger(self) -> BurstState {
        match self {
            BurstState::Idle => BurstState::Idle,
            BurstState::Armed => BurstState::Fired { count: 1 },
            BurstState::Fired { count } => BurstState::Fired {
                count: count.saturating_add(1),
            },
        }
    }
}

/// What this session knows about a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    /// Active function
    pub function: WaveFunction,
    /// Output relay state
    pub enabled: bool,
    /// Amplitude in volts peak-to-peak
    pub amplitude: f64,
    /// DC offset in volts
    pub offset: f64,
    /// Burst/trigger state
    pub burst: BurstState,
    /// Source the burst was armed with
    pub trigger_source: Option<TriggerSource>,
}

impl ChannelState {
    /// Apply a software `*TRG`. Only bursts armed on the bus source fire.
    pub fn on_software_trigger(&mut self) {
        if self.trigger_source == Some(TriggerSource::Bus) {
            self.burst = self.burst.on_trigger();
        }
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            function: WaveFunction::Unknown,
            enabled: false,
            amplitude: 0.0,
            offset: 0.0,
            burst: BurstState::Idle,
            trigger_source: None,
        }
    }
}
