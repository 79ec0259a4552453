//! Session facade over one function generator.
//!
//! A [`Session`] owns the transport for its whole lifetime and is the only way
//! to mutate the instrument. It is neither `Clone` nor shareable, and every
//! operation takes `&mut self`, so two callers can never interleave command
//! blocks on the same device.
//!
//! ## Operation shape
//!
//! Each mutating operation follows the same path:
//!
//! 1. validate options (configuration errors are returned before anything is
//!    sent)
//! 2. build the [`CommandBlock`] for the operation
//! 3. widen the transport buffer if the payload needs it
//! 4. write the block as one line group
//! 5. drain the instrument error queue once and return the [`ErrorReport`]
//!
//! Instrument-reported errors are therefore never `Err`. They come back in the
//! report and the caller decides whether to reset.
//!
//! ## Voltage safety
//!
//! [`Session::change_voltage`] does not prompt. Above the configured threshold
//! it returns [`VoltageOutcome::ConfirmationRequired`] holding a
//! [`PendingVoltage`] token; pass the token to [`Session::confirm_voltage`] to
//! apply it, or drop it to abort.

use crate::buffer::with_buffer;
use crate::catalog;
use crate::channel::{BurstState, Channel, ChannelState, WaveFunction};
use crate::commands::{self, Attribute, CommandBlock, VoltageGuard};
use crate::config::FgenConfig;
use crate::error::{AppResult, FgenError};
use crate::error_monitor::{check_errors, ErrorReport};
use crate::logging::DIAGNOSTICS_TARGET;
use crate::options::{
    LoadWaveformOptions, ModulationOptions, OperationOptions, PulseOptions, PulseTiming,
    StateOptions, TriggerOptions, UploadOptions,
};
use crate::transport::{BufferDirection, Transport};
use crate::waveform::Waveform;
use std::collections::BTreeSet;

/// Result of a voltage change request
#[derive(Debug)]
#[must_use]
pub enum VoltageOutcome {
    /// The new amplitude was sent
    Applied(ErrorReport),
    /// The amplitude is above the safety threshold and nothing was sent
    ConfirmationRequired(PendingVoltage),
}

impl VoltageOutcome {
    /// The report of an applied change, or `FgenError::UnsafeVoltage` if the
    /// change is still waiting for confirmation.
    pub fn into_applied(self) -> AppResult<ErrorReport> {
        match self {
            VoltageOutcome::Applied(report) => Ok(report),
            VoltageOutcome::ConfirmationRequired(pending) => Err(FgenError::UnsafeVoltage {
                requested: pending.volts,
                threshold: pending.threshold,
            }),
        }
    }
}

/// A voltage change held back for confirmation
///
/// Consumed by [`Session::confirm_voltage`]. Dropping it aborts the change.
#[derive(Debug, PartialEq)]
#[must_use = "dropping a pending voltage change aborts it"]
pub struct PendingVoltage {
    channel: Channel,
    volts: f64,
    threshold: f64,
}

impl PendingVoltage {
    /// Target channel
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Requested amplitude in volts
    pub fn volts(&self) -> f64 {
        self.volts
    }

    /// Threshold that was exceeded
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Exclusive control session for one instrument
pub struct Session<T: Transport> {
    transport: T,
    config: FgenConfig,
    guard: VoltageGuard,
    identity: String,
    channels: [ChannelState; 2],
}

impl<T: Transport> Session<T> {
    /// Take ownership of a connected transport and identify the instrument.
    ///
    /// Errors left in the instrument queue by earlier sessions are drained and
    /// logged so they are not blamed on the first operation.
    ///
    /// # Errors
    /// Transport failures, or `FgenError::UnexpectedResponse` if the
    /// instrument does not identify itself.
    pub async fn open(mut transport: T, config: FgenConfig) -> AppResult<Self> {
        let identity = transport.query(commands::IDENTITY_QUERY).await?;
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            return Err(FgenError::UnexpectedResponse {
                query: commands::IDENTITY_QUERY.to_string(),
                response: identity,
            });
        }
        tracing::info!(target: DIAGNOSTICS_TARGET, %identity, "Connected to function generator");

        let stale = check_errors(&mut transport, config.buffers.max_error_reads).await?;
        if stale.had_error() {
            tracing::warn!(
                target: DIAGNOSTICS_TARGET,
                count = stale.errors.len(),
                "Discarded errors queued before this session"
            );
        }

        Ok(Self {
            guard: VoltageGuard::from_config(&config.safety),
            transport,
            config,
            identity,
            channels: [ChannelState::default(), ChannelState::default()],
        })
    }

    /// Identity string reported at open
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Configuration this session was opened with
    pub fn config(&self) -> &FgenConfig {
        &self.config
    }

    /// What this session last set on `channel`
    pub fn channel_state(&self, channel: Channel) -> &ChannelState {
        &self.channels[channel.index()]
    }

    /// Give the transport back, ending the session.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn state_mut(&mut self, channel: Channel) -> &mut ChannelState {
        &mut self.channels[channel.index()]
    }

    async fn send(&mut self, operation: &str, block: &CommandBlock) -> AppResult<ErrorReport> {
        for line in block.lines() {
            tracing::debug!(operation, %line, "Sending command");
        }
        self.transport.write(&block.render()).await?;
        self.drain(operation).await
    }

    async fn drain(&mut self, operation: &str) -> AppResult<ErrorReport> {
        let report = check_errors(&mut self.transport, self.config.buffers.max_error_reads).await?;
        if report.had_error() {
            tracing::warn!(operation, errors = %report, "Instrument reported errors");
        }
        Ok(report)
    }

    fn advance_bursts(&mut self) {
        for state in &mut self.channels {
            state.on_software_trigger();
        }
    }

    // =========================================================================
    // Output control
    // =========================================================================

    /// Enable the outputs of `channels`. No trigger is sent.
    pub async fn go(&mut self, channels: &[Channel]) -> AppResult<ErrorReport> {
        require_channels(channels)?;
        let report = self.send("go", &commands::go(channels)).await?;
        for &channel in channels {
            self.state_mut(channel).enabled = true;
        }
        Ok(report)
    }

    /// Disable the outputs of `channels`, then send a software trigger.
    ///
    /// The trigger advances bursts armed on the bus source only.
    pub async fn stop(&mut self, channels: &[Channel]) -> AppResult<ErrorReport> {
        require_channels(channels)?;
        let report = self.send("stop", &commands::stop(channels)).await?;
        for &channel in channels {
            self.state_mut(channel).enabled = false;
        }
        self.advance_bursts();
        Ok(report)
    }

    /// Send a software trigger. Bursts armed on the bus source fire; external
    /// and timer sourced bursts do not react to it.
    pub async fn trigger(&mut self) -> AppResult<ErrorReport> {
        let block: CommandBlock = std::iter::once(commands::SOFTWARE_TRIGGER).collect();
        let report = self.send("trigger", &block).await?;
        self.advance_bursts();
        Ok(report)
    }

    /// Idle sine on both channels, outputs off, volatile memory cleared.
    pub async fn reset(&mut self) -> AppResult<ErrorReport> {
        let defaults = self.config.defaults.clone();
        let report = self.send("reset", &commands::reset(&defaults)).await?;
        for state in &mut self.channels {
            *state = ChannelState {
                function: WaveFunction::Sine {
                    frequency: defaults.frequency_hz,
                },
                enabled: false,
                amplitude: defaults.amplitude_volts,
                offset: defaults.offset_volts,
                burst: BurstState::Idle,
                trigger_source: None,
            };
        }
        Ok(report)
    }

    // =========================================================================
    // Stimulation modes
    // =========================================================================

    /// Configure a pulse train; the output is left off.
    ///
    /// # Errors
    /// `FgenError::InsufficientPulseParameters` unless exactly two timing
    /// values are given. Nothing is sent in that case.
    pub async fn configure_pulse(&mut self, options: &PulseOptions) -> AppResult<ErrorReport> {
        options.validate()?;
        let timing = PulseTiming::derive(options)?;
        tracing::debug!(?timing, channel = %options.channel, "Derived pulse timing");

        let report = self
            .send("configure_pulse", &commands::pulse(options, &timing))
            .await?;
        let state = self.state_mut(options.channel);
        state.function = WaveFunction::Pulse {
            frequency: timing.repetition_frequency,
            width: timing.width_seconds(),
        };
        state.enabled = false;
        state.amplitude = options.amplitude;
        state.offset = options.offset;
        Ok(report)
    }

    /// Amplitude-modulate the carrier channel by the other one; the carrier
    /// output is left off.
    pub async fn configure_modulation(
        &mut self,
        options: &ModulationOptions,
    ) -> AppResult<ErrorReport> {
        options.validate()?;
        let report = self
            .send("configure_modulation", &commands::modulation(options))
            .await?;
        let state = self.state_mut(options.carrier());
        state.function = WaveFunction::Modulated {
            source: options.modulating_channel,
            depth: options.depth,
        };
        state.enabled = false;
        Ok(report)
    }

    /// Arm single-cycle triggered bursts on the selected channels.
    pub async fn configure_trigger(&mut self, options: &TriggerOptions) -> AppResult<ErrorReport> {
        options.validate()?;
        let report = self
            .send("configure_trigger", &commands::burst(options))
            .await?;
        for &channel in &options.channels {
            let state = self.state_mut(channel);
            state.burst = BurstState::Armed;
            state.trigger_source = Some(options.source);
        }
        Ok(report)
    }

    // =========================================================================
    // Waveforms and states
    // =========================================================================

    /// Make the stored waveform `name` the channel's active function.
    ///
    /// The file is only read from mass storage when it is not already in the
    /// channel's volatile memory.
    pub async fn load_waveform(
        &mut self,
        name: &str,
        options: &LoadWaveformOptions,
    ) -> AppResult<ErrorReport> {
        options.validate()?;
        require_name(name)?;
        let storage = &self.config.storage;
        let folder = options.folder.as_deref().unwrap_or(&storage.folder);
        let path = storage.file_path(folder, name, &storage.waveform_extension);

        let resident = catalog::check_memory(
            &mut self.transport,
            options.channel,
            &path,
            self.config.buffers.catalog_bytes,
        )
        .await?;
        let block = commands::load_waveform(&path, resident, options);
        let report = self.send("load_waveform", &block).await?;

        let state = self.state_mut(options.channel);
        state.function = WaveFunction::Arbitrary {
            name: path,
            sample_rate: options.sample_rate,
        };
        state.enabled = false;
        state.amplitude = options.amplitude;
        state.offset = options.offset;
        Ok(report)
    }

    /// Recall the stored instrument state `name`.
    ///
    /// The recalled settings are not read back, so both channels become
    /// [`WaveFunction::Unknown`].
    pub async fn load_state(&mut self, name: &str, options: &StateOptions) -> AppResult<ErrorReport> {
        let path = self.state_path(name, options)?;
        let report = self.send("load_state", &commands::load_state(&path)).await?;
        self.channels = [ChannelState::default(), ChannelState::default()];
        Ok(report)
    }

    /// Save the instrument state as `name`.
    pub async fn store_state(&mut self, name: &str, options: &StateOptions) -> AppResult<ErrorReport> {
        let path = self.state_path(name, options)?;
        self.send("store_state", &commands::store_state(&path)).await
    }

    fn state_path(&self, name: &str, options: &StateOptions) -> AppResult<String> {
        options.validate()?;
        require_name(name)?;
        let storage = &self.config.storage;
        let folder = options.folder.as_deref().unwrap_or(&storage.folder);
        Ok(storage.file_path(folder, name, &storage.state_extension))
    }

    /// Upload samples as arbitrary waveform `name` and make it the channel's
    /// active function at `sample_rate`.
    ///
    /// The DAC data goes out under an output buffer widened to the payload
    /// size. With `persist` set, the waveform is also stored to
    /// `<folder>\<name>.<ext>`.
    pub async fn upload_waveform(
        &mut self,
        name: &str,
        samples: Vec<f64>,
        sample_rate: f64,
        options: &UploadOptions,
    ) -> AppResult<ErrorReport> {
        options.validate()?;
        let waveform = Waveform::new(name, samples, sample_rate)?;
        let encoded = waveform.encode();
        let channel = options.channel;

        let payload = commands::arb_data(channel, waveform.name(), &encoded);
        let payload_bytes = payload.len() + 1;
        tracing::info!(
            name = waveform.name(),
            points = encoded.codes.len(),
            bytes = payload_bytes,
            %channel,
            "Uploading arbitrary waveform"
        );
        with_buffer(
            &mut self.transport,
            BufferDirection::Output,
            payload_bytes,
            move |t| Box::pin(async move { t.write(&payload).await }),
        )
        .await?;

        let storage = &self.config.storage;
        let store_path = options.persist.then(|| {
            let folder = options.folder.as_deref().unwrap_or(&storage.folder);
            storage.file_path(folder, waveform.name(), &storage.waveform_extension)
        });
        let block = commands::arb_activate(
            channel,
            waveform.name(),
            Some(waveform.sample_rate()),
            options.amplitude,
            options.offset,
            store_path.as_deref(),
        );
        let report = self.send("upload_waveform", &block).await?;

        let state = self.state_mut(channel);
        state.function = WaveFunction::Arbitrary {
            name: waveform.name().to_string(),
            sample_rate: Some(waveform.sample_rate()),
        };
        state.enabled = false;
        state.amplitude = options.amplitude;
        state.offset = options.offset;
        Ok(report)
    }

    // =========================================================================
    // Voltage
    // =========================================================================

    /// Change a channel's amplitude.
    ///
    /// Above the safety threshold nothing is sent and the change is returned
    /// as a [`PendingVoltage`] for the caller to confirm or drop.
    ///
    /// # Errors
    /// `FgenError::Configuration` for a non-positive or non-finite amplitude.
    pub async fn change_voltage(&mut self, channel: Channel, volts: f64) -> AppResult<VoltageOutcome> {
        if volts.is_nan() || volts <= 0.0 || volts.is_infinite() {
            return Err(FgenError::Configuration(format!(
                "amplitude must be a positive number, got {}",
                volts
            )));
        }
        if self.guard.requires_confirmation(volts) {
            tracing::warn!(
                %channel,
                volts,
                threshold = self.guard.threshold(),
                "Voltage change held for confirmation"
            );
            return Ok(VoltageOutcome::ConfirmationRequired(PendingVoltage {
                channel,
                volts,
                threshold: self.guard.threshold(),
            }));
        }
        self.apply_voltage(channel, volts)
            .await
            .map(VoltageOutcome::Applied)
    }

    /// Apply a voltage change that was held for confirmation.
    pub async fn confirm_voltage(&mut self, pending: PendingVoltage) -> AppResult<ErrorReport> {
        tracing::info!(channel = %pending.channel, volts = pending.volts, "Voltage change confirmed");
        self.apply_voltage(pending.channel, pending.volts).await
    }

    async fn apply_voltage(&mut self, channel: Channel, volts: f64) -> AppResult<ErrorReport> {
        let report = self
            .send("change_voltage", &commands::voltage(channel, volts))
            .await?;
        self.state_mut(channel).amplitude = volts;
        Ok(report)
    }

    // =========================================================================
    // Memory and catalog
    // =========================================================================

    /// Disable the output and clear the channel's volatile memory.
    pub async fn clear_memory(&mut self, channel: Channel) -> AppResult<ErrorReport> {
        let report = self
            .send("clear_memory", &commands::clear_memory(channel))
            .await?;
        let state = self.state_mut(channel);
        state.enabled = false;
        if matches!(state.function, WaveFunction::Arbitrary { .. }) {
            state.function = WaveFunction::Unknown;
        }
        Ok(report)
    }

    /// Whether `name` appears in the channel's volatile-memory catalog.
    pub async fn is_resident(&mut self, channel: Channel, name: &str) -> AppResult<bool> {
        let catalog_bytes = self.config.buffers.catalog_bytes;
        catalog::check_memory(&mut self.transport, channel, name, catalog_bytes).await
    }

    /// Names in the channel's volatile memory.
    pub async fn resident_waveforms(&mut self, channel: Channel) -> AppResult<Vec<String>> {
        let catalog_bytes = self.config.buffers.catalog_bytes;
        catalog::resident_waveforms(&mut self.transport, channel, catalog_bytes).await
    }

    /// Names of the waveforms stored in `folder` (the configured folder when
    /// `None`).
    pub async fn list_waveforms(&mut self, folder: Option<&str>) -> AppResult<BTreeSet<String>> {
        let storage = &self.config.storage;
        let folder_path = storage.folder_path(folder.unwrap_or(&storage.folder));
        let extension = storage.waveform_extension.clone();
        let catalog_bytes = self.config.buffers.catalog_bytes;
        catalog::list_waveforms(&mut self.transport, &folder_path, &extension, catalog_bytes).await
    }

    /// Crest factor of a resident waveform; `None` if it is not resident.
    pub async fn crest_factor(&mut self, channel: Channel, name: &str) -> AppResult<Option<f64>> {
        self.attribute(channel, name, Attribute::CrestFactor).await
    }

    /// Peak-to-peak of a resident waveform; `None` if it is not resident.
    pub async fn peak_to_peak(&mut self, channel: Channel, name: &str) -> AppResult<Option<f64>> {
        self.attribute(channel, name, Attribute::PeakToPeak).await
    }

    async fn attribute(
        &mut self,
        channel: Channel,
        name: &str,
        attribute: Attribute,
    ) -> AppResult<Option<f64>> {
        let catalog_bytes = self.config.buffers.catalog_bytes;
        catalog::query_attribute(&mut self.transport, channel, name, attribute, catalog_bytes).await
    }
}

fn require_channels(channels: &[Channel]) -> AppResult<()> {
    if channels.is_empty() {
        return Err(FgenError::Configuration(
            "at least one channel must be selected".to_string(),
        ));
    }
    Ok(())
}

fn require_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() || name.contains(['"', '\\']) {
        return Err(FgenError::Configuration(format!(
            "invalid file name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TriggerSource;
    use crate::transport::MockFunctionGenerator;

    async fn open() -> (Session<MockFunctionGenerator>, crate::transport::mock::MockHandle) {
        let mock = MockFunctionGenerator::new();
        let handle = mock.handle();
        let session = Session::open(mock, FgenConfig::default()).await.unwrap();
        handle.clear_log();
        (session, handle)
    }

    #[tokio::test]
    async fn open_records_identity_and_drains_stale_errors() {
        let mock = MockFunctionGenerator::new();
        let handle = mock.handle();
        handle.push_error(-113, "Undefined header");

        let session = Session::open(mock, FgenConfig::default()).await.unwrap();
        assert!(session.identity().contains("33522B"));
        assert_eq!(handle.pending_errors(), 0);
    }

    #[tokio::test]
    async fn every_operation_drains_the_queue_once() {
        let (mut session, handle) = open().await;
        session.go(&[Channel::One]).await.unwrap();
        assert_eq!(handle.error_reads(), 2);
        assert_eq!(
            handle.lines(),
            vec!["OUTP1 ON".to_string(), "SYST:ERR?".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_channel_selection_sends_nothing() {
        let (mut session, handle) = open().await;
        assert!(session.go(&[]).await.unwrap_err().is_configuration());
        assert!(handle.writes().is_empty());
    }

    #[tokio::test]
    async fn stop_advances_bus_armed_bursts() {
        let (mut session, _handle) = open().await;
        let options = TriggerOptions {
            source: TriggerSource::Bus,
            ..Default::default()
        };
        session.configure_trigger(&options).await.unwrap();
        assert_eq!(session.channel_state(Channel::One).burst, BurstState::Armed);

        session.stop(&Channel::ALL).await.unwrap();
        assert_eq!(
            session.channel_state(Channel::Two).burst,
            BurstState::Fired { count: 1 }
        );
    }

    #[tokio::test]
    async fn external_bursts_ignore_software_triggers() {
        let (mut session, handle) = open().await;
        session
            .configure_trigger(&TriggerOptions::default())
            .await
            .unwrap();

        session.trigger().await.unwrap();
        session.stop(&Channel::ALL).await.unwrap();
        assert_eq!(handle.trigger_count(), 2);
        for channel in Channel::ALL {
            assert_eq!(session.channel_state(channel).burst, BurstState::Armed);
        }
    }

    #[tokio::test]
    async fn unsafe_voltage_outcome_converts_to_error() {
        let (mut session, handle) = open().await;
        let outcome = session.change_voltage(Channel::One, 2.0).await.unwrap();
        let err = outcome.into_applied().unwrap_err();
        assert!(matches!(err, FgenError::UnsafeVoltage { .. }));
        assert!(err.is_configuration());
        assert!(handle.writes().is_empty());
    }
}
