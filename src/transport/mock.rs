//! Simulated two-channel function generator.
//!
//! `MockFunctionGenerator` implements [`Transport`] by interpreting the
//! command lines it receives against a small model of the instrument:
//! - per-channel output state, amplitude and selected arbitrary waveform
//! - per-channel volatile memory and a mass-storage file table
//! - a FIFO error queue drained by `SYST:ERR?`
//! - buffer capacities that only take effect on `reopen`, with silent
//!   truncation when a write or a response exceeds the active capacity
//! - one-shot failure injection and a call log for test verification
//!
//! The instrument state lives behind an `Arc`, so tests keep a
//! [`MockHandle`] for inspection after the transport has been moved into a
//! session.

use super::{BufferDirection, Transport};
use crate::error::{AppResult, FgenError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identity string reported by `*IDN?`
pub const MOCK_IDENTITY: &str = "Agilent Technologies,33522B,MY00000000,4.00-1.19-2.00-58-00";

/// Fewest points the simulated instrument accepts for an arbitrary waveform
const MIN_ARB_POINTS: usize = 8;

const NO_ERROR: &str = "+0,\"No error\"";

#[derive(Debug, Clone)]
struct VolatileArb {
    name: String,
    codes: Vec<i16>,
}

#[derive(Debug, Default)]
struct ChannelModel {
    output: bool,
    amplitude: Option<f64>,
    function: Option<String>,
    selected_arb: Option<String>,
    volatile: Vec<VolatileArb>,
}

#[derive(Debug)]
struct MockState {
    identity: String,
    writes: Vec<String>,
    lines: Vec<String>,
    responses: VecDeque<String>,
    errors: VecDeque<String>,
    channels: [ChannelModel; 2],
    files: BTreeMap<String, Vec<i16>>,
    states: BTreeSet<String>,
    requested_capacity: [usize; 2],
    active_capacity: [usize; 2],
    reopen_count: usize,
    trigger_count: usize,
    error_reads: usize,
    fail_next: bool,
}

fn direction_index(direction: BufferDirection) -> usize {
    match direction {
        BufferDirection::Input => 0,
        BufferDirection::Output => 1,
    }
}

impl MockState {
    fn new(capacity: usize) -> Self {
        Self {
            identity: MOCK_IDENTITY.to_string(),
            writes: Vec::new(),
            lines: Vec::new(),
            responses: VecDeque::new(),
            errors: VecDeque::new(),
            channels: [ChannelModel::default(), ChannelModel::default()],
            files: BTreeMap::new(),
            states: BTreeSet::new(),
            requested_capacity: [capacity; 2],
            active_capacity: [capacity; 2],
            reopen_count: 0,
            trigger_count: 0,
            error_reads: 0,
            fail_next: false,
        }
    }

    fn push_error(&mut self, code: i32, message: &str) {
        self.errors.push_back(format!("{:+},\"{}\"", code, message));
    }

    fn respond(&mut self, response: String) {
        let limit = self.active_capacity[direction_index(BufferDirection::Input)];
        if response.len() + 1 > limit {
            // Whatever does not fit is lost
            let mut cut = limit.saturating_sub(1);
            while !response.is_char_boundary(cut) {
                cut -= 1;
            }
            self.responses.push_back(response[..cut].to_string());
        } else {
            self.responses.push_back(response);
        }
    }

    fn channel_mut(&mut self, number: usize) -> Option<&mut ChannelModel> {
        match number {
            1 | 2 => Some(&mut self.channels[number - 1]),
            _ => {
                self.push_error(-114, "Header suffix out of range");
                None
            }
        }
    }

    fn execute(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.lines.push(line.to_string());

        let (header, args) = match line.split_once(char::is_whitespace) {
            Some((h, a)) => (h.to_uppercase(), a.trim().to_string()),
            None => (line.to_uppercase(), String::new()),
        };

        match header.as_str() {
            "SYST:ERR?" => {
                self.error_reads += 1;
                let next = self
                    .errors
                    .pop_front()
                    .unwrap_or_else(|| NO_ERROR.to_string());
                self.respond(next);
                return;
            }
            "*IDN?" => {
                let identity = self.identity.clone();
                self.respond(identity);
                return;
            }
            "*TRG" => {
                self.trigger_count += 1;
                return;
            }
            "MMEM:CAT:DATA:ARB?" => {
                let listing = self.catalog(&unquote(&args));
                self.respond(listing);
                return;
            }
            "MMEM:LOAD:STAT" => {
                if !self.states.contains(&unquote(&args)) {
                    self.push_error(-256, "File name not found");
                }
                return;
            }
            "MMEM:STOR:STAT" => {
                self.states.insert(unquote(&args));
                return;
            }
            _ => {}
        }

        if let Some((n, rest)) = split_channel(&header, "OUTP") {
            if rest.is_empty() {
                let on = matches!(args.to_uppercase().as_str(), "ON" | "1");
                if let Some(channel) = self.channel_mut(n) {
                    channel.output = on;
                }
                return;
            }
        }

        if let Some((n, rest)) = split_channel(&header, "MMEM:STOR:DATA") {
            if rest.is_empty() {
                self.store_data(n, unquote(&args));
                return;
            }
        }

        if let Some((n, rest)) = split_channel(&header, "MMEM:LOAD:DATA") {
            if rest.is_empty() {
                self.load_data(n, unquote(&args));
                return;
            }
        }

        if let Some((n, rest)) = split_channel(&header, "SOUR") {
            self.execute_source(n, rest, &args);
            return;
        }

        if let Some((n, _)) = split_channel(&header, "TRIG") {
            self.channel_mut(n);
            return;
        }

        if header.ends_with('?') {
            self.push_error(-113, "Undefined header");
        }
    }

    fn execute_source(&mut self, n: usize, rest: &str, args: &str) {
        if self.channel_mut(n).is_none() {
            return;
        }
        let index = n - 1;

        match rest {
            ":DATA:VOL:CLE" => {
                let channel = &mut self.channels[index];
                channel.volatile.clear();
                channel.selected_arb = None;
            }
            ":DATA:VOL:CAT?" => {
                let names = &self.channels[index].volatile;
                let listing = if names.is_empty() {
                    "\"\"".to_string()
                } else {
                    names
                        .iter()
                        .map(|arb| format!("\"{}\"", arb.name))
                        .collect::<Vec<_>>()
                        .join(",")
                };
                self.respond(listing);
            }
            ":DATA:ARB:DAC" => self.upload(index, args),
            ":DATA:ATTR:CFAC?" | ":DATA:ATTR:PTP?" => {
                let name = unquote(args);
                let codes = self.channels[index]
                    .volatile
                    .iter()
                    .find(|arb| arb.name == name)
                    .map(|arb| arb.codes.clone());
                match codes {
                    Some(codes) if rest == ":DATA:ATTR:CFAC?" => {
                        self.respond(format!("{:.6}", crest_factor(&codes)))
                    }
                    Some(codes) => self.respond(format!("{:.6}", peak_to_peak(&codes))),
                    None => {
                        self.push_error(-224, "Illegal parameter value");
                        self.respond("+0.0".to_string());
                    }
                }
            }
            ":FUNC:ARB" => {
                let name = unquote(args);
                let channel = &mut self.channels[index];
                if channel.volatile.iter().any(|arb| arb.name == name) {
                    channel.selected_arb = Some(name);
                } else {
                    self.push_error(-224, "Illegal parameter value");
                }
            }
            ":FUNC" => self.channels[index].function = Some(args.to_uppercase()),
            ":VOLT" => match args.parse::<f64>() {
                Ok(volts) => self.channels[index].amplitude = Some(volts),
                Err(_) => self.push_error(-104, "Data type error"),
            },
            _ if rest.starts_with(":APPLY:") => {
                // APPLy turns the output on as a side effect
                let function = rest.trim_start_matches(":APPLY:").to_string();
                let amplitude = args.split(',').nth(1).and_then(|v| v.trim().parse().ok());
                let channel = &mut self.channels[index];
                channel.function = Some(function);
                channel.output = true;
                if amplitude.is_some() {
                    channel.amplitude = amplitude;
                }
            }
            _ if rest.ends_with('?') => self.push_error(-113, "Undefined header"),
            _ => {}
        }
    }

    fn upload(&mut self, index: usize, args: &str) {
        let mut fields = args.split(',');
        let name = fields.next().unwrap_or_default().trim().to_string();
        let codes: Result<Vec<i16>, _> = fields.map(|v| v.trim().parse::<i16>()).collect();

        let codes = match codes {
            Ok(codes) => codes,
            Err(_) => {
                self.push_error(-104, "Data type error");
                return;
            }
        };
        if codes.len() < MIN_ARB_POINTS {
            self.push_error(-222, "Data out of range;not enough points");
            return;
        }
        if self.channels[index].volatile.iter().any(|arb| arb.name == name) {
            self.push_error(-221, "Settings conflict;arb name already exists");
            return;
        }
        self.channels[index].volatile.push(VolatileArb { name, codes });
    }

    fn store_data(&mut self, n: usize, path: String) {
        let Some(channel) = self.channel_mut(n) else {
            return;
        };
        let selected = channel.selected_arb.clone();
        let codes = selected.and_then(|name| {
            channel
                .volatile
                .iter()
                .find(|arb| arb.name == name)
                .map(|arb| arb.codes.clone())
        });
        match codes {
            Some(codes) => {
                self.files.insert(path, codes);
            }
            None => self.push_error(-221, "Settings conflict;no arb selected"),
        }
    }

    fn load_data(&mut self, n: usize, path: String) {
        let Some(codes) = self.files.get(&path).cloned() else {
            self.push_error(-256, "File name not found");
            return;
        };
        if let Some(channel) = self.channel_mut(n) {
            if !channel.volatile.iter().any(|arb| arb.name == path) {
                channel.volatile.push(VolatileArb { name: path, codes });
            }
        }
    }

    fn catalog(&self, folder: &str) -> String {
        let prefix = if folder.ends_with('\\') {
            folder.to_string()
        } else {
            format!("{}\\", folder)
        };
        let entries: Vec<String> = self
            .files
            .iter()
            .filter_map(|(path, codes)| {
                let file = path.strip_prefix(&prefix)?;
                (!file.contains('\\')).then(|| format!("\"{},ARB,{}\"", file, codes.len() * 2))
            })
            .collect();
        let used: usize = self.files.values().map(|codes| codes.len() * 2).sum();
        let mut listing = format!("+{},+{}", used, 64_000_000usize.saturating_sub(used));
        for entry in entries {
            listing.push(',');
            listing.push_str(&entry);
        }
        listing
    }
}

fn unquote(text: &str) -> String {
    text.trim().trim_matches('"').to_string()
}

/// Split `SOUR2:FUNC` into `(2, ":FUNC")` for prefix `SOUR`.
fn split_channel<'a>(header: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = header.strip_prefix(prefix)?;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let number = rest[..digits].parse().ok()?;
    Some((number, &rest[digits..]))
}

fn crest_factor(codes: &[i16]) -> f64 {
    let peak = codes
        .iter()
        .map(|&c| f64::from(c).abs())
        .fold(0.0, f64::max);
    let rms = (codes.iter().map(|&c| f64::from(c).powi(2)).sum::<f64>() / codes.len() as f64).sqrt();
    if rms == 0.0 {
        0.0
    } else {
        peak / rms
    }
}

fn peak_to_peak(codes: &[i16]) -> f64 {
    let max = codes.iter().copied().max().unwrap_or(0);
    let min = codes.iter().copied().min().unwrap_or(0);
    (f64::from(max) - f64::from(min)) / f64::from(i16::MAX)
}

/// Simulated instrument implementing [`Transport`]
pub struct MockFunctionGenerator {
    state: Arc<Mutex<MockState>>,
}

/// Inspection and fault-injection handle shared with a [`MockFunctionGenerator`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockFunctionGenerator {
    /// Create a simulated instrument with 512-byte buffers
    pub fn new() -> Self {
        Self::with_capacity(512)
    }

    /// Create a simulated instrument with the given default capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(capacity))),
        }
    }

    /// Handle for inspecting the instrument after the transport is moved
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockFunctionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockFunctionGenerator {
    async fn write(&mut self, text: &str) -> AppResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(FgenError::Transport("Mock write failure".to_string()));
        }
        state.writes.push(text.to_string());

        let limit = state.active_capacity[direction_index(BufferDirection::Output)];
        if text.len() + 1 > limit {
            tracing::debug!(len = text.len(), limit, "Mock write truncated");
            state.push_error(-223, "Too much data");
            return Ok(());
        }

        for line in text.lines() {
            state.execute(line);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(FgenError::Transport("Mock read failure".to_string()));
        }
        state
            .responses
            .pop_front()
            .ok_or_else(|| FgenError::Transport("Timeout waiting for response".to_string()))
    }

    fn buffer_capacity(&self, direction: BufferDirection) -> usize {
        self.lock().requested_capacity[direction_index(direction)]
    }

    fn set_buffer_capacity(&mut self, direction: BufferDirection, bytes: usize) {
        self.lock().requested_capacity[direction_index(direction)] = bytes;
    }

    async fn reopen(&mut self) -> AppResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(FgenError::Transport("Mock reopen failure".to_string()));
        }
        state.active_capacity = state.requested_capacity;
        state.responses.clear();
        state.reopen_count += 1;
        Ok(())
    }
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every write, as sent
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Every executed command line, in order
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Forget the write and line logs
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.lines.clear();
    }

    /// Queue an instrument error for the next `SYST:ERR?`
    pub fn push_error(&self, code: i32, message: &str) {
        self.lock().push_error(code, message);
    }

    /// Errors still waiting in the queue
    pub fn pending_errors(&self) -> usize {
        self.lock().errors.len()
    }

    /// Number of `SYST:ERR?` queries served
    pub fn error_reads(&self) -> usize {
        self.lock().error_reads
    }

    /// Place a waveform file in mass storage
    pub fn store_file(&self, path: &str, codes: Vec<i16>) {
        self.lock().files.insert(path.to_string(), codes);
    }

    /// Whether mass storage holds `path`
    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    /// Place a state file in mass storage
    pub fn store_state(&self, path: &str) {
        self.lock().states.insert(path.to_string());
    }

    /// Whether mass storage holds state file `path`
    pub fn has_state(&self, path: &str) -> bool {
        self.lock().states.contains(path)
    }

    /// Names resident in a channel's volatile memory
    pub fn volatile(&self, channel: usize) -> Vec<String> {
        self.lock()
            .channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.volatile.iter().map(|arb| arb.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Output state of a channel
    pub fn output(&self, channel: usize) -> bool {
        self.lock()
            .channels
            .get(channel.wrapping_sub(1))
            .is_some_and(|c| c.output)
    }

    /// Last amplitude written to a channel
    pub fn amplitude(&self, channel: usize) -> Option<f64> {
        self.lock()
            .channels
            .get(channel.wrapping_sub(1))
            .and_then(|c| c.amplitude)
    }

    /// Capacity currently in effect (applied by the last reopen)
    pub fn active_capacity(&self, direction: BufferDirection) -> usize {
        self.lock().active_capacity[direction_index(direction)]
    }

    /// Number of reopens
    pub fn reopen_count(&self) -> usize {
        self.lock().reopen_count
    }

    /// Number of `*TRG` commands received
    pub fn trigger_count(&self) -> usize {
        self.lock().trigger_count
    }

    /// Fail the next write, read or reopen
    pub fn trigger_failure(&self) {
        self.lock().fail_next = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_queue_is_fifo_with_sentinel() {
        let mut mock = MockFunctionGenerator::new();
        let handle = mock.handle();
        handle.push_error(-113, "Undefined header");
        handle.push_error(-222, "Data out of range");

        assert_eq!(mock.query("SYST:ERR?").await.unwrap(), "-113,\"Undefined header\"");
        assert_eq!(mock.query("SYST:ERR?").await.unwrap(), "-222,\"Data out of range\"");
        assert_eq!(mock.query("SYST:ERR?").await.unwrap(), NO_ERROR);
        assert_eq!(handle.error_reads(), 3);
    }

    #[tokio::test]
    async fn apply_enables_output() {
        let mut mock = MockFunctionGenerator::new();
        let handle = mock.handle();

        mock.write("SOUR1:APPLY:SIN 1000,0.1,0").await.unwrap();
        assert!(handle.output(1));
        assert_eq!(handle.amplitude(1), Some(0.1));

        mock.write("OUTP1 OFF").await.unwrap();
        assert!(!handle.output(1));
    }

    #[tokio::test]
    async fn oversized_write_is_dropped_until_reopen() {
        let mut mock = MockFunctionGenerator::with_capacity(32);
        let handle = mock.handle();
        let upload = "SOUR1:DATA:ARB:DAC ramp,0,1,2,3,4,5,6,7,8,9";

        mock.write(upload).await.unwrap();
        assert!(handle.volatile(1).is_empty());
        assert_eq!(handle.pending_errors(), 1);

        // Capacity only changes once the link is reopened
        mock.set_buffer_capacity(BufferDirection::Output, 256);
        assert_eq!(handle.active_capacity(BufferDirection::Output), 32);
        mock.reopen().await.unwrap();

        mock.write(upload).await.unwrap();
        assert_eq!(handle.volatile(1), vec!["ramp".to_string()]);
    }

    #[tokio::test]
    async fn long_responses_are_truncated() {
        let mut mock = MockFunctionGenerator::with_capacity(40);
        let handle = mock.handle();
        for name in ["alpha", "beta", "gamma", "delta"] {
            handle.store_file(&format!("INT:\\stim\\{}.arb", name), vec![0; 8]);
        }

        let short = mock.query("MMEM:CAT:DATA:ARB? \"INT:\\stim\"").await.unwrap();
        assert!(short.len() < 40);
        assert!(!short.contains("gamma"));

        mock.set_buffer_capacity(BufferDirection::Input, 4096);
        mock.reopen().await.unwrap();
        let full = mock.query("MMEM:CAT:DATA:ARB? \"INT:\\stim\"").await.unwrap();
        assert!(full.contains("\"gamma.arb,ARB,16\""));
    }

    #[tokio::test]
    async fn failure_is_one_shot() {
        let mut mock = MockFunctionGenerator::new();
        mock.handle().trigger_failure();
        assert!(mock.write("*TRG").await.is_err());
        assert!(mock.write("*TRG").await.is_ok());
        assert_eq!(mock.handle().trigger_count(), 1);
    }

    #[tokio::test]
    async fn store_and_load_round_trip() {
        let mut mock = MockFunctionGenerator::with_capacity(4096);
        let handle = mock.handle();

        mock.write("SOUR1:DATA:ARB:DAC ramp,0,100,200,300,400,500,600,700\nSOUR1:FUNC:ARB ramp\nMMEM:STOR:DATA1 \"INT:\\ramp.arb\"")
            .await
            .unwrap();
        assert!(handle.has_file("INT:\\ramp.arb"));

        mock.write("SOUR2:DATA:VOL:CLE\nMMEM:LOAD:DATA2 \"INT:\\ramp.arb\"")
            .await
            .unwrap();
        assert_eq!(handle.volatile(2), vec!["INT:\\ramp.arb".to_string()]);
        assert_eq!(handle.pending_errors(), 0);
    }

    #[test]
    fn split_channel_suffix() {
        assert_eq!(split_channel("SOUR2:FUNC", "SOUR"), Some((2, ":FUNC")));
        assert_eq!(split_channel("OUTP1", "OUTP"), Some((1, "")));
        assert_eq!(split_channel("SOUR:FUNC", "SOUR"), None);
    }
}
