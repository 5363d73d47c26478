//! Instrument driver: command/acknowledge exchanges over a [`Transport`].
//!
//! Every command is answered by zero or more reply frames and one
//! acknowledgement frame. [`Instrument::exchange`] writes a command and reads
//! until that acknowledgement arrives, keeping any surplus bytes for the next
//! exchange. Configuration is applied setting by setting; a rejected setting
//! is reported and the remaining ones are still sent.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, info, warn};
use num_enum::FromPrimitive;

use crate::acquisition::{run_measurement, Pipeline, RunSummary};
use crate::codec::{decode_reply_frame, AckOutcome, AckStatus, CommandFrame, RawFrame};
use crate::config::{
    build_output_config, CommandBuilder, ConfigCommand, Configuration, OutputConfig,
    SweepDefaults,
};
use crate::errors::DriverError;
use crate::query::{
    apply_output_reply, output_query_command, ConfigurationSnapshot, QueryGroup, OUTPUT_QUERIES,
};
use crate::transport::{drain, open_serial, read_chunk, write_frame, Transport, READ_CHUNK_SIZE};

/// Most data frames accepted ahead of one acknowledgement.
pub const MAX_REPLY_FRAMES: usize = 256;

// ============================================================================
// Data Types
// ============================================================================

/// Reply to one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Data frames that preceded the acknowledgement.
    pub frames: Vec<RawFrame>,
    pub outcome: AckOutcome,
}

/// What happened to one configuration setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingOutcome {
    pub setting: &'static str,
    /// Device acknowledgement, or why none was read.
    pub reply: std::result::Result<AckOutcome, String>,
}

impl SettingOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.reply, Ok(AckOutcome::Success))
    }
}

impl fmt::Display for SettingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reply {
            Ok(outcome) => write!(f, "{}: {}", self.setting, outcome),
            Err(reason) => write!(f, "{}: no reply ({})", self.setting, reason),
        }
    }
}

// ============================================================================
// Instrument
// ============================================================================

/// Driver for one instrument on one transport.
///
/// # Example
/// ```ignore
/// let mut device = Instrument::connect_serial("/dev/ttyUSB0", 9600, Duration::from_secs(2))?;
/// for outcome in device.configure(&config)? {
///     println!("{outcome}");
/// }
/// let snapshot = device.query_configuration()?;
/// ```
pub struct Instrument {
    transport: Box<dyn Transport>,
    pending: BytesMut,
    builder: CommandBuilder,
}

impl Instrument {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a serial port (e.g. `/dev/ttyUSB0`, `COM3`).
    pub fn connect_serial(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let transport = open_serial(path, baud_rate, timeout)
            .with_context(|| format!("Failed to open serial port at {path}"))?;
        Ok(Self::from_transport(transport))
    }

    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: BytesMut::with_capacity(READ_CHUNK_SIZE),
            builder: CommandBuilder::default(),
        }
    }

    /// Use `defaults` for sweeps sent without a frequency count or scale.
    pub fn with_sweep_defaults(mut self, defaults: SweepDefaults) -> Self {
        self.builder = CommandBuilder::new(defaults);
        self
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Write `command` and read its reply up to the acknowledgement.
    pub fn exchange(&mut self, command: &CommandFrame) -> Result<Reply> {
        self.try_exchange(command).with_context(|| {
            format!(
                "command {:#04X}/{:#04X} failed",
                command.marker(),
                command.subcommand()
            )
        })
    }

    /// Reset the device, then send every setting present in `config`.
    ///
    /// Invalid values are rejected before anything is written. Once writing
    /// starts, only a failing transport aborts; device rejections and missing
    /// replies are returned per setting.
    pub fn configure(&mut self, config: &Configuration) -> Result<Vec<SettingOutcome>> {
        let commands = self
            .builder
            .build_reset_and_configure(config)
            .context("Invalid measurement configuration")?;
        self.apply_commands(commands)
    }

    /// Send every output option present in `config`.
    pub fn set_output_config(&mut self, config: &OutputConfig) -> Result<Vec<SettingOutcome>> {
        let commands = build_output_config(config).context("Invalid output configuration")?;
        self.apply_commands(commands)
    }

    /// Read back the measurement setup, one query per group.
    ///
    /// Groups the device rejects or answers with an unreadable payload keep
    /// their default value and are logged.
    pub fn query_configuration(&mut self) -> Result<ConfigurationSnapshot> {
        let mut snapshot = ConfigurationSnapshot::default();
        for group in QueryGroup::ALL {
            let command = group.command()?;
            let reply = match self.query(&command)? {
                Some(reply) => reply,
                None => continue,
            };
            if !reply.outcome.is_success() {
                warn!("query {}: {}", group.name(), reply.outcome);
                continue;
            }
            match snapshot.apply(group, &reply.frames) {
                Ok(()) => debug!("query {}: ok ({} frames)", group.name(), reply.frames.len()),
                Err(err) => warn!("query {}: {err}", group.name()),
            }
        }
        info!(
            "device configuration: {} Hz-{} Hz x{} {:?}, {} A, {} Hz, sequence {:?}",
            snapshot.fmin,
            snapshot.fmax,
            snapshot.fcount,
            snapshot.ftype,
            snapshot.amplitude,
            snapshot.frame_rate,
            snapshot
                .excitation_sequence
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
        Ok(snapshot)
    }

    /// Read back the output options.
    pub fn query_output_config(&mut self) -> Result<OutputConfig> {
        let mut config = OutputConfig::default();
        for (name, subcommand) in OUTPUT_QUERIES {
            let command = output_query_command(subcommand)?;
            let reply = match self.query(&command)? {
                Some(reply) => reply,
                None => continue,
            };
            if !reply.outcome.is_success() {
                warn!("query {name}: {}", reply.outcome);
                continue;
            }
            if let Err(err) = apply_output_reply(&mut config, subcommand, &reply.frames) {
                warn!("query {name}: {err}");
            }
        }
        Ok(config)
    }

    /// Read what the device has buffered and report the first status message in it.
    ///
    /// `None` means the buffer held no message.
    pub fn read_system_message(&mut self) -> Result<Option<AckStatus>> {
        let received = drain(self.transport.as_mut()).context("Failed to read system message")?;
        self.pending.extend_from_slice(&received);
        let mut status = None;
        while let Some(frame) = decode_reply_frame(&mut self.pending) {
            if frame.is_ack() && status.is_none() {
                status = frame.kind().map(AckStatus::from_primitive);
            }
        }
        match status {
            Some(status) => info!("system message: {status}"),
            None => info!("no message inside the message buffer"),
        }
        Ok(status)
    }

    /// Start a measurement and run it until the device goes quiet.
    pub fn acquire(&mut self, pipeline: Pipeline<'_>) -> Result<RunSummary> {
        if !self.pending.is_empty() {
            warn!(
                "discarding {} unread bytes before measurement: {:02X?}",
                self.pending.len(),
                &self.pending[..]
            );
            self.pending.clear();
        }
        run_measurement(self.transport.as_mut(), pipeline).context("Measurement run failed")
    }

    // ------------------------------------------------------------------------
    // Internal Helpers
    // ------------------------------------------------------------------------

    fn apply_commands(&mut self, commands: Vec<ConfigCommand>) -> Result<Vec<SettingOutcome>> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for ConfigCommand { setting, frame } in commands {
            let reply = match self.try_exchange(&frame) {
                Ok(reply) => Ok(reply.outcome),
                Err(err @ (DriverError::Io(_) | DriverError::Serial(_))) => {
                    return Err(err).with_context(|| format!("Failed to send {setting}"));
                }
                Err(err) => Err(err.to_string()),
            };
            let outcome = SettingOutcome { setting, reply };
            if outcome.is_applied() {
                info!("{outcome}");
            } else {
                warn!("{outcome}");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Exchange that only fails on a dead transport; a missing reply is `None`.
    fn query(&mut self, command: &CommandFrame) -> Result<Option<Reply>> {
        match self.try_exchange(command) {
            Ok(reply) => Ok(Some(reply)),
            Err(err @ (DriverError::Io(_) | DriverError::Serial(_))) => Err(err.into()),
            Err(err) => {
                warn!(
                    "no reply to query {:#04X}/{:#04X}: {err}",
                    command.marker(),
                    command.subcommand()
                );
                Ok(None)
            }
        }
    }

    fn try_exchange(&mut self, command: &CommandFrame) -> crate::errors::Result<Reply> {
        write_frame(self.transport.as_mut(), &command.to_bytes())?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> crate::errors::Result<Reply> {
        let mut frames = Vec::new();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            while let Some(frame) = decode_reply_frame(&mut self.pending) {
                if frame.is_ack() {
                    let outcome = frame.ack_outcome()?;
                    return Ok(Reply { frames, outcome });
                }
                if frames.len() == MAX_REPLY_FRAMES {
                    return Err(DriverError::Protocol(format!(
                        "more than {MAX_REPLY_FRAMES} reply frames without an acknowledgement"
                    )));
                }
                frames.push(frame);
            }
            let n = read_chunk(self.transport.as_mut(), &mut buf)?;
            if n == 0 {
                return Err(DriverError::Timeout(format!(
                    "no acknowledgement after {} reply frames (pending={:02X?})",
                    frames.len(),
                    &self.pending[..]
                )));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    const ACK_OK: [u8; 4] = [0x18, 0x01, 0x83, 0x18];
    const ACK_NOT_EXECUTED: [u8; 4] = [0x18, 0x01, 0x81, 0x18];

    /// Answers the n-th write with the n-th scripted reply.
    struct Scripted {
        replies: VecDeque<Vec<u8>>,
        readable: VecDeque<u8>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Vec<u8>>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let this = Self {
                replies: replies.into(),
                readable: VecDeque::new(),
                written: Arc::clone(&written),
            };
            (this, written)
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.readable.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            }
            let n = buf.len().min(self.readable.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.readable.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().push(buf.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.readable.extend(reply);
            }
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn instrument(replies: Vec<Vec<u8>>) -> (Instrument, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (transport, written) = Scripted::new(replies);
        (Instrument::from_transport(Box::new(transport)), written)
    }

    #[test]
    fn test_exchange_collects_frames_before_ack() {
        let mut reply = vec![0xB1, 0x03, 0x02, 0x00, 0x05, 0xB1];
        reply.extend_from_slice(&ACK_OK);
        let (mut device, _) = instrument(vec![reply]);
        let command = QueryGroup::BurstCount.command().unwrap();
        let reply = device.exchange(&command).unwrap();
        assert_eq!(reply.outcome, AckOutcome::Success);
        assert_eq!(reply.frames.len(), 1);
        assert_eq!(reply.frames[0].body(), &[0x00, 0x05]);
    }

    #[test]
    fn test_exchange_times_out_without_ack() {
        let (mut device, _) = instrument(vec![vec![0xB1, 0x03]]);
        let command = QueryGroup::BurstCount.command().unwrap();
        let err = device.exchange(&command).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::Timeout(_))
        ));
    }

    #[test]
    fn test_exchange_gives_up_on_endless_reply() {
        let frame = [0xB1, 0x02, 0x02, 0x00, 0xB1];
        let reply = frame.repeat(MAX_REPLY_FRAMES + 1);
        let (mut device, _) = instrument(vec![reply]);
        let command = QueryGroup::BurstCount.command().unwrap();
        let err = device.exchange(&command).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn test_configure_continues_after_rejection() {
        let config = Configuration {
            burst_count: Some(10),
            frame_rate: Some(5.0),
            ..Default::default()
        };
        let (mut device, written) = instrument(vec![
            ACK_OK.to_vec(),
            ACK_NOT_EXECUTED.to_vec(),
            ACK_OK.to_vec(),
        ]);
        let outcomes = device.configure(&config).unwrap();

        assert_eq!(written.lock().unwrap().len(), 3);
        let names: Vec<_> = outcomes.iter().map(|o| o.setting).collect();
        assert_eq!(names, vec!["All Parameters", "Burst Count", "Frame Rate"]);
        assert!(outcomes[0].is_applied());
        assert_eq!(
            outcomes[1].reply,
            Ok(AckOutcome::Failure(AckStatus::NotExecuted))
        );
        assert!(outcomes[2].is_applied());
    }

    #[test]
    fn test_configure_reports_missing_reply_per_setting() {
        let config = Configuration {
            adc_range: Some(crate::config::AdcRange::Pm5V),
            ..Default::default()
        };
        let (mut device, written) = instrument(vec![Vec::new(), ACK_OK.to_vec()]);
        let outcomes = device.configure(&config).unwrap();
        assert_eq!(written.lock().unwrap().len(), 2);
        assert!(outcomes[0].reply.is_err());
        assert!(outcomes[1].is_applied());
    }

    #[test]
    fn test_invalid_configuration_writes_nothing() {
        let config = Configuration {
            frame_rate: Some(500.0),
            ..Default::default()
        };
        let (mut device, written) = instrument(Vec::new());
        assert!(device.configure(&config).is_err());
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_query_configuration_keeps_defaults_on_rejection() {
        let mut replies: Vec<Vec<u8>> = QueryGroup::ALL
            .iter()
            .map(|_| ACK_NOT_EXECUTED.to_vec())
            .collect();
        // Burst count is the last group queried.
        let last = replies.len() - 1;
        replies[last] = vec![0xB1, 0x03, 0x02, 0x00, 0x2A, 0xB1];
        replies[last].extend_from_slice(&ACK_OK);

        let (mut device, written) = instrument(replies);
        let snapshot = device.query_configuration().unwrap();
        assert_eq!(written.lock().unwrap().len(), QueryGroup::ALL.len());
        assert_eq!(snapshot.burst_count, 42);
        assert_eq!(snapshot.fcount, ConfigurationSnapshot::default().fcount);
    }

    #[test]
    fn test_query_output_config() {
        let replies = vec![
            [vec![0xB3, 0x02, 0x01, 0x01, 0xB3], ACK_OK.to_vec()].concat(),
            [vec![0xB3, 0x02, 0x02, 0x00, 0xB3], ACK_OK.to_vec()].concat(),
            [vec![0xB3, 0x02, 0x03, 0x01, 0xB3], ACK_OK.to_vec()].concat(),
        ];
        let (mut device, _) = instrument(replies);
        let config = device.query_output_config().unwrap();
        assert_eq!(
            config,
            OutputConfig {
                excitation_setting: Some(true),
                frequency_row: Some(false),
                timestamp: Some(true),
            }
        );
    }

    #[test]
    fn test_read_system_message() {
        let (transport, _) = Scripted::new(Vec::new());
        let mut transport = transport;
        transport.readable.extend([0x00, 0x18, 0x01, 0x84, 0x18]);
        let mut device = Instrument::from_transport(Box::new(transport));
        assert_eq!(
            device.read_system_message().unwrap(),
            Some(AckStatus::SystemReady)
        );
        assert_eq!(device.read_system_message().unwrap(), None);
    }
}
