//! Measurement configuration and the commands that apply it.
//!
//! A [`Configuration`] mirrors the instrument's "set parameter" commands.
//! Every field is optional: the builder always resets the device first and
//! then sends only the fields that are present, so anything left out keeps
//! the device's power-on default.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{encode, CommandFrame, CommandMarker, Field};
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Subcommands of the set/get parameter markers (`0xB0`/`0xB1`).
pub mod parameter {
    pub const RESET: u8 = 0x01;
    pub const BURST_COUNT: u8 = 0x02;
    pub const FRAME_RATE: u8 = 0x03;
    pub const EXCITATION_FREQUENCIES: u8 = 0x04;
    pub const EXCITATION_AMPLITUDE: u8 = 0x05;
    pub const EXCITATION_SEQUENCE: u8 = 0x06;
    pub const MEASURE_MODE: u8 = 0x08;
    pub const SWITCH_TYPE: u8 = 0x0C;
    pub const ADC_RANGE: u8 = 0x0D;
}

/// Subcommands of the set/get output-config markers (`0xB2`/`0xB3`).
pub mod output_option {
    pub const EXCITATION_SETTING: u8 = 0x01;
    pub const FREQUENCY_ROW: u8 = 0x02;
    pub const TIMESTAMP: u8 = 0x03;
}

/// Measurement control subcommands (marker `0xB4`).
pub mod measurement {
    pub const STOP: u8 = 0x00;
    pub const START: u8 = 0x01;
}

/// Device defaults after a parameter reset.
pub mod defaults {
    use super::{AdcRange, MeasureMode, SwitchType};

    /// Zero bursts means continuous streaming.
    pub const BURST_COUNT: u16 = 0;
    pub const FRAME_RATE_HZ: f32 = 1.0;
    pub const FREQUENCY_MIN_HZ: f32 = 100_000.0;
    pub const FREQUENCY_MAX_HZ: f32 = 100_000.0;
    pub const AMPLITUDE_A: f64 = 0.01;
    pub const MEASURE_MODE: MeasureMode = MeasureMode::SingleEnded;
    pub const SWITCH_TYPE: SwitchType = SwitchType::ReedRelay;
    pub const ADC_RANGE: AdcRange = AdcRange::Pm10V;
}

/// Documented bounds for each setting.
pub mod bounds {
    pub const FRAME_RATE_HZ: (f32, f32) = (0.1, 100.0);
    pub const FREQUENCY_HZ: (f32, f32) = (100.0, 10_000_000.0);
    pub const FREQUENCY_COUNT: (u16, u16) = (1, 128);
    pub const AMPLITUDE_A: (f64, f64) = (100e-9, 10e-3);
}

// ============================================================================
// Data Types
// ============================================================================

/// Distribution of the excitation frequencies between `fmin` and `fmax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyScale {
    #[default]
    Linear,
    Logarithmic,
}

impl FrequencyScale {
    pub fn to_bits(self) -> u8 {
        match self {
            FrequencyScale::Linear => 0,
            FrequencyScale::Logarithmic => 1,
        }
    }

    /// Any non-zero byte reads back as logarithmic.
    pub fn from_bits(bits: u8) -> Self {
        if bits == 0 {
            FrequencyScale::Linear
        } else {
            FrequencyScale::Logarithmic
        }
    }
}

/// Electrode skip pattern for differential measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferentialSkip {
    Skip0,
    Skip2,
    Skip4,
}

/// Whether the differential boundary electrodes are internal or external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Internal,
    External,
}

/// Single-ended or differential measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    SingleEnded,
    Differential {
        skip: DifferentialSkip,
        boundary: Boundary,
    },
}

impl MeasureMode {
    /// Mode byte and boundary byte as sent on the wire.
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            MeasureMode::SingleEnded => [1, 1],
            MeasureMode::Differential { skip, boundary } => {
                let mode = match skip {
                    DifferentialSkip::Skip0 => 2,
                    DifferentialSkip::Skip2 => 3,
                    DifferentialSkip::Skip4 => 4,
                };
                let boundary = match boundary {
                    Boundary::Internal => 1,
                    Boundary::External => 2,
                };
                [mode, boundary]
            }
        }
    }

    pub fn from_bytes(mode: u8, boundary: u8) -> Option<Self> {
        let skip = match mode {
            1 => return Some(MeasureMode::SingleEnded),
            2 => DifferentialSkip::Skip0,
            3 => DifferentialSkip::Skip2,
            4 => DifferentialSkip::Skip4,
            _ => return None,
        };
        let boundary = match boundary {
            1 => Boundary::Internal,
            2 => Boundary::External,
            _ => return None,
        };
        Some(MeasureMode::Differential { skip, boundary })
    }
}

/// Excitation multiplexer hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchType {
    ReedRelay = 1,
    Semiconductor = 2,
}

impl SwitchType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SwitchType::ReedRelay),
            2 => Some(SwitchType::Semiconductor),
            _ => None,
        }
    }
}

/// ADC input range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdcRange {
    /// ±1 V
    #[serde(rename = "1V")]
    Pm1V = 1,
    /// ±5 V
    #[serde(rename = "5V")]
    Pm5V = 2,
    /// ±10 V
    #[serde(rename = "10V")]
    Pm10V = 3,
}

impl AdcRange {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AdcRange::Pm1V),
            2 => Some(AdcRange::Pm5V),
            3 => Some(AdcRange::Pm10V),
            _ => None,
        }
    }
}

/// One step of the excitation sequence: current is driven on `drive` and
/// measured against `sense`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u16, u16)", into = "(u16, u16)")]
pub struct ExcitationPair {
    pub drive: u16,
    pub sense: u16,
}

impl ExcitationPair {
    pub const fn new(drive: u16, sense: u16) -> Self {
        Self { drive, sense }
    }
}

impl From<(u16, u16)> for ExcitationPair {
    fn from((drive, sense): (u16, u16)) -> Self {
        Self { drive, sense }
    }
}

impl From<ExcitationPair> for (u16, u16) {
    fn from(pair: ExcitationPair) -> Self {
        (pair.drive, pair.sense)
    }
}

impl fmt::Display for ExcitationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.drive, self.sense)
    }
}

/// Frequency sweep request. Missing members fall back to [`SweepDefaults`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrequencySweep {
    pub fmin: Option<f32>,
    pub fmax: Option<f32>,
    pub fcount: Option<u16>,
    pub ftype: Option<FrequencyScale>,
}

/// Frequency-count and scale used when a sweep is sent without them.
///
/// The acquisition scripts this driver replaces disagreed on these values,
/// so they are a policy choice rather than a constant. Confirm against the
/// device manual before relying on any preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepDefaults {
    pub fcount: u16,
    pub ftype: FrequencyScale,
}

impl SweepDefaults {
    /// Values from the parameter documentation: one linear frequency.
    pub const DOCUMENTED: Self = Self {
        fcount: 1,
        ftype: FrequencyScale::Linear,
    };
    /// Values used by the batch setup script.
    pub const SETUP_SCRIPT: Self = Self {
        fcount: 1,
        ftype: FrequencyScale::Logarithmic,
    };
    /// Values used by the interactive acquisition script.
    pub const ACQUISITION_SCRIPT: Self = Self {
        fcount: 20,
        ftype: FrequencyScale::Logarithmic,
    };
}

impl Default for SweepDefaults {
    fn default() -> Self {
        Self::DOCUMENTED
    }
}

/// Measurement setup. Absent fields are not sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    pub burst_count: Option<u16>,
    pub frame_rate: Option<f32>,
    pub excitation_frequencies: Option<FrequencySweep>,
    pub excitation_amplitude: Option<f64>,
    pub measure_mode: Option<MeasureMode>,
    pub excitation_sequence: Option<Vec<ExcitationPair>>,
    pub switch_type: Option<SwitchType>,
    pub adc_range: Option<AdcRange>,
}

/// Output options: which extra fields the device appends to measurement data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub excitation_setting: Option<bool>,
    pub frequency_row: Option<bool>,
    pub timestamp: Option<bool>,
}

/// Everything a measurement run is configured with, as loaded from disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub measurement: Configuration,
    pub output: OutputConfig,
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DriverError::Config(e.to_string()))
    }
}

/// A command paired with the name of the setting it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigCommand {
    pub setting: &'static str,
    pub frame: CommandFrame,
}

impl ConfigCommand {
    fn new(setting: &'static str, frame: CommandFrame) -> Self {
        Self { setting, frame }
    }
}

// ============================================================================
// Command Builder
// ============================================================================

/// Builds the ordered command list for a [`Configuration`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder {
    sweep_defaults: SweepDefaults,
}

impl CommandBuilder {
    pub fn new(sweep_defaults: SweepDefaults) -> Self {
        Self { sweep_defaults }
    }

    /// Reset command followed by one command per present field.
    ///
    /// All values are validated before anything is returned, so an invalid
    /// configuration never results in a partially written device.
    pub fn build_reset_and_configure(&self, config: &Configuration) -> Result<Vec<ConfigCommand>> {
        let mut commands = vec![ConfigCommand::new(
            "All Parameters",
            set_parameter(parameter::RESET, &[])?,
        )];

        if let Some(count) = config.burst_count {
            commands.push(ConfigCommand::new(
                "Burst Count",
                set_parameter(parameter::BURST_COUNT, &[Field::U16(count)])?,
            ));
        }

        if let Some(rate) = config.frame_rate {
            let rate = check_range("Frame Rate", rate, bounds::FRAME_RATE_HZ, "0.1-100 Hz")?;
            commands.push(ConfigCommand::new(
                "Frame Rate",
                set_parameter(parameter::FRAME_RATE, &[Field::F32(rate)])?,
            ));
        }

        if let Some(sweep) = config.excitation_frequencies {
            let fmin = sweep.fmin.unwrap_or(defaults::FREQUENCY_MIN_HZ);
            let fmax = sweep.fmax.unwrap_or(defaults::FREQUENCY_MAX_HZ);
            let fcount = sweep.fcount.unwrap_or(self.sweep_defaults.fcount);
            let ftype = sweep.ftype.unwrap_or(self.sweep_defaults.ftype);
            check_range("Fmin", fmin, bounds::FREQUENCY_HZ, "100 Hz-10 MHz")?;
            check_range("Fmax", fmax, bounds::FREQUENCY_HZ, "100 Hz-10 MHz")?;
            check_range("Fcount", fcount, bounds::FREQUENCY_COUNT, "1-128")?;
            commands.push(ConfigCommand::new(
                "Excitation Frequencies",
                set_parameter(
                    parameter::EXCITATION_FREQUENCIES,
                    &[
                        Field::F32(fmin),
                        Field::F32(fmax),
                        Field::U16(fcount),
                        Field::U8(ftype.to_bits()),
                    ],
                )?,
            ));
        }

        if let Some(amplitude) = config.excitation_amplitude {
            let amplitude = check_range(
                "Excitation Amplitude",
                amplitude,
                bounds::AMPLITUDE_A,
                "100 nA-10 mA",
            )?;
            commands.push(ConfigCommand::new(
                "Excitation Amplitude",
                set_parameter(parameter::EXCITATION_AMPLITUDE, &[Field::F64(amplitude)])?,
            ));
        }

        if let Some(mode) = config.measure_mode {
            let [mode_byte, boundary] = mode.to_bytes();
            commands.push(ConfigCommand::new(
                "Measure Mode",
                set_parameter(
                    parameter::MEASURE_MODE,
                    &[Field::U8(mode_byte), Field::U8(boundary)],
                )?,
            ));
        }

        if let Some(sequence) = &config.excitation_sequence {
            for pair in sequence {
                commands.push(ConfigCommand::new(
                    "Excitation Sequence",
                    set_parameter(
                        parameter::EXCITATION_SEQUENCE,
                        &[Field::U16(pair.sense), Field::U16(pair.drive)],
                    )?,
                ));
            }
        }

        if let Some(switch) = config.switch_type {
            commands.push(ConfigCommand::new(
                "Excitation Switch Type",
                set_parameter(parameter::SWITCH_TYPE, &[Field::U8(switch as u8)])?,
            ));
        }

        if let Some(range) = config.adc_range {
            commands.push(ConfigCommand::new(
                "ADC Range",
                set_parameter(parameter::ADC_RANGE, &[Field::U8(range as u8)])?,
            ));
        }

        Ok(commands)
    }
}

/// [`CommandBuilder::build_reset_and_configure`] with the documented sweep defaults.
pub fn build_reset_and_configure(config: &Configuration) -> Result<Vec<ConfigCommand>> {
    CommandBuilder::default().build_reset_and_configure(config)
}

/// One command per present output option.
pub fn build_output_config(config: &OutputConfig) -> Result<Vec<ConfigCommand>> {
    let options = [
        (
            "Excitation Setting",
            output_option::EXCITATION_SETTING,
            config.excitation_setting,
        ),
        (
            "Current row in the frequency stack",
            output_option::FREQUENCY_ROW,
            config.frequency_row,
        ),
        ("Timestamp", output_option::TIMESTAMP, config.timestamp),
    ];
    options
        .into_iter()
        .filter_map(|(setting, subcommand, value)| value.map(|v| (setting, subcommand, v)))
        .map(|(setting, subcommand, enabled)| {
            let frame = encode(
                CommandMarker::SetOutputConfig,
                subcommand,
                &[Field::U8(enabled as u8)],
            )?;
            Ok(ConfigCommand::new(setting, frame))
        })
        .collect()
}

pub fn start_measurement() -> Result<CommandFrame> {
    encode(CommandMarker::Measurement, measurement::START, &[])
}

pub fn stop_measurement() -> Result<CommandFrame> {
    encode(CommandMarker::Measurement, measurement::STOP, &[])
}

fn set_parameter(subcommand: u8, fields: &[Field]) -> Result<CommandFrame> {
    encode(CommandMarker::SetParameter, subcommand, fields)
}

fn check_range<T>(
    setting: &'static str,
    value: T,
    (min, max): (T, T),
    allowed: &'static str,
) -> Result<T>
where
    T: PartialOrd + fmt::Display + Copy,
{
    // Written so NaN fails too.
    if value >= min && value <= max {
        Ok(value)
    } else {
        Err(DriverError::InvalidParameter {
            setting,
            value: value.to_string(),
            allowed,
        })
    }
}
