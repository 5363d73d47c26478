//! Read-back of the device configuration.
//!
//! Each [`QueryGroup`] is one "get parameter" command. The device answers
//! with one or more reply frames whose bodies carry fixed-layout fields;
//! [`ConfigurationSnapshot::apply`] decodes them into typed values.

use bytes::Buf;

use crate::codec::{encode, CommandFrame, CommandMarker, RawFrame};
use crate::config::{
    defaults, output_option, parameter, AdcRange, Configuration, ExcitationPair, FrequencyScale,
    FrequencySweep, MeasureMode, OutputConfig, SwitchType,
};
use crate::errors::{DriverError, Result};

/// Decimal places kept for frequency and amplitude read-backs.
const DISPLAY_DECIMALS: i32 = 8;

/// One group of settings read with a single query command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryGroup {
    Frequencies,
    Amplitude,
    FrameRate,
    AdcRange,
    MeasureMode,
    SwitchType,
    Sequence,
    BurstCount,
}

impl QueryGroup {
    /// Query order used when reading back a full configuration.
    pub const ALL: [QueryGroup; 8] = [
        QueryGroup::Frequencies,
        QueryGroup::Amplitude,
        QueryGroup::FrameRate,
        QueryGroup::AdcRange,
        QueryGroup::MeasureMode,
        QueryGroup::SwitchType,
        QueryGroup::Sequence,
        QueryGroup::BurstCount,
    ];

    pub fn subcommand(self) -> u8 {
        match self {
            QueryGroup::Frequencies => parameter::EXCITATION_FREQUENCIES,
            QueryGroup::Amplitude => parameter::EXCITATION_AMPLITUDE,
            QueryGroup::FrameRate => parameter::FRAME_RATE,
            QueryGroup::AdcRange => parameter::ADC_RANGE,
            QueryGroup::MeasureMode => parameter::MEASURE_MODE,
            QueryGroup::SwitchType => parameter::SWITCH_TYPE,
            QueryGroup::Sequence => parameter::EXCITATION_SEQUENCE,
            QueryGroup::BurstCount => parameter::BURST_COUNT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryGroup::Frequencies => "Excitation Frequencies",
            QueryGroup::Amplitude => "Excitation Amplitude",
            QueryGroup::FrameRate => "Frame Rate",
            QueryGroup::AdcRange => "ADC Range",
            QueryGroup::MeasureMode => "Measure Mode",
            QueryGroup::SwitchType => "Excitation Switch Type",
            QueryGroup::Sequence => "Excitation Sequence",
            QueryGroup::BurstCount => "Burst Count",
        }
    }

    pub fn command(self) -> Result<CommandFrame> {
        encode(CommandMarker::GetParameter, self.subcommand(), &[])
    }
}

/// Output options in read-back order, with their subcommands.
pub const OUTPUT_QUERIES: [(&str, u8); 3] = [
    ("Excitation Setting", output_option::EXCITATION_SETTING),
    (
        "Current row in the frequency stack",
        output_option::FREQUENCY_ROW,
    ),
    ("Timestamp", output_option::TIMESTAMP),
];

pub fn output_query_command(subcommand: u8) -> Result<CommandFrame> {
    encode(CommandMarker::GetOutputConfig, subcommand, &[])
}

/// Configuration as reported by the device.
///
/// Starts out at the device defaults; groups that could not be read keep them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSnapshot {
    pub fmin: f64,
    pub fmax: f64,
    pub fcount: u16,
    pub ftype: FrequencyScale,
    pub amplitude: f64,
    pub frame_rate: f64,
    pub adc_range: AdcRange,
    pub measure_mode: MeasureMode,
    pub switch_type: SwitchType,
    pub excitation_sequence: Vec<ExcitationPair>,
    pub burst_count: u16,
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self {
        Self {
            fmin: defaults::FREQUENCY_MIN_HZ as f64,
            fmax: defaults::FREQUENCY_MAX_HZ as f64,
            fcount: 1,
            ftype: FrequencyScale::Linear,
            amplitude: defaults::AMPLITUDE_A,
            frame_rate: defaults::FRAME_RATE_HZ as f64,
            adc_range: defaults::ADC_RANGE,
            measure_mode: defaults::MEASURE_MODE,
            switch_type: defaults::SWITCH_TYPE,
            excitation_sequence: Vec::new(),
            burst_count: defaults::BURST_COUNT,
        }
    }
}

impl ConfigurationSnapshot {
    /// Decode the reply frames of one query group into this snapshot.
    pub fn apply(&mut self, group: QueryGroup, frames: &[RawFrame]) -> Result<()> {
        if group == QueryGroup::Sequence {
            self.excitation_sequence = parse_sequence(frames)?;
            return Ok(());
        }
        let body = first_body(group, frames)?;
        match group {
            QueryGroup::Frequencies => {
                let (fmin, fmax, fcount, ftype) = parse_frequencies(body)?;
                self.fmin = fmin;
                self.fmax = fmax;
                self.fcount = fcount;
                self.ftype = ftype;
            }
            QueryGroup::Amplitude => self.amplitude = parse_amplitude(body)?,
            QueryGroup::FrameRate => self.frame_rate = parse_frame_rate(body)?,
            QueryGroup::AdcRange => {
                let code = parse_u8(body, "ADC range")?;
                self.adc_range = AdcRange::from_u8(code)
                    .ok_or_else(|| DriverError::decode("unknown ADC range code", body))?;
            }
            QueryGroup::MeasureMode => self.measure_mode = parse_measure_mode(body)?,
            QueryGroup::SwitchType => {
                let code = parse_u8(body, "switch type")?;
                self.switch_type = SwitchType::from_u8(code)
                    .ok_or_else(|| DriverError::decode("unknown switch type code", body))?;
            }
            QueryGroup::BurstCount => self.burst_count = parse_u16(body, "burst count")?,
            QueryGroup::Sequence => {}
        }
        Ok(())
    }

    /// Configuration fields in the order they head every dataset record.
    pub fn dataset_fields(&self) -> Vec<String> {
        let mut fields = vec![
            format_float(self.fmin),
            format_float(self.fmax),
            self.ftype.to_bits().to_string(),
            self.fcount.to_string(),
            format_float(self.amplitude),
            format_float(self.frame_rate),
            (self.adc_range as u8).to_string(),
        ];
        let [mode, boundary] = self.measure_mode.to_bytes();
        fields.push(mode.to_string());
        if matches!(self.measure_mode, MeasureMode::Differential { .. }) {
            fields.push(boundary.to_string());
        }
        fields.push(
            self.excitation_sequence
                .iter()
                .map(ExcitationPair::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        );
        fields
    }

    /// The snapshot as a fully populated [`Configuration`].
    pub fn to_configuration(&self) -> Configuration {
        Configuration {
            burst_count: Some(self.burst_count),
            frame_rate: Some(self.frame_rate as f32),
            excitation_frequencies: Some(FrequencySweep {
                fmin: Some(self.fmin as f32),
                fmax: Some(self.fmax as f32),
                fcount: Some(self.fcount),
                ftype: Some(self.ftype),
            }),
            excitation_amplitude: Some(self.amplitude),
            measure_mode: Some(self.measure_mode),
            excitation_sequence: Some(self.excitation_sequence.clone()),
            switch_type: Some(self.switch_type),
            adc_range: Some(self.adc_range),
        }
    }
}

/// Decode an output-option reply into `config`.
pub fn apply_output_reply(
    config: &mut OutputConfig,
    subcommand: u8,
    frames: &[RawFrame],
) -> Result<()> {
    let body = frames.first().map(RawFrame::body).ok_or_else(|| {
        DriverError::Protocol(format!("no reply for output option {subcommand:#04X}"))
    })?;
    let enabled = parse_u8(body, "output option")? == 1;
    match subcommand {
        output_option::EXCITATION_SETTING => config.excitation_setting = Some(enabled),
        output_option::FREQUENCY_ROW => config.frequency_row = Some(enabled),
        output_option::TIMESTAMP => config.timestamp = Some(enabled),
        other => {
            return Err(DriverError::Protocol(format!(
                "unknown output option {other:#04X}"
            )))
        }
    }
    Ok(())
}

fn first_body(group: QueryGroup, frames: &[RawFrame]) -> Result<&[u8]> {
    frames
        .first()
        .map(RawFrame::body)
        .ok_or_else(|| DriverError::Protocol(format!("no reply frame for {}", group.name())))
}

fn need(body: &[u8], len: usize, what: &str) -> Result<()> {
    if body.len() < len {
        return Err(DriverError::decode(
            format!("{what}: expected {len} bytes, got {}", body.len()),
            body,
        ));
    }
    Ok(())
}

fn parse_u8(body: &[u8], what: &str) -> Result<u8> {
    need(body, 1, what)?;
    Ok(body[0])
}

fn parse_u16(mut body: &[u8], what: &str) -> Result<u16> {
    need(body, 2, what)?;
    Ok(body.get_u16())
}

pub fn parse_frequencies(mut body: &[u8]) -> Result<(f64, f64, u16, FrequencyScale)> {
    need(body, 11, "excitation frequencies")?;
    let fmin = round_display(body.get_f32() as f64);
    let fmax = round_display(body.get_f32() as f64);
    let fcount = body.get_u16();
    let ftype = FrequencyScale::from_bits(body.get_u8());
    Ok((fmin, fmax, fcount, ftype))
}

/// Amplitude is written as a double; shorter replies carry a float.
pub fn parse_amplitude(mut body: &[u8]) -> Result<f64> {
    if body.len() >= 8 {
        return Ok(round_display(body.get_f64()));
    }
    need(body, 4, "excitation amplitude")?;
    Ok(round_display(body.get_f32() as f64))
}

pub fn parse_frame_rate(mut body: &[u8]) -> Result<f64> {
    need(body, 4, "frame rate")?;
    Ok(body.get_f32() as f64)
}

pub fn parse_measure_mode(body: &[u8]) -> Result<MeasureMode> {
    let mode = parse_u8(body, "measure mode")?;
    let boundary = body.get(1).copied().unwrap_or(0);
    MeasureMode::from_bytes(mode, boundary)
        .ok_or_else(|| DriverError::decode("unknown measure mode", body))
}

/// Pairs are `sense:u16 drive:u16`, possibly spread over several reply frames.
pub fn parse_sequence(frames: &[RawFrame]) -> Result<Vec<ExcitationPair>> {
    let bytes: Vec<u8> = frames.iter().flat_map(|f| f.body().iter().copied()).collect();
    let chunks = bytes.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        return Err(DriverError::decode(
            format!("excitation sequence length {} is not a multiple of 4", bytes.len()),
            &bytes,
        ));
    }
    Ok(chunks
        .map(|mut chunk| {
            let sense = chunk.get_u16();
            let drive = chunk.get_u16();
            ExcitationPair::new(drive, sense)
        })
        .collect())
}

fn round_display(value: f64) -> f64 {
    let scale = 10f64.powi(DISPLAY_DECIMALS);
    (value * scale).round() / scale
}

/// Shortest round-trip text, keeping a trailing `.0` on integral values.
pub fn format_float(value: f64) -> String {
    format!("{value:?}")
}
