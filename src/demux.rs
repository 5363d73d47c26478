//! Frame classification, loop tracking and channel routing.
//!
//! Every reassembled frame is either a header (kind byte `1`) announcing the
//! next excitation pair, or a data frame of big-endian `f32` samples. The
//! demultiplexer turns those into dataset records, one per sweep loop, and a
//! live sample feed with one queue per position in the excitation sequence.

use std::sync::mpsc::{self, Receiver, Sender};

use bytes::{Buf, BytesMut};
use chrono::{Local, Utc};
use log::{debug, info, warn};

use crate::codec::RawFrame;
use crate::config::ExcitationPair;
use crate::dataset::{DatasetRecord, DatasetSink};
use crate::errors::{DriverError, Result};

/// Kind byte of a header frame.
pub const HEADER_KIND: u8 = 0x01;

/// Header body: frame index, drive, sense.
const HEADER_BODY_LEN: usize = 6;

/// Width of one sample on the wire.
const SAMPLE_WIDTH: usize = 4;

// ============================================================================
// Frame payloads
// ============================================================================

/// Decoded header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFrame {
    pub frame_index: u16,
    pub pair: ExcitationPair,
}

impl HeaderFrame {
    pub fn parse(frame: &RawFrame) -> Result<Self> {
        let mut body = frame.body();
        if body.len() < HEADER_BODY_LEN {
            return Err(DriverError::decode(
                format!(
                    "header body: expected {HEADER_BODY_LEN} bytes, got {}",
                    body.len()
                ),
                frame.as_bytes(),
            ));
        }
        let frame_index = body.get_u16();
        let drive = body.get_u16();
        let sense = body.get_u16();
        Ok(Self {
            frame_index,
            pair: ExcitationPair::new(drive, sense),
        })
    }
}

/// Decode a sample body. The length must be a multiple of four.
pub fn decode_samples(body: &[u8]) -> Result<Vec<f32>> {
    if body.len() % SAMPLE_WIDTH != 0 {
        return Err(DriverError::decode(
            format!("sample payload of {} bytes is not a multiple of 4", body.len()),
            body,
        ));
    }
    Ok(body
        .chunks_exact(SAMPLE_WIDTH)
        .map(|mut chunk| chunk.get_f32())
        .collect())
}

// ============================================================================
// Live feed
// ============================================================================

/// One decoded value for a sequence position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSample {
    pub channel_index: usize,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Receiver side of the live feed, written only by the consumer.
pub trait LiveSink {
    fn push(&mut self, sample: LiveSample);
}

impl LiveSink for Vec<LiveSample> {
    fn push(&mut self, sample: LiveSample) {
        Vec::push(self, sample);
    }
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLiveFeed;

impl LiveSink for NoLiveFeed {
    fn push(&mut self, _sample: LiveSample) {}
}

/// One channel per sequence position, polled by an outside reader.
#[derive(Debug)]
pub struct LiveChannels {
    senders: Vec<Sender<LiveSample>>,
    closed: Vec<bool>,
}

impl LiveChannels {
    pub fn new(positions: usize) -> (Self, Vec<Receiver<LiveSample>>) {
        let (senders, receivers) = (0..positions).map(|_| mpsc::channel()).unzip();
        let channels = Self {
            senders,
            closed: vec![false; positions],
        };
        (channels, receivers)
    }
}

impl LiveSink for LiveChannels {
    fn push(&mut self, sample: LiveSample) {
        let index = sample.channel_index;
        let Some(sender) = self.senders.get(index) else {
            debug!("no live channel for position {index}");
            return;
        };
        if sender.send(sample).is_err() && !self.closed[index] {
            self.closed[index] = true;
            debug!("live channel {index} has no reader; dropping its samples");
        }
    }
}

// ============================================================================
// Demultiplexer
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub header_frames: u64,
    pub data_frames: u64,
    pub sample_sets: u64,
    pub records_flushed: u64,
    pub decode_errors: u64,
}

/// Routes reassembled frames into dataset records and the live feed.
#[derive(Debug)]
pub struct FrameDemultiplexer {
    dataset_name: String,
    config_fields: Vec<String>,
    sequence: Vec<ExcitationPair>,
    cursor: usize,
    signature: Option<ExcitationPair>,
    loop_index: u32,
    record: Option<DatasetRecord>,
    carry: BytesMut,
    stats: DemuxStats,
}

impl FrameDemultiplexer {
    /// `config_fields` head every record, right after the timestamp.
    pub fn new(
        dataset_name: impl Into<String>,
        config_fields: Vec<String>,
        sequence: Vec<ExcitationPair>,
    ) -> Self {
        if sequence.is_empty() {
            info!("empty excitation sequence; live routing disabled");
        }
        Self {
            dataset_name: dataset_name.into(),
            config_fields,
            sequence,
            cursor: 0,
            signature: None,
            loop_index: 0,
            record: None,
            carry: BytesMut::new(),
            stats: DemuxStats::default(),
        }
    }

    pub fn on_frame(
        &mut self,
        frame: &RawFrame,
        dataset: &mut dyn DatasetSink,
        live: &mut dyn LiveSink,
    ) -> Result<()> {
        match frame.kind() {
            Some(HEADER_KIND) => self.on_header(frame, dataset),
            Some(_) => {
                self.on_data(frame, live);
                Ok(())
            }
            None => {
                self.stats.decode_errors += 1;
                warn!("frame without kind byte skipped: {:02X?}", frame.as_bytes());
                Ok(())
            }
        }
    }

    /// Flush the open record, if any. Called once the stream has ended.
    pub fn finish(&mut self, dataset: &mut dyn DatasetSink) -> Result<()> {
        self.drop_carry("end of stream");
        match self.record.take() {
            Some(record) => self.persist(record, dataset),
            None => Ok(()),
        }
    }

    fn on_header(&mut self, frame: &RawFrame, dataset: &mut dyn DatasetSink) -> Result<()> {
        let header = match HeaderFrame::parse(frame) {
            Ok(header) => header,
            Err(err) => {
                self.stats.decode_errors += 1;
                warn!("header frame skipped: {err}");
                return Ok(());
            }
        };
        self.stats.header_frames += 1;
        self.drop_carry("header frame");
        debug!(
            "header #{} pair={} loop={}",
            header.frame_index, header.pair, self.loop_index
        );

        let finished = match self.signature {
            None => {
                self.signature = Some(header.pair);
                self.open_record();
                None
            }
            Some(signature) if signature == header.pair => {
                let finished = self.record.take();
                self.open_record();
                finished
            }
            Some(_) => None,
        };
        if let Some(record) = self.record.as_mut() {
            record.push_header(header.pair);
        }
        match finished {
            Some(record) => self.persist(record, dataset),
            None => Ok(()),
        }
    }

    fn on_data(&mut self, frame: &RawFrame, live: &mut dyn LiveSink) {
        self.stats.data_frames += 1;
        let body = frame.body();

        let payload = if self.carry.is_empty() {
            BytesMut::from(body)
        } else {
            let mut joined = self.carry.split();
            joined.extend_from_slice(body);
            if joined.len() % SAMPLE_WIDTH == 0 {
                debug!("joined {} byte split sample set", joined.len());
                joined
            } else {
                let tail_len = joined.len() - body.len();
                self.stats.decode_errors += 1;
                warn!(
                    "carried tail dropped: {} + {} bytes is not a multiple of 4 (tail={:02X?})",
                    tail_len,
                    body.len(),
                    &joined[..tail_len]
                );
                BytesMut::from(body)
            }
        };

        if payload.len() % SAMPLE_WIDTH != 0 {
            debug!("holding {} byte data body for the next frame", payload.len());
            self.carry = payload;
            return;
        }
        let values = match decode_samples(&payload) {
            Ok(values) if values.is_empty() => {
                debug!("empty data frame ignored");
                return;
            }
            Ok(values) => values,
            Err(err) => {
                self.stats.decode_errors += 1;
                warn!("data frame skipped: {err}");
                return;
            }
        };

        self.stats.sample_sets += 1;
        match self.record.as_mut() {
            Some(record) => record.push_samples(&values),
            None => debug!("sample set before first header not recorded: {values:?}"),
        }
        self.route(&values, live);
    }

    fn route(&mut self, values: &[f32], live: &mut dyn LiveSink) {
        if self.sequence.is_empty() {
            return;
        }
        let position = self.cursor;
        let timestamp = Utc::now().timestamp_micros() as f64 / 1e6;
        for &value in values {
            live.push(LiveSample {
                channel_index: position,
                value: value as f64,
                timestamp,
            });
        }
        self.cursor = (self.cursor + 1) % self.sequence.len();
    }

    fn open_record(&mut self) {
        self.loop_index += 1;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        self.record = Some(DatasetRecord::open(
            &self.dataset_name,
            self.loop_index,
            &timestamp,
            &self.config_fields,
        ));
    }

    fn persist(&mut self, record: DatasetRecord, dataset: &mut dyn DatasetSink) -> Result<()> {
        debug!(
            "flushing loop {} ({} lines)",
            record.loop_index(),
            record.lines().len()
        );
        dataset.flush(record)?;
        self.stats.records_flushed += 1;
        Ok(())
    }

    fn drop_carry(&mut self, reason: &str) {
        if self.carry.is_empty() {
            return;
        }
        self.stats.decode_errors += 1;
        warn!(
            "carried tail dropped at {reason}: {} bytes {:02X?}",
            self.carry.len(),
            &self.carry[..]
        );
        self.carry.clear();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The record being filled, if a header has been seen.
    pub fn open_record_ref(&self) -> Option<&DatasetRecord> {
        self.record.as_ref()
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }
}
