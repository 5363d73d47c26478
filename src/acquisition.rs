//! Measurement run: one producer thread reading the transport, one consumer
//! reassembling and demultiplexing.
//!
//! The producer writes the start command and forwards every non-empty read
//! over a channel. The first read that times out ends the run: the producer
//! raises the stop flag, writes the stop command and reads its
//! acknowledgement. The consumer keeps draining until the stop flag is set
//! and the channel is empty, so nothing queued before the stop is lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};

use crate::codec::{decode_reply_frame, AckOutcome};
use crate::config::{start_measurement, stop_measurement};
use crate::dataset::DatasetSink;
use crate::demux::{DemuxStats, FrameDemultiplexer, LiveSink};
use crate::errors::{DriverError, Result};
use crate::reassembler::{ReassemblerStats, StreamReassembler};
use crate::transport::{drain, read_chunk, write_frame, Transport, READ_CHUNK_SIZE};

/// How often the consumer re-checks the stop flag while the channel is idle.
const CONSUMER_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Run summary
// ============================================================================

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub bytes: u64,
    pub chunks: u64,
    pub reassembler: ReassemblerStats,
    pub demux: DemuxStats,
    /// Records the dataset sink failed to persist.
    pub write_errors: u64,
    /// Device reply to the stop command, if one was read.
    pub stop_ack: Option<AckOutcome>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} chunks, {} frames ({} header, {} data), {} records, \
             {} decode errors, {} framing anomalies, {} write errors",
            self.bytes,
            self.chunks,
            self.reassembler.frames,
            self.demux.header_frames,
            self.demux.data_frames,
            self.demux.records_flushed,
            self.demux.decode_errors,
            self.reassembler.anomalies,
            self.write_errors
        )?;
        match &self.stop_ack {
            Some(outcome) => write!(f, ", stop: {outcome}"),
            None => f.write_str(", stop: no reply"),
        }
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Reassembler, demultiplexer and sinks: everything the consumer owns.
pub struct Pipeline<'a> {
    reassembler: StreamReassembler,
    demux: FrameDemultiplexer,
    dataset: &'a mut dyn DatasetSink,
    live: &'a mut dyn LiveSink,
    bytes: u64,
    chunks: u64,
    write_errors: u64,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        demux: FrameDemultiplexer,
        dataset: &'a mut dyn DatasetSink,
        live: &'a mut dyn LiveSink,
    ) -> Self {
        Self {
            reassembler: StreamReassembler::new(),
            demux,
            dataset,
            live,
            bytes: 0,
            chunks: 0,
            write_errors: 0,
        }
    }

    /// Push one chunk of raw stream bytes through the pipeline.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.chunks += 1;
        let demux = &mut self.demux;
        let dataset = &mut *self.dataset;
        let live = &mut *self.live;
        let write_errors = &mut self.write_errors;
        self.reassembler.feed(chunk, |frame| {
            if let Err(err) = demux.on_frame(&frame, dataset, live) {
                *write_errors += 1;
                error!("failed to persist dataset record: {err}");
            }
        });
    }

    /// End of stream: drop any partial frame and flush the open record.
    pub fn finish(mut self) -> RunSummary {
        self.reassembler.finish();
        if let Err(err) = self.demux.finish(self.dataset) {
            self.write_errors += 1;
            error!("failed to persist final dataset record: {err}");
        }
        RunSummary {
            bytes: self.bytes,
            chunks: self.chunks,
            reassembler: self.reassembler.stats(),
            demux: self.demux.stats(),
            write_errors: self.write_errors,
            stop_ack: None,
        }
    }

    pub fn demux(&self) -> &FrameDemultiplexer {
        &self.demux
    }

    fn consume(&mut self, rx: &Receiver<Bytes>, stop: &AtomicBool) {
        loop {
            match rx.recv_timeout(CONSUMER_POLL) {
                Ok(chunk) => self.feed(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Acquire) {
                        // Everything sent before the flag was raised is queued by now.
                        for chunk in rx.try_iter() {
                            self.feed(&chunk);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

// ============================================================================
// Producer side
// ============================================================================

fn produce(
    transport: &mut dyn Transport,
    tx: Sender<Bytes>,
    stop: &AtomicBool,
) -> Result<Option<AckOutcome>> {
    let start = start_measurement()?;
    if let Err(err) = write_frame(transport, &start.to_bytes()) {
        stop.store(true, Ordering::Release);
        return Err(err);
    }
    info!("measurement started");

    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match read_chunk(transport, &mut buf) {
            Ok(0) => {
                debug!("read timed out; ending run");
                break;
            }
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    warn!("consumer went away; ending run");
                    break;
                }
            }
            Err(err) => {
                error!("transport read failed, ending run: {err}");
                break;
            }
        }
    }
    stop.store(true, Ordering::Release);
    drop(tx);

    let stop_cmd = stop_measurement()?;
    write_frame(transport, &stop_cmd.to_bytes())?;
    info!("measurement stopped");
    Ok(read_stop_ack(transport))
}

/// Best effort: whatever follows the stop command, searched for an ack frame.
fn read_stop_ack(transport: &mut dyn Transport) -> Option<AckOutcome> {
    let bytes = match drain(transport) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("could not read stop acknowledgement: {err}");
            return None;
        }
    };
    let mut pending = BytesMut::from(&bytes[..]);
    while let Some(frame) = decode_reply_frame(&mut pending) {
        if !frame.is_ack() {
            continue;
        }
        match frame.ack_outcome() {
            Ok(outcome) => {
                info!("stop command: {outcome}");
                return Some(outcome);
            }
            Err(err) => warn!("stop command: {err}"),
        }
    }
    debug!("no acknowledgement after stop ({} bytes)", bytes.len());
    None
}

// ============================================================================
// Run
// ============================================================================

/// Run a measurement to completion over `transport`.
///
/// Returns once the device has gone quiet for one read timeout and every
/// byte read before that has been processed.
pub fn run_measurement(
    transport: &mut dyn Transport,
    mut pipeline: Pipeline<'_>,
) -> Result<RunSummary> {
    let (tx, rx) = mpsc::channel::<Bytes>();
    let stop = AtomicBool::new(false);

    let produced = thread::scope(|s| {
        let producer = thread::Builder::new()
            .name("eit-producer".into())
            .spawn_scoped(s, || produce(transport, tx, &stop))?;
        pipeline.consume(&rx, &stop);
        producer
            .join()
            .map_err(|_| DriverError::Protocol("producer thread panicked".into()))?
    });

    let mut summary = pipeline.finish();
    summary.stop_ack = produced?;
    info!("run finished: {summary}");
    Ok(summary)
}
