//! End-to-end tests: scripted device over an in-memory transport.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use eit_rs::demux::HEADER_KIND;
use eit_rs::{
    run_measurement, AckOutcome, Configuration, DatasetRecord, DatasetWriter, ExcitationPair,
    FrameDemultiplexer, Instrument, LiveSample, NoLiveFeed, Pipeline, QueryGroup, RawFrame,
};

const ACK_OK: [u8; 4] = [0x18, 0x01, 0x83, 0x18];
const ACK_NOT_EXECUTED: [u8; 4] = [0x18, 0x01, 0x81, 0x18];
const START: [u8; 4] = [0xB4, 0x01, 0x01, 0xB4];
const STOP: [u8; 4] = [0xB4, 0x01, 0x00, 0xB4];

/// Device double: every write releases the next scripted reply, which is
/// then read back in `chunk`-sized pieces. An empty buffer reads as a timeout.
struct MockDevice {
    replies: VecDeque<Vec<u8>>,
    readable: VecDeque<u8>,
    chunk: usize,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockDevice {
    fn new(replies: Vec<Vec<u8>>, chunk: usize) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let device = Self {
            replies: replies.into(),
            readable: VecDeque::new(),
            chunk,
            written: Arc::clone(&written),
        };
        (device, written)
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.readable.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        }
        let n = buf.len().min(self.chunk).min(self.readable.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.readable.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockDevice {
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

fn header(index: u16, drive: u16, sense: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&index.to_be_bytes());
    body.extend_from_slice(&drive.to_be_bytes());
    body.extend_from_slice(&sense.to_be_bytes());
    RawFrame::from_parts(0xB4, HEADER_KIND, &body).as_bytes().to_vec()
}

fn data(values: &[f32]) -> Vec<u8> {
    let body: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    RawFrame::from_parts(0xB4, 0x02, &body).as_bytes().to_vec()
}

fn pairs(list: &[(u16, u16)]) -> Vec<ExcitationPair> {
    list.iter().copied().map(ExcitationPair::from).collect()
}

fn demux(sequence: &[(u16, u16)]) -> FrameDemultiplexer {
    FrameDemultiplexer::new("scan", vec!["100000.0".to_string()], pairs(sequence))
}

#[test]
fn measurement_run_writes_one_file_per_loop() {
    let stream = [
        header(0, 1, 3),
        data(&[1.0, 2.0]),
        header(1, 1, 3),
        data(&[3.0, 4.0]),
    ]
    .concat();
    let (mut device, written) = MockDevice::new(vec![stream, ACK_OK.to_vec()], 5);
    let dir = tempfile::tempdir().unwrap();
    let mut writer = DatasetWriter::new(dir.path());
    let mut live = NoLiveFeed;

    let summary = run_measurement(
        &mut device,
        Pipeline::new(demux(&[(1, 3)]), &mut writer, &mut live),
    )
    .unwrap();

    assert_eq!(*written.lock().unwrap(), vec![START.to_vec(), STOP.to_vec()]);
    assert_eq!(summary.stop_ack, Some(AckOutcome::Success));
    assert_eq!(summary.reassembler.frames, 4);
    assert_eq!(summary.demux.records_flushed, 2);

    let first = fs::read_to_string(dir.path().join("scan_1.txt")).unwrap();
    let second = fs::read_to_string(dir.path().join("scan_2.txt")).unwrap();
    let first: Vec<_> = first.lines().collect();
    let second: Vec<_> = second.lines().collect();
    assert_eq!(&first[..3], &["18", "1", "scan"]);
    assert_eq!(&first[first.len() - 2..], &["3 1", "1.0 2.0"]);
    assert_eq!(&second[..2], &["18", "2"]);
    assert_eq!(&second[second.len() - 2..], &["3 1", "3.0 4.0"]);
}

#[test]
fn three_signature_headers_flush_two_loops() {
    let stream = [
        header(0, 1, 3),
        data(&[1.0]),
        header(1, 1, 3),
        data(&[2.0]),
        header(2, 1, 3),
        data(&[3.0]),
    ]
    .concat();
    let mut sink: Vec<DatasetRecord> = Vec::new();
    let mut live = NoLiveFeed;
    let mut pipeline = Pipeline::new(demux(&[(1, 3)]), &mut sink, &mut live);
    pipeline.feed(&stream);

    assert_eq!(pipeline.demux().stats().records_flushed, 2);
    assert_eq!(pipeline.demux().open_record_ref().map(|r| r.loop_index()), Some(3));

    let summary = pipeline.finish();
    assert_eq!(summary.demux.records_flushed, 3);
    assert_eq!(sink.len(), 3);
    assert_eq!(sink[2].body_lines(), &["3 1", "3.0"]);
}

#[test]
fn samples_are_routed_round_robin() {
    let stream = [
        header(0, 1, 3),
        data(&[1.0]),
        data(&[2.0]),
        data(&[3.0]),
        data(&[4.0]),
    ]
    .concat();
    let mut sink: Vec<DatasetRecord> = Vec::new();
    let mut live: Vec<LiveSample> = Vec::new();
    let mut pipeline = Pipeline::new(demux(&[(1, 3), (2, 4)]), &mut sink, &mut live);
    for byte in &stream {
        pipeline.feed(std::slice::from_ref(byte));
    }
    pipeline.finish();

    let routed: Vec<_> = live.iter().map(|s| (s.channel_index, s.value)).collect();
    assert_eq!(routed, vec![(0, 1.0), (1, 2.0), (0, 3.0), (1, 4.0)]);
}

#[test]
fn malformed_data_frame_is_skipped() {
    let stream = [
        header(0, 1, 3),
        RawFrame::from_parts(0xB4, 0x02, &[0x3F, 0x80, 0x00, 0x00, 0x01])
            .as_bytes()
            .to_vec(),
        data(&[8.0, 9.0]),
    ]
    .concat();
    let mut sink: Vec<DatasetRecord> = Vec::new();
    let mut live = NoLiveFeed;
    let mut pipeline = Pipeline::new(demux(&[(1, 3)]), &mut sink, &mut live);
    pipeline.feed(&stream);
    let summary = pipeline.finish();

    assert_eq!(summary.demux.decode_errors, 1);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].body_lines(), &["3 1", "8.0 9.0"]);
}

#[test]
fn noise_between_frames_is_discarded() {
    let stream = [
        vec![0x00, 0x13, 0x37],
        header(0, 1, 3),
        vec![0xFF],
        data(&[0.5]),
    ]
    .concat();
    let mut sink: Vec<DatasetRecord> = Vec::new();
    let mut live = NoLiveFeed;
    let mut pipeline = Pipeline::new(demux(&[(1, 3)]), &mut sink, &mut live);
    pipeline.feed(&stream);
    let summary = pipeline.finish();

    assert_eq!(summary.reassembler.discarded_bytes, 4);
    assert_eq!(sink[0].body_lines(), &["3 1", "0.5"]);
}

#[test]
fn instrument_configures_reads_back_and_measures() {
    let config = Configuration {
        excitation_sequence: Some(pairs(&[(1, 3), (2, 4)])),
        ..Default::default()
    };

    // reset + two sequence commands
    let mut replies = vec![ACK_OK.to_vec(); 3];
    for group in QueryGroup::ALL {
        if group == QueryGroup::Sequence {
            let body = [0x00, 0x03, 0x00, 0x01, 0x00, 0x04, 0x00, 0x02];
            let frame = RawFrame::from_parts(0xB1, group.subcommand(), &body);
            replies.push([frame.as_bytes(), &ACK_OK[..]].concat());
        } else {
            replies.push(ACK_NOT_EXECUTED.to_vec());
        }
    }
    replies.push(
        [
            header(0, 1, 3),
            data(&[1.0]),
            header(1, 2, 4),
            data(&[2.0]),
            header(2, 1, 3),
            data(&[3.0]),
        ]
        .concat(),
    );
    replies.push(ACK_OK.to_vec());

    let (mock, written) = MockDevice::new(replies, 3);
    let mut instrument = Instrument::from_transport(Box::new(mock));

    let outcomes = instrument.configure(&config).unwrap();
    assert!(outcomes.iter().all(|o| o.is_applied()));
    assert_eq!(
        written.lock().unwrap()[1],
        vec![0xB0, 0x05, 0x06, 0x00, 0x03, 0x00, 0x01, 0xB0]
    );

    let snapshot = instrument.query_configuration().unwrap();
    assert_eq!(snapshot.excitation_sequence, pairs(&[(1, 3), (2, 4)]));
    let fields = snapshot.dataset_fields();
    assert_eq!(fields.last().map(String::as_str), Some("(1,3) (2,4)"));

    let dir = tempfile::tempdir().unwrap();
    let mut writer = DatasetWriter::new(dir.path());
    let mut live: Vec<LiveSample> = Vec::new();
    let demux = FrameDemultiplexer::new("scan", fields, snapshot.excitation_sequence.clone());
    let summary = instrument
        .acquire(Pipeline::new(demux, &mut writer, &mut live))
        .unwrap();

    assert_eq!(summary.demux.header_frames, 3);
    assert_eq!(summary.demux.records_flushed, 2);
    assert_eq!(summary.stop_ack, Some(AckOutcome::Success));
    assert_eq!(
        live.iter().map(|s| s.channel_index).collect::<Vec<_>>(),
        vec![0, 1, 0]
    );

    let first = fs::read_to_string(dir.path().join("scan_1.txt")).unwrap();
    let first: Vec<_> = first.lines().collect();
    assert_eq!(&first[first.len() - 4..], &["3 1", "1.0", "4 2", "2.0"]);
    assert!(dir.path().join("scan_2.txt").exists());

    let written = written.lock().unwrap();
    assert_eq!(written[written.len() - 2], START.to_vec());
    assert_eq!(written[written.len() - 1], STOP.to_vec());
}
