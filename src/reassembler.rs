//! Reassembly of measurement frames from the raw byte stream.
//!
//! During a run the device streams `0xB4 len kind body.. terminator` frames
//! back to back. Reads from the transport split that stream at arbitrary
//! points, so the reassembler consumes one byte at a time and never looks
//! ahead or backtracks:
//!
//! - outside a frame, every byte other than the marker is discarded;
//! - the byte after the marker is the length field `n`;
//! - the frame is complete once `n + 2` bytes have followed the marker.

use bytes::{BufMut, BytesMut};
use log::{debug, warn};

use crate::codec::{RawFrame, FRAME_MARKER};

/// Counters kept across the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Complete frames emitted.
    pub frames: u64,
    /// Bytes discarded while hunting for a marker.
    pub discarded_bytes: u64,
    /// Frames with a bad terminator, or cut off at end of stream.
    pub anomalies: u64,
}

/// Single-pass frame reassembler.
#[derive(Debug)]
pub struct StreamReassembler {
    frame_started: bool,
    current: BytesMut,
    expected_len: usize,
    skipped_run: usize,
    stats: ReassemblerStats,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self {
            frame_started: false,
            current: BytesMut::with_capacity(256),
            expected_len: 0,
            skipped_run: 0,
            stats: ReassemblerStats::default(),
        }
    }

    /// Consume one byte; returns the frame it completes, if any.
    pub fn push(&mut self, byte: u8) -> Option<RawFrame> {
        if !self.frame_started {
            if byte == FRAME_MARKER {
                if self.skipped_run > 0 {
                    debug!("resynchronized after discarding {} bytes", self.skipped_run);
                    self.skipped_run = 0;
                }
                self.frame_started = true;
                self.current.clear();
                self.current.put_u8(byte);
                self.expected_len = 0;
            } else {
                self.skipped_run += 1;
                self.stats.discarded_bytes += 1;
            }
            return None;
        }

        self.current.put_u8(byte);
        if self.current.len() == 2 {
            // Length byte counts the kind byte and body; the closing byte is extra.
            self.expected_len = byte as usize + 1;
            return None;
        }
        if self.current.len() < self.expected_len + 2 {
            return None;
        }

        self.frame_started = false;
        let frame = RawFrame::new(self.current.split().freeze());
        if frame.terminator() != FRAME_MARKER {
            self.stats.anomalies += 1;
            warn!(
                "framing anomaly: terminator {:#04X} != {:#04X} (length_field={}, frame={:02X?})",
                frame.terminator(),
                FRAME_MARKER,
                frame.length_field(),
                frame.as_bytes()
            );
        }
        self.stats.frames += 1;
        Some(frame)
    }

    /// Consume a chunk, handing every completed frame to `on_frame`.
    pub fn feed(&mut self, chunk: &[u8], mut on_frame: impl FnMut(RawFrame)) {
        for &byte in chunk {
            if let Some(frame) = self.push(byte) {
                on_frame(frame);
            }
        }
    }

    /// Convenience wrapper around [`feed`](Self::feed) collecting the frames.
    pub fn feed_collect(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        self.feed(chunk, |frame| frames.push(frame));
        frames
    }

    /// End of stream. Returns the bytes of a frame left incomplete, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if !self.frame_started {
            return None;
        }
        self.frame_started = false;
        let partial = self.current.split().to_vec();
        self.stats.anomalies += 1;
        warn!(
            "framing anomaly: stream ended mid-frame (expected {} bytes, got {}, bytes={:02X?})",
            self.expected_len + 2,
            partial.len(),
            partial
        );
        Some(partial)
    }

    pub fn in_frame(&self) -> bool {
        self.frame_started
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        let mut bytes = vec![0x18, 0x01, 0x83, 0x18];
        bytes.extend_from_slice(RawFrame::from_parts(0xB4, 0x01, &[0, 1, 0, 1, 0, 3]).as_bytes());
        bytes.extend_from_slice(
            RawFrame::from_parts(0xB4, 0x02, &[0x3F, 0x80, 0x00, 0x00, 0xB4, 0x00, 0x00, 0x00])
                .as_bytes(),
        );
        bytes.extend_from_slice(&[0x00, 0x07]);
        bytes.extend_from_slice(
            RawFrame::from_parts(0xB4, 0x02, &[0x40, 0x00, 0x00, 0x00]).as_bytes(),
        );
        bytes
    }

    #[test]
    fn test_bulk_and_bytewise_feed_agree() {
        let bytes = stream();

        let mut bulk = StreamReassembler::new();
        let bulk_frames = bulk.feed_collect(&bytes);

        let mut single = StreamReassembler::new();
        let single_frames: Vec<_> = bytes.iter().filter_map(|&b| single.push(b)).collect();

        assert_eq!(bulk_frames.len(), 3);
        assert_eq!(bulk_frames, single_frames);
        assert_eq!(bulk.stats(), single.stats());
        assert_eq!(bulk.stats().discarded_bytes, 6);
    }

    #[test]
    fn test_every_split_point_yields_same_frames() {
        let bytes = stream();
        let expected = StreamReassembler::new().feed_collect(&bytes);
        for split in 0..=bytes.len() {
            let mut reassembler = StreamReassembler::new();
            let mut frames = reassembler.feed_collect(&bytes[..split]);
            frames.extend(reassembler.feed_collect(&bytes[split..]));
            assert_eq!(frames, expected, "split at {split}");
        }
    }

    #[test]
    fn test_frame_emitted_exactly_at_length_plus_two() {
        let frame = RawFrame::from_parts(0xB4, 0x02, &[1, 2, 3, 4, 5]);
        let bytes = frame.as_bytes();
        let n = bytes[1] as usize;
        let mut reassembler = StreamReassembler::new();
        for (i, &b) in bytes.iter().enumerate() {
            let out = reassembler.push(b);
            if i == n + 2 {
                assert_eq!(out.as_ref(), Some(&frame));
            } else {
                assert!(out.is_none(), "early frame at byte {i}");
            }
        }
        assert!(!reassembler.in_frame());
    }

    #[test]
    fn test_marker_inside_body_does_not_restart() {
        let frame = RawFrame::from_parts(0xB4, 0x02, &[0xB4, 0xB4, 0xB4, 0xB4]);
        let mut reassembler = StreamReassembler::new();
        assert_eq!(reassembler.feed_collect(frame.as_bytes()), vec![frame]);
    }

    #[test]
    fn test_bad_terminator_is_counted_but_delivered() {
        let mut reassembler = StreamReassembler::new();
        let frames = reassembler.feed_collect(&[0xB4, 0x02, 0x02, 0x11, 0x00]);
        assert_eq!(frames.len(), 1);
        assert_eq!(reassembler.stats().anomalies, 1);
    }

    #[test]
    fn test_finish_reports_truncated_frame() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed_collect(&[0xB4, 0x09, 0x02, 0x00]).is_empty());
        assert!(reassembler.in_frame());
        assert_eq!(reassembler.finish(), Some(vec![0xB4, 0x09, 0x02, 0x00]));
        assert_eq!(reassembler.stats().anomalies, 1);
        assert_eq!(reassembler.finish(), None);
    }
}
