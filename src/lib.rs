//! Serial driver and streaming protocol engine for EIT impedance instruments.
//!
//! The instrument speaks a framed command protocol (see [`codec`]) and, once a
//! measurement is started, streams header and data frames back to back until
//! it is stopped. This crate configures the device, reads its configuration
//! back and turns the measurement stream into per-loop dataset files and a
//! live per-channel sample feed.
//!
//! # Measurement pipeline
//!
//! ```text
//! transport ─▶ producer ─▶ channel ─▶ StreamReassembler ─▶ FrameDemultiplexer ─┬▶ DatasetSink
//!                                                                               └▶ LiveSink
//! ```
//!
//! 1. Build a [`FrameDemultiplexer`] from the read-back [`ConfigurationSnapshot`]
//! 2. Wrap it with the sinks in a [`Pipeline`]
//! 3. [`Instrument::acquire`] runs until the device goes quiet for one read timeout
//!
//! # Loops
//!
//! A new dataset record starts whenever a header frame repeats the excitation
//! pair of the very first header of the run. Counting frames instead would
//! drift as soon as the device drops one under load.

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod demux;
pub mod device;
mod errors;
pub mod logging;
pub mod query;
pub mod reassembler;
pub mod transport;

pub use acquisition::{run_measurement, Pipeline, RunSummary};
pub use codec::{
    decode_ack, encode, AckOutcome, AckStatus, CommandFrame, CommandMarker, Field, RawFrame,
};
pub use config::{
    build_output_config, build_reset_and_configure, start_measurement, stop_measurement,
    CommandBuilder, ConfigCommand, Configuration, ExcitationPair, OutputConfig, RunConfig,
    SweepDefaults,
};
pub use dataset::{DatasetRecord, DatasetSink, DatasetWriter};
pub use demux::{FrameDemultiplexer, LiveChannels, LiveSample, LiveSink, NoLiveFeed};
pub use device::{Instrument, Reply, SettingOutcome};
pub use errors::*;
pub use query::{ConfigurationSnapshot, QueryGroup};
pub use reassembler::StreamReassembler;
pub use transport::Transport;
