use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed acknowledgement: {bytes:02X?}")]
    MalformedAck { bytes: Vec<u8> },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid {setting}: {value} (allowed {allowed})")]
    InvalidParameter {
        setting: &'static str,
        value: String,
        allowed: &'static str,
    },
    #[error("decode error: {reason} (bytes={bytes:02X?})")]
    Decode { reason: String, bytes: Vec<u8> },
    #[error("command payload of {len} bytes does not fit a one-byte length field")]
    FrameTooLong { len: usize },
}

impl DriverError {
    pub(crate) fn decode(reason: impl Into<String>, bytes: &[u8]) -> Self {
        DriverError::Decode {
            reason: reason.into(),
            bytes: bytes.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
