use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("bulk length {0} exceeds the maximum allowed size")]
    LengthTooLarge(i64),
    #[error("invalid integer in frame header")]
    InvalidInteger,
}
