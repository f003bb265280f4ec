use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated record while reading {0}")]
    TruncatedRecord(&'static str),

    #[error("string field is not valid UTF-8: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("invalid string length {0}")]
    InvalidLength(i32),

    #[error("invalid day-count timestamp {0}")]
    InvalidTimestamp(f64),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

#[derive(Error, Debug)]
pub enum SessionLogError {
    #[error("invalid sequencing: {0}")]
    InvalidSequencing(&'static str),

    #[error("unsupported stage type code {0}")]
    UnsupportedStageType(i32),

    #[error("trial record does not match the {0} session layout")]
    MismatchedTrial(&'static str),

    #[error("{0} headers must carry calibration scalars if and only if the stage defines them")]
    CalibrationMismatch(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("malformed message header: {0}")]
    MalformedHeader(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("payload shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("message has {0} frames, too few for its layout")]
    MissingFrames(usize),

    #[error("control channel silent for {0} ms")]
    StaleConnection(u64),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum ConditionerError {
    #[error("channel length mismatch: channel a has {a} samples, channel b has {b}")]
    ChannelMismatch { a: usize, b: usize },

    #[error("invalid filter design: {0}")]
    InvalidDesign(String),
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("stimulator {0} is not available")]
    Unavailable(usize),

    #[error("stimulator rejected the request: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator command failures. The display text is what the operator sees.
#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Command failed: invalid operation")]
    InvalidOperation,

    #[error("Command failed: invalid value")]
    InvalidValue,

    #[error("Command failed: lower bound cannot be higher than the upper bound")]
    LowerAboveUpper,

    #[error("Command failed: upper bound cannot be lower than the lower bound")]
    UpperBelowLower,

    #[error("Command failed: expected 'auto on' or 'auto off'")]
    InvalidToggle,

    #[error("Command not recognized")]
    NotRecognized,

    #[error("Command failed: this stage does not accept commands")]
    Unsupported,
}

/// A stage could not start. Carries one sentence for the operator.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct PreconditionFailed(pub String);

pub type Result<T> = std::result::Result<T, SessionLogError>;
