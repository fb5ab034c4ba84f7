use thiserror::Error;

/// Errors produced while parsing and validating a CAP v1.2 bulletin.
///
/// Mirrors the `FAIL`/`WARN` distinction in `cap/parser.py`: only the
/// conditions that were fatal there (or promoted to fatal by strict mode)
/// surface as an `Err` here.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid XML: {0}")]
    MalformedXml(String),
    #[error("invalid namespace: {0}")]
    NamespaceMismatch(String),
    #[error("required element missing from <{container}>: {element}")]
    MissingElement { container: &'static str, element: &'static str },
    #[error("invalid timestamp format: {0}")]
    BadTimestamp(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("unknown msgType: {0}")]
    UnknownMsgType(String),
    #[error("malformed <references>: {0}")]
    BadReferences(String),
}

/// Errors returned by the mux control channel (C3).
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer not ready (ping failed)")]
    NotReady,
    #[error("multiplexer disconnected: {0}")]
    Disconnected(String),
}

/// Errors returned by the stream supervisor (C4).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("stream \"{0}\" failed to start {1} times, giving up")]
    FailedToStart(String, u32),
    #[error("stream \"{0}\" misconfigured: {1}")]
    Misconfigured(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors returned while loading the hierarchical mux config or the flat
/// stream config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown output_type: {0}")]
    UnknownOutputType(String),
    #[error("bitrate out of range or not a multiple of 8: {0}")]
    InvalidBitrate(u32),
    #[error("malformed config at line {line}: {msg}")]
    Malformed { line: usize, msg: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure rendering or transcoding the TTS warning message (C7).
///
/// Per spec, a failure here must not abort the Alarm-flag/data-rebroadcast
/// half of the switchover — callers downgrade this to a logged warning
/// rather than propagating it as a hard error.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("TTS synthesis failed: {0}")]
    Synthesis(String),
    #[error("transcode timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("transcode process exited with failure: {0}")]
    Failed(String),
}
