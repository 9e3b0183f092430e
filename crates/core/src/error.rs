/// Result alias that carries the custom [`ShowError`] type.
pub type Result<T> = std::result::Result<T, ShowError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ShowError {
    /// A cue or show failed validation before anything was scheduled.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A packet failed integrity checks and must not reach the hardware.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The control link is unhealthy. Always fatal to a running show.
    #[error("connection error: {0}")]
    Connection(String),
    /// Fault reported by the transport (voltage, continuity).
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    /// The readiness checklist did not pass.
    #[error("system not ready: {0}")]
    NotReady(String),
    /// The requested operation is not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// Output number outside `1..=total`.
    #[error("output {output} is out of range (1..={total})")]
    OutOfRange { output: u32, total: u32 },
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShowError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns true for errors that must end the active show.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::HardwareFault(_))
    }
}

impl From<&str> for ShowError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ShowError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Reasons a cue or show is rejected at load or test-fire time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("cue {cue}: missing required field `{field}` for {kind}")]
    MissingField {
        cue: String,
        kind: String,
        field: &'static str,
    },
    #[error("cue {cue}: unknown cue type `{kind}`")]
    UnknownKind { cue: String, kind: String },
    #[error("cue {cue}: output {output} is out of range (1..={total})")]
    OutputOutOfRange { cue: String, output: u32, total: u32 },
    #[error("cue {cue}: output {output} appears more than once")]
    DuplicateOutput { cue: String, output: u32 },
    #[error("cue {cue}: {count} simultaneous outputs exceeds the safety limit of {limit}")]
    TooManySimultaneous {
        cue: String,
        count: usize,
        limit: usize,
    },
    #[error("cue {cue}: run range {start}..={end} is reversed")]
    ReversedRange { cue: String, start: u32, end: u32 },
    #[error("cue {cue}: output {output} is still active from a previous pulse")]
    OutputActive { cue: String, output: u32 },
    #[error("cue {cue} at {time_ms}ms is scheduled before the previous cue at {previous_ms}ms")]
    Unsorted {
        cue: String,
        time_ms: u64,
        previous_ms: u64,
    },
    #[error("cannot load an empty show")]
    EmptyShow,
    #[error("invalid cue at index {index}: {source}")]
    InShow {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
    #[error("invalid show document: {0}")]
    Document(String),
}

/// Integrity failures for [`crate::ShiftRegisterPacket`]s.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("payload length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("packet is {age_secs:.1}s old")]
    Stale { age_secs: f64 },
    #[error("packet timestamp is {ahead_secs:.1}s in the future")]
    FromFuture { ahead_secs: f64 },
    #[error("malformed packet: {0}")]
    Malformed(String),
}
