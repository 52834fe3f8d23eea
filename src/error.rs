use std::fmt;

/// Failure taxonomy for the scheduling and hand-off core.
///
/// Deadline misses are not errors: a miss is a recorded statistic
/// plus an optional callback, never an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtError {
    /// Invalid task or pipeline configuration. Fatal at construction.
    Config(String),
    /// Device open, thread creation, affinity or priority failure. Fatal at start.
    Resource(String),
    /// `end_measurement` with a handle that was never issued or was already consumed.
    MeasurementMisuse(String),
    /// Statistics queried for a name with no recorded measurement.
    UnknownTask(String),
    /// A frame without valid dimensions reached a stage that needs one.
    Input(String),
}

impl RtError {
    pub fn code(&self) -> &'static str {
        match self {
            RtError::Config(_) => "CONFIG_ERROR",
            RtError::Resource(_) => "RESOURCE_ERROR",
            RtError::MeasurementMisuse(_) => "MEASUREMENT_MISUSE",
            RtError::UnknownTask(_) => "UNKNOWN_TASK",
            RtError::Input(_) => "INPUT_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RtError::Config(msg)
            | RtError::Resource(msg)
            | RtError::MeasurementMisuse(msg)
            | RtError::UnknownTask(msg)
            | RtError::Input(msg) => msg,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, RtError::Config(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, RtError::Resource(_))
    }
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for RtError {}

pub type RtResult<T> = std::result::Result<T, RtError>;

pub(crate) fn config_err(msg: impl Into<String>) -> RtError {
    RtError::Config(msg.into())
}

pub(crate) fn resource_err(msg: impl Into<String>) -> RtError {
    RtError::Resource(msg.into())
}

pub(crate) fn input_err(msg: impl Into<String>) -> RtError {
    RtError::Input(msg.into())
}
