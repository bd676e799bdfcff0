use thiserror::Error;

use crate::types::RadioMode;

/// Recovery class of a failure. The control loop never terminates on any of
/// them; the class only selects how it backs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientIo,
    ResourceExhaustion,
    ProtocolMismatch,
    ConfigurationAbsent,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("out of memory while preparing request buffers")]
    OutOfMemory,
    #[error("transport failure: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected HTTP status {status} from {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("sensor fault: {0}")]
    Sensor(String),
    #[error("radio fault: {0}")]
    Radio(String),
    #[error("storage fault: {0}")]
    Storage(String),
    #[error("no valid credentials available")]
    CredentialsAbsent,
    #[error("backend link is down")]
    LinkDown,
    #[error("radio is held in {0} mode")]
    RadioBusy(RadioMode),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::OutOfMemory) => ErrorKind::ResourceExhaustion,
            Self::Transport(_)
            | Self::Sensor(_)
            | Self::Radio(_)
            | Self::Storage(_)
            | Self::LinkDown
            | Self::RadioBusy(_) => ErrorKind::TransientIo,
            Self::UnexpectedStatus { .. } | Self::Malformed(_) => ErrorKind::ProtocolMismatch,
            Self::CredentialsAbsent => ErrorKind::ConfigurationAbsent,
        }
    }

    pub fn is_sensor_fault(&self) -> bool {
        matches!(self, Self::Sensor(_))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
