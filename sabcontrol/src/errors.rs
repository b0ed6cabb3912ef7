use thiserror::Error;

/// UPnP error code a renderer returns when asked for a transport
/// transition it is already in (e.g. Pause while paused).
pub const TRANSITION_NOT_AVAILABLE: u32 = 701;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{action}: transport error: {message}")]
    Network { action: String, message: String },

    #[error("{action} returned UPnP error {code}: {description}")]
    Upnp {
        action: String,
        code: u32,
        description: String,
    },

    #[error("{action} failed with HTTP status {status}")]
    HttpStatus { action: String, status: u16 },

    #[error("Missing {0} element in SOAP response")]
    MissingField(String),

    #[error("Invalid {name} value: {value}")]
    BadValue { name: String, value: String },

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Device {0} is not reachable")]
    DeviceUnreachable(String),

    #[error("No reachable device to query zone topology")]
    NoTopologySource,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(String),
}

impl ControlError {
    pub fn network(action: &str, message: impl std::fmt::Display) -> Self {
        ControlError::Network {
            action: action.to_string(),
            message: message.to_string(),
        }
    }

    pub fn missing_field(name: &str) -> Self {
        ControlError::MissingField(name.to_string())
    }

    pub fn bad_value(name: &str, value: &str) -> Self {
        ControlError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// "Already in the requested state"; callers of Pause/Stop treat this
    /// as success.
    pub fn is_transition_unavailable(&self) -> bool {
        matches!(
            self,
            ControlError::Upnp {
                code: TRANSITION_NOT_AVAILABLE,
                ..
            }
        )
    }

    /// Errors worth retrying: transport-level failures only. A SOAP fault
    /// is an answer, not a failure.
    pub fn is_network_error(&self) -> bool {
        matches!(self, ControlError::Network { .. })
    }
}

impl From<sabstore::rusqlite::Error> for ControlError {
    fn from(e: sabstore::rusqlite::Error) -> Self {
        ControlError::Db(e.to_string())
    }
}
