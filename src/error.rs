//! Error types for call setup and negotiation

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting, negotiating or tearing down a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No capture source produced a local stream
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Description applied out of order, twice, or against the assigned role
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Remote candidate applied before a remote description exists
    #[error("ICE candidate error: {0}")]
    Ice(String),

    /// Side channel used while not open
    #[error("Channel not open: {0}")]
    ChannelState(String),

    /// Relay refused or could not deliver (e.g. room full)
    #[error("Relay delivery error: {0}")]
    RelayDelivery(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// A transport step did not resolve in time
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A call is already in progress
    #[error("A call is already active in room {0}")]
    SessionActive(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error terminates the current call through the hang-up path
    pub fn ends_call(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_)
                | Error::OperationTimeout(_)
                | Error::WebRtc(_)
                | Error::Signaling(_)
        )
    }

    /// Relay-level notices that are reported but never crash the session
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::RelayDelivery(_))
    }
}
