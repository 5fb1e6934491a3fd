use thiserror::Error;

/// The seven error kinds the dispatcher and session layer can raise.
/// Client-visible failures are expressed through close codes only -- DISPATCH
/// frames never carry a `GatewayError`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("client protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("resume out of window: client_last_seq={client_last_seq} buffer_oldest={buffer_oldest}")]
    ResumeOutOfWindow {
        client_last_seq: u64,
        buffer_oldest: u64,
    },

    #[error("session send queue saturated")]
    SlowConsumer,

    #[error("bus unavailable: {0}")]
    BusUnavailable(#[from] gw_bus::BusError),

    #[error("store lookup failed: {0}")]
    StoreLookup(#[source] sqlx::Error),

    #[error("session fiber panicked: {0}")]
    FiberPanic(String),
}

impl GatewayError {
    /// The close code a fatal variant maps onto, if the session should be
    /// torn down. Bus/store errors don't map to a close code directly --
    /// callers decide resumability from context.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::ProtocolViolation(_) => Some(gw_protocol::close_code::UNKNOWN),
            GatewayError::AuthFailed => Some(gw_protocol::close_code::AUTH_FAILED),
            GatewayError::ResumeOutOfWindow { .. } => Some(gw_protocol::close_code::INVALID_SEQ),
            GatewayError::SlowConsumer => Some(gw_protocol::close_code::SESSION_TIMEOUT),
            _ => None,
        }
    }
}
