//! Operation outcomes and wire-level errors.

use std::fmt;

use thiserror::Error;

/// Outcome of a client operation, delivered through its callback.
///
/// These partition into configuration errors detected synchronously at
/// dispatch (`NotASpace`, `BadDimension`, `BadSearch`), connectivity errors
/// (`CoordFail`, `ConnectFail`, `Disconnect`), protocol errors
/// (`ServerError`, `LogicError`, `WrongArity`), and lifecycle signals
/// (`Reconfigure`, `Timeout`, `NotFound`). The client retries nothing on the
/// caller's behalf; every terminal condition reaches the callback exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The operation completed.
    Success,
    /// The key does not exist.
    NotFound,
    /// The supplied value does not match the space's dimension count.
    WrongArity,
    /// The named space does not exist in the current configuration.
    NotASpace,
    /// The search constraints are malformed.
    BadSearch,
    /// An update named a dimension the space does not have.
    BadDimension,
    /// The coordinator link could not be (re)established.
    CoordFail,
    /// No channel to the responsible instance could be opened.
    ConnectFail,
    /// The channel failed while the operation was in flight.
    Disconnect,
    /// A new configuration moved the operation's entity to another instance.
    Reconfigure,
    /// The flush deadline elapsed before a response arrived.
    Timeout,
    /// The server misbehaved or sent an undecodable response.
    ServerError,
    /// An internal invariant was violated.
    LogicError,
}

impl ReturnCode {
    /// Codes worth retrying after refreshing state; everything else is
    /// either final or indicates a caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Reconfigure | Self::Disconnect | Self::Timeout)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NotFound => "not found",
            Self::WrongArity => "wrong arity",
            Self::NotASpace => "not a space",
            Self::BadSearch => "bad search",
            Self::BadDimension => "bad dimension",
            Self::CoordFail => "coordinator failure",
            Self::ConnectFail => "connect failure",
            Self::Disconnect => "disconnect",
            Self::Reconfigure => "reconfigured",
            Self::Timeout => "timeout",
            Self::ServerError => "server error",
            Self::LogicError => "logic error",
        };
        f.write_str(s)
    }
}

/// Errors raised while encoding or decoding frames and payloads.
#[derive(Debug, Error)]
pub enum WireError {
    /// Fewer bytes available than the field requires.
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// The size field disagrees with the buffer length.
    #[error("frame size mismatch: header claims {claimed}, buffer holds {actual}")]
    SizeMismatch { claimed: usize, actual: usize },

    /// The type byte names no known message.
    #[error("unknown message type {0:#04x}")]
    UnknownMsgType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(ReturnCode::Reconfigure.is_transient());
        assert!(ReturnCode::Disconnect.is_transient());
        assert!(ReturnCode::Timeout.is_transient());
        assert!(!ReturnCode::Success.is_transient());
        assert!(!ReturnCode::NotASpace.is_transient());
        assert!(!ReturnCode::ServerError.is_transient());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ReturnCode::NotASpace.to_string(), "not a space");
        assert_eq!(ReturnCode::Timeout.to_string(), "timeout");
    }
}
