use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer too short")]
    BufferTooShort,
    #[error("BMP header error: {0:?}")]
    BmpHeader(BmpHeaderErrorSubcode),
    #[error("first message is not initiation")]
    NotInitiated,
    #[error("BGP message header error: {0:?}")]
    MsgHeader(MsgHeaderErrorSubcode),
    #[error("BGP open message error: {0:?}")]
    Open(OpenMsgErrorSubcode),
    #[error("BGP update message error: {0}")]
    Update(#[from] UpdateError),
    #[error("too many peer up events")]
    PeerReferenceExhausted,
    #[error("invalid route distinguisher: {0}")]
    InvalidRouteDistinguisher(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("provider already started")]
    AlreadyStarted,
}

impl Error {
    pub fn err_bmp<T>(subcode: BmpHeaderErrorSubcode) -> Result<T> {
        Err(Error::BmpHeader(subcode))
    }

    pub fn err_header<T>(subcode: MsgHeaderErrorSubcode) -> Result<T> {
        Err(Error::MsgHeader(subcode))
    }

    pub fn err_open<T>(subcode: OpenMsgErrorSubcode) -> Result<T> {
        Err(Error::Open(subcode))
    }

    pub fn err_update<T>(
        subcode: UpdateMsgErrorSubcode,
        handling: ErrorHandling,
        reason: &'static str,
    ) -> Result<T> {
        Err(Error::Update(UpdateError {
            subcode,
            handling,
            reason,
        }))
    }

    /// Whether the connection carrying the offending message must be closed.
    /// Only errors raised while decoding an UPDATE body are recoverable: they
    /// are classified per RFC 7606 and the message is skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Update(_))
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmpHeaderErrorSubcode {
    UnsupportedVersion = 1,
    BadMessageLength = 2,
    BadPeerHeader = 3,
    UnexpectedBgpMessage = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgHeaderErrorSubcode {
    ConnectionNotSync = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMsgErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    // Deprecated = 5,
    UnacceptableHoldTime = 6,
    UnSupportedCapability = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMsgErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    // Deprecated = 7,
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// RFC 7606 revised error handling for UPDATE messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorHandling {
    None,
    AttributeDiscard,
    TreatAsWithdraw,
    AfiSafiDisable,
    SessionReset,
}

impl ErrorHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorHandling::None => "none",
            ErrorHandling::AttributeDiscard => "attribute-discard",
            ErrorHandling::TreatAsWithdraw => "treat-as-withdraw",
            ErrorHandling::AfiSafiDisable => "afi-safi",
            ErrorHandling::SessionReset => "session-reset",
        }
    }
}

impl fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{reason} ({subcode:?}, {handling})")]
pub struct UpdateError {
    pub subcode: UpdateMsgErrorSubcode,
    pub handling: ErrorHandling,
    pub reason: &'static str,
}

impl UpdateError {
    pub fn new(
        subcode: UpdateMsgErrorSubcode,
        handling: ErrorHandling,
        reason: &'static str,
    ) -> UpdateError {
        UpdateError {
            subcode,
            handling,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_update_errors_are_recoverable() {
        let err = Error::Update(UpdateError::new(
            UpdateMsgErrorSubcode::MalformedAsPath,
            ErrorHandling::TreatAsWithdraw,
            "AS path segment overrun",
        ));
        assert!(!err.is_fatal());
        assert!(Error::NotInitiated.is_fatal());
        assert!(Error::BufferTooShort.is_fatal());
        assert!(Error::MsgHeader(MsgHeaderErrorSubcode::ConnectionNotSync).is_fatal());
    }

    #[test]
    fn update_error_display() {
        let err = UpdateError::new(
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::AttributeDiscard,
            "invalid aggregator length",
        );
        assert_eq!(
            err.to_string(),
            "invalid aggregator length (AttributeLengthError, attribute-discard)"
        );
    }
}
