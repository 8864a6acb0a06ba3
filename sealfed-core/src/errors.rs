use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Structured rejection returned by the token service or a target service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInfo {
    pub actor: String,
    pub code: String,
    pub message: String,
}

impl FaultInfo {
    pub fn new(
        actor: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (actor={}, code={})",
            self.message, self.actor, self.code
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("got unexpected response {code} from {url}")]
    UnexpectedStatus { code: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Connection { url: String, message: String },
}

impl TransportError {
    /// HTTP status carried by the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::UnexpectedStatus { code, .. } => Some(*code),
            TransportError::Connection { .. } => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            TransportError::UnexpectedStatus { url, .. }
            | TransportError::Connection { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("failed to load credentials: {0}")]
    CredentialLoad(String),
    #[error("security token response is faulty: {0}")]
    TokenExchangeFault(FaultInfo),
    #[error("service replied with fault: {0}")]
    ServiceFault(FaultInfo),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("untrusted signature: {0}")]
    Untrusted(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("xml error: {0}")]
    Xml(String),
}

impl Error {
    /// Fault details for token-service and target-service rejections.
    pub fn fault(&self) -> Option<&FaultInfo> {
        match self {
            Error::TokenExchangeFault(fault) | Error::ServiceFault(fault) => Some(fault),
            _ => None,
        }
    }
}
