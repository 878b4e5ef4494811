//! LDAP errors

use std::{fmt, io};

use futures::channel::mpsc::SendError;

use crate::{
    ber::DecodeError,
    channel::ChannelError,
    message::{LdapResult, ResultCode},
    model::SearchResult,
    referral::Referral,
};

/// LDAP operation error: a non-success result returned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    /// Result code
    pub result_code: ResultCode,
    /// Matched DN
    pub matched_dn: String,
    /// Diagnostic message
    pub diagnostic_message: String,
    /// Referral URLs of an unresolved referral
    pub referrals: Vec<String>,
}

impl From<LdapResult> for OperationError {
    fn from(r: LdapResult) -> Self {
        OperationError {
            result_code: r.result_code,
            matched_dn: r.matched_dn,
            diagnostic_message: r.diagnostic_message,
            referrals: r.referrals.unwrap_or_default(),
        }
    }
}

impl OperationError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_result_code(self.result_code)
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.diagnostic_message.is_empty() {
            write!(f, "[LDAP: error code {}]", self.result_code)
        } else {
            write!(f, "[LDAP: error code {} - {}]", self.result_code, self.diagnostic_message)
        }
    }
}

impl std::error::Error for OperationError {}

/// Classification of errors, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    CommunicationFailure,
    TimeLimitExceeded,
    SizeLimitExceeded,
    AuthenticationNotSupported,
    PartialResult,
    LimitExceeded,
    OperationNotSupported,
    NoSuchAttribute,
    InvalidSearchFilter,
    InvalidAttributeValue,
    AttributeInUse,
    NameNotFound,
    InvalidName,
    Authentication,
    NoPermission,
    ServiceUnavailable,
    SchemaViolation,
    ContextNotEmpty,
    NameAlreadyBound,
    /// Referral surfaced to the caller in throw mode
    Referral,
    /// Malformed BER on the wire
    Codec,
    /// Invalid configuration, detected before any I/O
    Configuration,
    /// Operation abandoned before its response arrived
    Cancelled,
    /// Any other directory error
    Directory,
}

impl ErrorCategory {
    pub fn from_result_code(code: ResultCode) -> Self {
        match code.code() {
            2 => ErrorCategory::CommunicationFailure,
            3 => ErrorCategory::TimeLimitExceeded,
            4 => ErrorCategory::SizeLimitExceeded,
            7 | 8 | 13 => ErrorCategory::AuthenticationNotSupported,
            9 | 10 => ErrorCategory::PartialResult,
            11 => ErrorCategory::LimitExceeded,
            12 | 53 => ErrorCategory::OperationNotSupported,
            16 | 17 => ErrorCategory::NoSuchAttribute,
            18 => ErrorCategory::InvalidSearchFilter,
            19 | 21 => ErrorCategory::InvalidAttributeValue,
            20 => ErrorCategory::AttributeInUse,
            32 => ErrorCategory::NameNotFound,
            34 | 64 => ErrorCategory::InvalidName,
            48 | 49 => ErrorCategory::Authentication,
            50 => ErrorCategory::NoPermission,
            51 | 52 => ErrorCategory::ServiceUnavailable,
            65 | 67 | 69 => ErrorCategory::SchemaViolation,
            66 => ErrorCategory::ContextNotEmpty,
            68 => ErrorCategory::NameAlreadyBound,
            _ => ErrorCategory::Directory,
        }
    }
}

/// LDAP errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("BER decoding failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("{0}")]
    OperationFailed(OperationError),
    #[error("Referral: {}", .0.referral_info().unwrap_or("none"))]
    Referral(Box<Referral>),
    #[error("Referral hop limit of {0} exceeded")]
    ReferralLimitExceeded(usize),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid LDAP URL: {0}")]
    InvalidUrl(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Operation abandoned")]
    Abandoned,
    #[error("Operation timed out")]
    Timeout,
    #[error("{source}")]
    Search {
        /// Entries and references gathered before the failure
        partial: Box<SearchResult>,
        source: Box<Error>,
    },
}

impl Error {
    /// Taxonomy of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) | Error::Channel(_) | Error::Send(_) | Error::ConnectionClosed => {
                ErrorCategory::CommunicationFailure
            }
            Error::Decode(_) | Error::InvalidResponse => ErrorCategory::Codec,
            Error::OperationFailed(e) => e.category(),
            Error::Referral(_) => ErrorCategory::Referral,
            Error::ReferralLimitExceeded(_) => ErrorCategory::LimitExceeded,
            Error::InvalidFilter(_) => ErrorCategory::InvalidSearchFilter,
            Error::InvalidUrl(_) | Error::Config(_) => ErrorCategory::Configuration,
            Error::Abandoned => ErrorCategory::Cancelled,
            Error::Timeout => ErrorCategory::TimeLimitExceeded,
            Error::Search { source, .. } => source.category(),
        }
    }

    /// Result code of a protocol result error
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Error::OperationFailed(e) => Some(e.result_code),
            Error::Search { source, .. } => source.result_code(),
            _ => None,
        }
    }

    /// Partial search result attached to a failed search
    pub fn partial_result(&self) -> Option<&SearchResult> {
        match self {
            Error::Search { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

impl From<LdapResult> for Error {
    fn from(r: LdapResult) -> Self {
        Error::OperationFailed(r.into())
    }
}
