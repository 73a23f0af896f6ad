//! Protocol errors.
//!
//! Three families share one enum:
//! - structural/config errors, raised before any node executes
//! - registry state-machine violations, raised with no state mutation
//! - result errors, raised when a fulfillment is turned back into a value

use thiserror::Error;

/// Errors surfaced by the DON protocol engines.
#[derive(Debug, Error)]
pub enum DonError {
    #[error("Invalid secrets format: {0}")]
    InvalidSecretsFormat(String),

    #[error("Unsupported code location: {0}")]
    UnsupportedCodeLocation(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Quorum not reached: {0}")]
    QuorumNotReached(String),

    #[error("Unauthorized sender: {0}")]
    UnauthorizedSender(String),

    #[error("Subscription {0} is not funded")]
    SubscriptionNotFunded(u64),

    #[error("Request {0} was already fulfilled")]
    DuplicateFulfillment(String),

    #[error("Gas limit {requested} exceeds maximum {max}")]
    GasLimitExceeded { requested: u32, max: u32 },

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Per-node secrets count {actual} does not match node count {expected}")]
    NodeCountMismatch { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("No requester wallet at offset {0}")]
    UnknownRequester(u32),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Secrets decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(u64),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Request {0} timed out")]
    RequestTimedOut(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Discriminant of [`DonError`], for matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSecretsFormat,
    UnsupportedCodeLocation,
    UnsupportedLanguage,
    ExecutionTimeout,
    ExecutionFailed,
    QuorumNotReached,
    UnauthorizedSender,
    SubscriptionNotFunded,
    DuplicateFulfillment,
    GasLimitExceeded,
    EventNotFound,
    TypeMismatch,
    NodeCountMismatch,
    InvalidPublicKey,
    UnknownRequester,
    MalformedPayload,
    InvalidSignature,
    DecryptionFailed,
    SubscriptionNotFound,
    InvalidAmount,
    InsufficientBalance,
    UnknownRequest,
    RequestTimedOut,
    InvalidConfig,
}

impl DonError {
    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DonError::InvalidSecretsFormat(_) => ErrorKind::InvalidSecretsFormat,
            DonError::UnsupportedCodeLocation(_) => ErrorKind::UnsupportedCodeLocation,
            DonError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            DonError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            DonError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            DonError::QuorumNotReached(_) => ErrorKind::QuorumNotReached,
            DonError::UnauthorizedSender(_) => ErrorKind::UnauthorizedSender,
            DonError::SubscriptionNotFunded(_) => ErrorKind::SubscriptionNotFunded,
            DonError::DuplicateFulfillment(_) => ErrorKind::DuplicateFulfillment,
            DonError::GasLimitExceeded { .. } => ErrorKind::GasLimitExceeded,
            DonError::EventNotFound(_) => ErrorKind::EventNotFound,
            DonError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            DonError::NodeCountMismatch { .. } => ErrorKind::NodeCountMismatch,
            DonError::InvalidPublicKey(_) => ErrorKind::InvalidPublicKey,
            DonError::UnknownRequester(_) => ErrorKind::UnknownRequester,
            DonError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            DonError::InvalidSignature => ErrorKind::InvalidSignature,
            DonError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            DonError::SubscriptionNotFound(_) => ErrorKind::SubscriptionNotFound,
            DonError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            DonError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            DonError::UnknownRequest(_) => ErrorKind::UnknownRequest,
            DonError::RequestTimedOut(_) => ErrorKind::RequestTimedOut,
            DonError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Creates a malformed payload error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = DonError> = std::result::Result<T, E>;
