//! Crate & protocol level errors.
//!
//! This module provides the top-level error types for the Pulsaresque
//! client.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Client Layer
//!
//! - [`Error`]: the result codes observed by callers of the client API.
//!   Every request future, send callback, and connection close reason
//!   resolves to one of these.
//!
//! ## Wire Layer
//!
//! - [`ServerError`]: error codes reported by the broker inside ERROR,
//!   SEND_ERROR and failed lookup responses.
//!
//! ## Conversion
//!
//! [`Error::from_server_error`] is the total mapping from broker codes to
//! client codes, including the retryability rule for `ServiceNotReady`.

use std::{io, result};

use num_derive::FromPrimitive;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Result codes observed by callers of the client API.
///
/// These cover connection lifecycle failures, per-request broker errors and
/// producer pipeline rejections. Variants are fieldless so they can be
/// matched and compared directly; context travels through `tracing` fields
/// instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The client is not connected to a broker.
    #[error("not connected to broker")]
    NotConnected,

    /// The operation did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// A transient failure; the operation can be retried on a fresh
    /// connection.
    #[error("retryable error")]
    Retryable,

    /// The connection to the broker was lost.
    #[error("connection disconnected")]
    Disconnected,

    /// The producer or consumer was already closed.
    #[error("already closed")]
    AlreadyClosed,

    /// Failed to establish a connection to the broker.
    #[error("connection error")]
    ConnectError,

    /// The broker rejected the client's credentials.
    #[error("authentication error")]
    AuthenticationError,

    /// The client is not authorized for the requested operation.
    #[error("authorization error")]
    AuthorizationError,

    /// A frame or message failed CRC-32C verification.
    #[error("checksum error")]
    ChecksumError,

    /// The broker failed to read its metadata store.
    #[error("broker metadata error")]
    BrokerMetadataError,

    /// The broker failed to persist the message.
    #[error("broker persistence error")]
    BrokerPersistenceError,

    /// An exclusive consumer is already connected.
    #[error("consumer busy")]
    ConsumerBusy,

    /// The service unit (topic bundle) is not served by this broker.
    #[error("service unit not ready")]
    ServiceUnitNotReady,

    /// Producer rejected because the topic backlog quota was exceeded.
    #[error("producer blocked: backlog quota exceeded (error)")]
    ProducerBlockedQuotaExceededError,

    /// Producer blocked on creation because the topic backlog quota was
    /// exceeded.
    #[error("producer blocked: backlog quota exceeded (exception)")]
    ProducerBlockedQuotaExceededException,

    /// The topic does not exist.
    #[error("topic not found")]
    TopicNotFound,

    /// The subscription does not exist.
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// The consumer does not exist on the broker.
    #[error("consumer not found")]
    ConsumerNotFound,

    /// The broker does not support the requested protocol feature.
    #[error("unsupported version")]
    UnsupportedVersion,

    /// Too many concurrent lookup requests on this connection.
    #[error("too many lookup requests")]
    TooManyLookupRequests,

    /// The topic was terminated and accepts no more writes.
    #[error("topic terminated")]
    TopicTerminated,

    /// An exclusive producer is already connected.
    #[error("producer busy")]
    ProducerBusy,

    /// The topic name is malformed.
    #[error("invalid topic name")]
    InvalidTopicName,

    /// The supplied schema is incompatible with the topic schema.
    #[error("incompatible schema")]
    IncompatibleSchema,

    /// The broker failed to assign the consumer.
    #[error("consumer assignment error")]
    ConsumerAssignError,

    /// The transaction coordinator does not exist.
    #[error("transaction coordinator not found")]
    TransactionCoordinatorNotFound,

    /// The transaction is in an invalid status for the operation.
    #[error("invalid transaction status")]
    InvalidTxnStatus,

    /// The operation is not allowed.
    #[error("operation not allowed")]
    NotAllowed,

    /// The transaction conflicts with another in-flight transaction.
    #[error("transaction conflict")]
    TransactionConflict,

    /// The transaction does not exist.
    #[error("transaction not found")]
    TransactionNotFound,

    /// The producer was fenced by a newer producer on an exclusive topic.
    #[error("producer fenced")]
    ProducerFenced,

    /// The message is not valid for publishing (e.g. a user-supplied
    /// producer name on a non-replicated message).
    #[error("invalid message")]
    InvalidMessage,

    /// The message exceeds the negotiated maximum frame size.
    #[error("message too big")]
    MessageTooBig,

    /// The producer pending-message queue is full.
    #[error("producer queue is full")]
    ProducerQueueIsFull,

    /// The process-wide memory budget is exhausted.
    #[error("memory buffer is full")]
    MemoryBufferIsFull,

    /// A blocking operation was interrupted by close.
    #[error("interrupted")]
    Interrupted,

    /// Message encryption failed.
    #[error("crypto error")]
    CryptoError,

    /// A frame could not be decoded.
    #[error("malformed frame")]
    MalformedFrame,

    /// The broker sent a command this client does not understand.
    #[error("unknown command")]
    UnknownCommand,

    /// An unexpected broker error.
    #[error("unknown error")]
    UnknownError,
}

impl Error {
    /// Whether the reconnection machinery should retry after this error
    /// regardless of handler state.
    pub fn is_retryable(self) -> bool {
        matches!(self, Error::Retryable)
    }

    /// Map a broker-reported wire error to the client result code.
    ///
    /// The mapping is total: every [`ServerError`] has exactly one client
    /// code. `ServiceNotReady` is the one data-dependent case: unless the
    /// broker message names a `PulsarServerException` the condition is
    /// treated as retryable, since it usually means the topic is being
    /// unloaded to another broker.
    pub fn from_server_error(error: ServerError, message: &str) -> Error {
        match error {
            ServerError::UnknownError => Error::UnknownError,
            ServerError::MetadataError => Error::BrokerMetadataError,
            ServerError::PersistenceError => Error::BrokerPersistenceError,
            ServerError::AuthenticationError => Error::AuthenticationError,
            ServerError::AuthorizationError => Error::AuthorizationError,
            ServerError::ConsumerBusy => Error::ConsumerBusy,
            ServerError::ServiceNotReady => {
                if message.contains("PulsarServerException") {
                    Error::ServiceUnitNotReady
                } else {
                    Error::Retryable
                }
            }
            ServerError::ProducerBlockedQuotaExceededError => {
                Error::ProducerBlockedQuotaExceededError
            }
            ServerError::ProducerBlockedQuotaExceededException => {
                Error::ProducerBlockedQuotaExceededException
            }
            ServerError::ChecksumError => Error::ChecksumError,
            ServerError::UnsupportedVersionError => Error::UnsupportedVersion,
            ServerError::TopicNotFound => Error::TopicNotFound,
            ServerError::SubscriptionNotFound => Error::SubscriptionNotFound,
            ServerError::ConsumerNotFound => Error::ConsumerNotFound,
            ServerError::TooManyRequests => Error::TooManyLookupRequests,
            ServerError::TopicTerminatedError => Error::TopicTerminated,
            ServerError::ProducerBusy => Error::ProducerBusy,
            ServerError::InvalidTopicName => Error::InvalidTopicName,
            ServerError::IncompatibleSchema => Error::IncompatibleSchema,
            ServerError::ConsumerAssignError => Error::ConsumerAssignError,
            ServerError::TransactionCoordinatorNotFound => Error::TransactionCoordinatorNotFound,
            ServerError::InvalidTxnStatus => Error::InvalidTxnStatus,
            ServerError::NotAllowedError => Error::NotAllowed,
            ServerError::TransactionConflict => Error::TransactionConflict,
            ServerError::TransactionNotFound => Error::TransactionNotFound,
            ServerError::ProducerFenced => Error::ProducerFenced,
        }
    }
}

impl From<io::Error> for Error {
    fn from(_: io::Error) -> Self {
        Error::Disconnected
    }
}

/// Error codes reported by the broker on the wire.
///
/// See the `ServerError` enum of the Pulsar protocol. The numeric values
/// are part of the wire contract and must not be reordered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ServerError {
    /// An unclassified broker-side failure.
    UnknownError = 0,
    /// The broker failed to read from its metadata store.
    MetadataError = 1,
    /// The broker failed to persist the entry.
    PersistenceError = 2,
    /// The supplied credentials were rejected.
    AuthenticationError = 3,
    /// The principal is not permitted to perform the operation.
    AuthorizationError = 4,
    /// An exclusive consumer is already connected.
    ConsumerBusy = 5,
    /// The topic is not currently served by this broker.
    ServiceNotReady = 6,
    /// Producer rejected: the backlog quota was exceeded.
    ProducerBlockedQuotaExceededError = 7,
    /// Producer creation blocked: the backlog quota was exceeded.
    ProducerBlockedQuotaExceededException = 8,
    /// The frame checksum did not match.
    ChecksumError = 9,
    /// The request requires a protocol feature the peer lacks.
    UnsupportedVersionError = 10,
    /// The topic does not exist.
    TopicNotFound = 11,
    /// The subscription does not exist.
    SubscriptionNotFound = 12,
    /// The consumer does not exist.
    ConsumerNotFound = 13,
    /// The broker is shedding load; retry against another broker.
    TooManyRequests = 14,
    /// The topic was terminated.
    TopicTerminatedError = 15,
    /// An exclusive producer is already connected.
    ProducerBusy = 16,
    /// The topic name is malformed.
    InvalidTopicName = 17,
    /// The schema is incompatible with the topic schema.
    IncompatibleSchema = 18,
    /// The broker failed to assign the consumer.
    ConsumerAssignError = 19,
    /// The transaction coordinator does not exist.
    TransactionCoordinatorNotFound = 20,
    /// The transaction is in an invalid status.
    InvalidTxnStatus = 21,
    /// The operation is not allowed.
    NotAllowedError = 22,
    /// The transaction conflicts with another transaction.
    TransactionConflict = 23,
    /// The transaction does not exist.
    TransactionNotFound = 24,
    /// The producer was fenced by a newer exclusive producer.
    ProducerFenced = 25,
}
