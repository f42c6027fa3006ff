//! Client and producer configuration.
//!
//! Both structs follow the same pattern: `Default` carries production-safe
//! values, fields are adjusted directly or through the `with_*` helpers,
//! and `validate()` rejects inconsistent combinations before any socket is
//! opened.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::ProducerAccessMode;
use crate::compression::CompressionType;
use crate::crypto::CryptoKeyReader;
use crate::error::{Error, Result};

/// Connection-level configuration shared by every handle of a client.
#[derive(Debug, Clone)]
pub struct ClientConfiguration {
    /// Deadline for request/response exchanges (lookups, producer
    /// creation, stats).
    pub operation_timeout: Duration,
    /// Deadline covering DNS resolution, TCP connect, TLS handshake and
    /// the protocol handshake together.
    pub connection_timeout: Duration,
    /// Maximum in-flight lookup requests per connection. Further lookups
    /// fail immediately instead of queueing.
    pub concurrent_lookup_requests: u32,
    /// Cadence of the producer/consumer stats loggers. Zero disables
    /// stats.
    pub stats_interval: Duration,
    /// First reconnection backoff delay.
    pub initial_backoff: Duration,
    /// Reconnection backoff ceiling.
    pub max_backoff: Duration,
    /// Connect with TLS regardless of the URL scheme.
    pub use_tls: bool,
    /// Skip server certificate verification entirely.
    pub tls_allow_insecure_connection: bool,
    /// Trust anchors for server certificate verification. System roots
    /// are used when unset.
    pub tls_trust_certs_file_path: Option<PathBuf>,
    /// Client certificate chain for mutual TLS.
    pub tls_certificate_file_path: Option<PathBuf>,
    /// Client private key for mutual TLS.
    pub tls_private_key_file_path: Option<PathBuf>,
    /// Verify that the server certificate matches the broker hostname.
    pub validate_hostname: bool,
    /// Process-wide budget for uncompressed in-flight payload bytes. Zero
    /// disables the limit.
    pub memory_limit: usize,
    /// Listener name forwarded with lookups, for brokers with multiple
    /// advertised listeners.
    pub listener_name: Option<String>,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        ClientConfiguration {
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            concurrent_lookup_requests: 50_000,
            stats_interval: Duration::from_secs(600),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            use_tls: false,
            tls_allow_insecure_connection: false,
            tls_trust_certs_file_path: None,
            tls_certificate_file_path: None,
            tls_private_key_file_path: None,
            validate_hostname: false,
            memory_limit: 0,
            listener_name: None,
        }
    }
}

impl ClientConfiguration {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout.is_zero() {
            tracing::error!("operation_timeout must be non-zero");
            return Err(Error::UnknownError);
        }
        if self.connection_timeout.is_zero() {
            tracing::error!("connection_timeout must be non-zero");
            return Err(Error::UnknownError);
        }
        if self.initial_backoff > self.max_backoff {
            tracing::error!(
                initial_backoff_ms = self.initial_backoff.as_millis() as u64,
                max_backoff_ms = self.max_backoff.as_millis() as u64,
                "initial_backoff must not exceed max_backoff"
            );
            return Err(Error::UnknownError);
        }
        if self.tls_certificate_file_path.is_some() != self.tls_private_key_file_path.is_some() {
            tracing::error!("TLS client auth needs both a certificate and a private key");
            return Err(Error::UnknownError);
        }
        Ok(())
    }
}

/// Batch grouping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchingType {
    /// One batch for all messages, flushed on size, count or delay.
    #[default]
    Default,
    /// One batch per ordering key (falling back to the partition key), one
    /// send operation per group on flush.
    KeyBased,
}

/// Message encryption settings.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// Names of the keys the data key is wrapped under.
    pub key_names: Vec<String>,
    /// Source of the wrapping key material.
    pub key_reader: Arc<dyn CryptoKeyReader>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key_names", &self.key_names)
            .finish_non_exhaustive()
    }
}

/// Per-producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfiguration {
    /// Name requested for the producer; broker-assigned when unset.
    pub producer_name: Option<String>,
    /// How long a message may stay unacknowledged before failing with
    /// `Timeout`. Zero disables the timer.
    pub send_timeout: Duration,
    /// Size of the pending-message permit pool. Zero disables the limit.
    pub max_pending_messages: usize,
    /// Block the caller when permits or memory run out, instead of
    /// failing fast.
    pub block_if_queue_full: bool,
    pub batching_enabled: bool,
    pub batching_type: BatchingType,
    pub batching_max_messages: usize,
    pub batching_max_bytes: usize,
    pub batching_max_publish_delay: Duration,
    pub compression_type: CompressionType,
    pub encryption: Option<EncryptionConfig>,
    /// Split messages larger than the frame limit into chunks. Mutually
    /// exclusive with batching.
    pub chunking_enabled: bool,
    /// Starting point for the sequence generator; `-1` adopts the
    /// broker's last persisted sequence on creation.
    pub initial_sequence_id: i64,
    pub access_mode: ProducerAccessMode,
    /// Defer creation of partition producers until first use.
    pub lazy_start_partitioned_producers: bool,
    /// Subscription created together with the producer, if any.
    pub initial_subscription_name: Option<String>,
    /// Free-form metadata attached to the producer.
    pub properties: Vec<(String, String)>,
    /// Schema registered with the producer, if any.
    pub schema: Option<crate::commands::SchemaInfo>,
}

impl Default for ProducerConfiguration {
    fn default() -> Self {
        ProducerConfiguration {
            producer_name: None,
            send_timeout: Duration::from_secs(30),
            max_pending_messages: 1000,
            block_if_queue_full: false,
            batching_enabled: false,
            batching_type: BatchingType::Default,
            batching_max_messages: 1000,
            batching_max_bytes: 128 * 1024,
            batching_max_publish_delay: Duration::from_millis(10),
            compression_type: CompressionType::None,
            encryption: None,
            chunking_enabled: false,
            initial_sequence_id: -1,
            access_mode: ProducerAccessMode::Shared,
            lazy_start_partitioned_producers: false,
            initial_subscription_name: None,
            properties: Vec::new(),
            schema: None,
        }
    }
}

impl ProducerConfiguration {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.chunking_enabled && self.batching_enabled {
            tracing::error!("chunking and batching are mutually exclusive");
            return Err(Error::UnknownError);
        }
        if self.batching_enabled && self.batching_max_messages == 0 {
            tracing::error!("batching_max_messages must be non-zero when batching");
            return Err(Error::UnknownError);
        }
        if self.initial_sequence_id < -1 {
            tracing::error!(
                initial_sequence_id = self.initial_sequence_id,
                "initial_sequence_id must be -1 or non-negative"
            );
            return Err(Error::UnknownError);
        }
        Ok(())
    }

    /// Whether this producer is lazily (re)created and should keep
    /// retrying creation failures.
    pub fn is_lazy_shared(&self) -> bool {
        self.lazy_start_partitioned_producers && self.access_mode == ProducerAccessMode::Shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults_are_valid() {
        ClientConfiguration::default().validate().unwrap();
    }

    #[test]
    fn test_producer_defaults_are_valid() {
        ProducerConfiguration::default().validate().unwrap();
    }

    #[test]
    fn test_zero_operation_timeout_rejected() {
        let config = ClientConfiguration {
            operation_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_ordering_enforced() {
        let config = ClientConfiguration {
            initial_backoff: Duration::from_secs(120),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_client_auth_needs_both_files() {
        let config = ClientConfiguration {
            tls_certificate_file_path: Some("client.pem".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunking_and_batching_are_exclusive() {
        let config = ProducerConfiguration {
            chunking_enabled: true,
            batching_enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_initial_sequence_rejected() {
        let config = ProducerConfiguration {
            initial_sequence_id: -7,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lazy_shared_detection() {
        let config = ProducerConfiguration {
            lazy_start_partitioned_producers: true,
            access_mode: ProducerAccessMode::Shared,
            ..Default::default()
        };
        assert!(config.is_lazy_shared());

        let exclusive = ProducerConfiguration {
            lazy_start_partitioned_producers: true,
            access_mode: ProducerAccessMode::Exclusive,
            ..Default::default()
        };
        assert!(!exclusive.is_lazy_shared());
    }
}
