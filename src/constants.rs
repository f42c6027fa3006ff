//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers and protocol constants used
//! throughout the Pulsaresque client. Having them in one place makes it
//! easier to:
//!
//! - Understand the protocol constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Protocol Constants**: Pulsar wire protocol magics and limits
//! - **Network Constants**: Connection buffers and socket tuning
//! - **Timing Constants**: Keep-alive and refresh cadences

// =============================================================================
// Protocol Constants (Pulsar Wire Protocol)
// =============================================================================

/// Magic prefix announcing a broker entry metadata section in a
/// payload-bearing frame. Optional; when present it precedes the checksum
/// section.
pub const MAGIC_BROKER_ENTRY_METADATA: u16 = 0x0e01;

/// Magic prefix announcing a CRC-32C checksum in a payload-bearing frame.
///
/// The checksum that follows covers every byte after the checksum field
/// itself through the end of the frame (message metadata plus payload).
pub const MAGIC_CRC32C: u16 = 0x0e02;

/// Default maximum size of a single frame (5 MiB).
///
/// The broker advertises its own limit in the CONNECTED response; this is
/// the value assumed until that negotiation has happened.
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 5 * 1024 * 1024;

/// Lowest protocol version this client speaks.
pub const PROTOCOL_VERSION_MIN: i32 = 0;

/// Protocol version advertised in the CONNECT command.
pub const CURRENT_PROTOCOL_VERSION: i32 = 19;

/// First protocol version with keep-alive support (PING/PONG).
pub const PROTOCOL_VERSION_KEEP_ALIVE: i32 = 1;

/// First protocol version with CRC-32C frame checksums.
pub const PROTOCOL_VERSION_CHECKSUM: i32 = 6;

/// First protocol version with broker-side consumer stats.
pub const PROTOCOL_VERSION_CONSUMER_STATS: i32 = 8;

/// Maximum number of elements accepted while parsing a wire-level array.
///
/// This prevents memory exhaustion from malformed frames that claim to
/// carry millions of entries. 100,000 is generous but bounded.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

// =============================================================================
// Network Constants
// =============================================================================

/// Initial capacity of the connection read buffer (64 KiB).
///
/// The buffer grows to `max(64 KiB, frame size + 4)` whenever a frame does
/// not fit in the remaining capacity.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Interval between protocol-level keep-alive probes (30 seconds).
///
/// If a PING is still unanswered when the next interval fires, the
/// connection is considered dead and closed.
pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 30;

/// Idle time before the kernel starts TCP keep-alive probes (60 seconds).
///
/// Ideally this never triggers, given that the client sends its own
/// protocol-level probes every 30 seconds.
pub const TCP_KEEP_ALIVE_IDLE_SECS: u64 = 60;

/// Number of unacknowledged TCP keep-alive probes before the kernel
/// declares the connection broken.
pub const TCP_KEEP_ALIVE_PROBES: u32 = 10;

/// Interval between TCP keep-alive probes (6 seconds).
pub const TCP_KEEP_ALIVE_INTERVAL_SECS: u64 = 6;

/// URL scheme for plaintext broker connections.
pub const SCHEME_PLAIN: &str = "pulsar";

/// URL scheme for TLS broker connections.
pub const SCHEME_TLS: &str = "pulsar+ssl";

/// Default broker port when the service URL omits one.
pub const DEFAULT_BROKER_PORT: u16 = 6650;

/// Default TLS broker port when the service URL omits one.
pub const DEFAULT_BROKER_TLS_PORT: u16 = 6651;

// =============================================================================
// Timing Constants
// =============================================================================

/// Interval between producer data key refreshes when end-to-end encryption
/// is enabled (4 hours).
pub const DATA_KEY_REFRESH_INTERVAL_SECS: u64 = 4 * 60 * 60;

/// Slack subtracted from the producer send timeout when deriving the
/// reconnection backoff ceiling (100 milliseconds).
///
/// Reconnection must win the race against the send timeout, otherwise every
/// pending message expires before the producer has a chance to resend it.
pub const BACKOFF_SEND_TIMEOUT_SLACK_MS: u64 = 100;

/// Suffix appended to partitioned topic names by the broker.
///
/// Namespace topic listings strip everything from this marker onwards and
/// deduplicate the remainder.
pub const PARTITION_SUFFIX: &str = "-partition-";

// =============================================================================
// Tests
// =============================================================================
