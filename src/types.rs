//! Type-safe wrappers for Pulsar protocol primitives.
//!
//! These newtypes provide type safety to prevent mixing up different
//! integer ids that share an underlying representation but have different
//! semantic meanings.

use std::fmt;

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::Result;

/// A producer identifier, unique within one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for ProducerId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A consumer identifier, unique within one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for ConsumerId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A request identifier, unique per connection.
///
/// Every request/response exchange on a connection is keyed by one of
/// these; the registries on [`crate::connection::ClientConnection`] require
/// uniqueness among in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for RequestId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// The position of a message within a topic, as assigned by the broker.
///
/// A message id is a (ledger, entry) pair plus an optional partition index
/// and an optional index into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// BookKeeper ledger id.
    pub ledger_id: i64,
    /// Entry id within the ledger.
    pub entry_id: i64,
    /// Partition index, `-1` for non-partitioned topics.
    pub partition: i32,
    /// Index within a batch, `-1` for non-batched messages.
    pub batch_index: i32,
}

impl MessageId {
    /// A message id with neither partition nor batch index.
    pub fn new(ledger_id: i64, entry_id: i64) -> Self {
        MessageId {
            ledger_id,
            entry_id,
            partition: -1,
            batch_index: -1,
        }
    }

    /// Return a copy with the partition index set.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// Return a copy with the batch index set.
    pub fn with_batch_index(mut self, batch_index: i32) -> Self {
        self.batch_index = batch_index;
        self
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::new(-1, -1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.ledger_id, self.entry_id, self.partition, self.batch_index
        )
    }
}

/// The identity of a fully published chunked message.
///
/// Chunk acks arrive one chunk at a time; the first and last chunk ids are
/// collected as acks come in, and the combined id is delivered to the send
/// callback only when the final chunk has been acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMessageId {
    /// Message id of chunk 0.
    pub first_chunk: MessageId,
    /// Message id of the final chunk.
    pub last_chunk: MessageId,
}

/// Accumulates chunk acks into a [`ChunkMessageId`].
#[derive(Debug, Default)]
pub struct ChunkMessageIdBuilder {
    first_chunk: Option<MessageId>,
    last_chunk: Option<MessageId>,
}

impl ChunkMessageIdBuilder {
    /// Record the ack for chunk 0.
    pub fn set_first_chunk(&mut self, id: MessageId) {
        self.first_chunk = Some(id);
    }

    /// Record the ack for the final chunk.
    pub fn set_last_chunk(&mut self, id: MessageId) {
        self.last_chunk = Some(id);
    }

    /// Build the combined id once both ends have been recorded.
    pub fn build(&self) -> Option<ChunkMessageId> {
        match (self.first_chunk, self.last_chunk) {
            (Some(first_chunk), Some(last_chunk)) => Some(ChunkMessageId {
                first_chunk,
                last_chunk,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_defaults() {
        let id = MessageId::new(7, 9);
        assert_eq!(id.ledger_id, 7);
        assert_eq!(id.entry_id, 9);
        assert_eq!(id.partition, -1);
        assert_eq!(id.batch_index, -1);
    }

    #[test]
    fn test_message_id_builders() {
        let id = MessageId::new(1, 2).with_partition(3).with_batch_index(4);
        assert_eq!(id.partition, 3);
        assert_eq!(id.batch_index, 4);
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::new(1, 0);
        assert_eq!(format!("{}", id), "(1,0,-1,-1)");
    }

    #[test]
    fn test_chunk_message_id_builder_incomplete() {
        let mut builder = ChunkMessageIdBuilder::default();
        assert_eq!(builder.build(), None);
        builder.set_first_chunk(MessageId::new(1, 0));
        assert_eq!(builder.build(), None);
    }

    #[test]
    fn test_chunk_message_id_builder_complete() {
        let mut builder = ChunkMessageIdBuilder::default();
        builder.set_first_chunk(MessageId::new(1, 0));
        builder.set_last_chunk(MessageId::new(1, 2));
        let id = builder.build().unwrap();
        assert_eq!(id.first_chunk, MessageId::new(1, 0));
        assert_eq!(id.last_chunk, MessageId::new(1, 2));
    }

    #[test]
    fn test_id_newtype_display() {
        assert_eq!(format!("{}", ProducerId(5)), "5");
        assert_eq!(format!("{}", ConsumerId(6)), "6");
        assert_eq!(format!("{}", RequestId(7)), "7");
    }
}
