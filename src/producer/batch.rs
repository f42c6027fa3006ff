//! Batch accumulation.
//!
//! Two container strategies: the default container packs every message
//! into one batch and produces a single send operation on flush; the
//! key-grouped container partitions messages by ordering key (falling back
//! to the partition key) and produces one send operation per group.
//!
//! A batch payload is the concatenation of
//! `[singleMetadataSize | singleMetadata | payload]` entries; the
//! batch-level metadata carries the first sequence id and the entry count.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::commands::{MessageMetadata, SingleMessageMetadata};
use crate::compression::{self, CompressionType};
use crate::connection::max_message_size;
use crate::encode::ToByte;
use crate::error::Error;
use crate::producer::pending::{OpSendMsg, SendArguments, SendCallback};
use crate::types::ProducerId;

pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// One message waiting in a batch container.
pub(crate) struct BatchedMessage {
    pub sequence_id: u64,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Bytes>,
    pub payload: Bytes,
    pub callback: SendCallback,
}

impl BatchedMessage {
    /// The key this message groups under in key-based batching.
    fn grouping_key(&self) -> Bytes {
        match (&self.ordering_key, &self.partition_key) {
            (Some(key), _) => key.clone(),
            (None, Some(key)) => Bytes::copy_from_slice(key.as_bytes()),
            (None, None) => Bytes::new(),
        }
    }
}

/// Producer state a container needs when materializing send operations.
pub(crate) struct BatchContext {
    pub producer_id: ProducerId,
    pub producer_name: String,
    pub compression: CompressionType,
    pub send_timeout: Duration,
    pub schema_version: Option<Bytes>,
}

/// Accumulates messages and turns them into send operations on flush.
pub(crate) trait BatchContainer: Send {
    /// Add a message. Returns true when the container is full and must be
    /// flushed.
    fn add(&mut self, message: BatchedMessage) -> bool;

    /// Whether one more message of `payload_len` bytes fits under the
    /// byte/count limits.
    fn has_enough_space(&self, payload_len: usize) -> bool;

    /// True when the next `add` starts a fresh batch; used to arm the
    /// publish-delay timer exactly once per batch.
    fn is_first_message_to_add(&self) -> bool;

    fn is_empty(&self) -> bool;

    /// Whether flush can produce more than one send operation.
    fn has_multi_op_send_msgs(&self) -> bool;

    /// Drain the container into send operations, in ascending sequence-id
    /// order.
    fn create_op_send_msgs(&mut self, context: &BatchContext) -> Vec<OpSendMsg>;
}

pub(crate) fn new_batch_container(
    batching_type: crate::config::BatchingType,
    max_messages: usize,
    max_bytes: usize,
) -> Box<dyn BatchContainer> {
    match batching_type {
        crate::config::BatchingType::Default => Box::new(DefaultBatchContainer {
            entries: Vec::new(),
            payload_bytes: 0,
            max_messages,
            max_bytes,
        }),
        crate::config::BatchingType::KeyBased => Box::new(KeyGroupedBatchContainer {
            groups: Vec::new(),
            num_messages: 0,
            payload_bytes: 0,
            max_messages,
            max_bytes,
        }),
    }
}

/// Build one send operation from a slice of batched messages.
fn make_batch_op(entries: Vec<BatchedMessage>, context: &BatchContext) -> OpSendMsg {
    let messages_count = entries.len() as u32;
    let first_sequence_id = entries.first().map(|entry| entry.sequence_id).unwrap_or(0);

    let mut payload = BytesMut::new();
    let mut uncompressed_total: u64 = 0;
    let mut callbacks = Vec::with_capacity(entries.len());
    for entry in entries {
        let single = SingleMessageMetadata {
            partition_key: entry.partition_key,
            ordering_key: entry.ordering_key,
            payload_size: entry.payload.len() as u32,
            sequence_id: entry.sequence_id,
        };
        let mut single_bytes = BytesMut::new();
        // Only oversized strings can fail here and those were rejected on
        // add.
        let _ = single.encode(&mut single_bytes);
        payload.put_u32(single_bytes.len() as u32);
        payload.put(single_bytes);
        uncompressed_total += entry.payload.len() as u64;
        payload.put(entry.payload);
        callbacks.push(entry.callback);
    }
    let uncompressed = payload.freeze();
    let uncompressed_size = uncompressed.len() as u32;

    let mut metadata = MessageMetadata {
        producer_name: context.producer_name.clone(),
        publish_time: current_time_millis(),
        sequence_id: first_sequence_id,
        num_messages_in_batch: Some(messages_count as i32),
        schema_version: context.schema_version.clone(),
        ..Default::default()
    };

    let (payload, create_result) = match compression::encode(context.compression, &uncompressed) {
        Ok(compressed) => {
            if context.compression != CompressionType::None {
                metadata.compression = context.compression;
                metadata.uncompressed_size = uncompressed_size;
            }
            (compressed, Ok(()))
        }
        Err(error) => (uncompressed, Err(error)),
    };

    // Oversized batches are surfaced through the operation result rather
    // than being written.
    let create_result = create_result.and_then(|_| {
        let frame_size = metadata.encoded_size() + payload.len();
        if frame_size > max_message_size() as usize {
            Err(Error::MessageTooBig)
        } else {
            Ok(())
        }
    });

    let args = Arc::new(SendArguments {
        producer_id: context.producer_id,
        sequence_id: first_sequence_id,
        num_messages: messages_count as i32,
        metadata,
        payload,
    });
    OpSendMsg::batch(
        args,
        messages_count,
        uncompressed_total,
        Instant::now() + context.send_timeout,
        callbacks,
        create_result,
    )
}

/// One batch for all messages.
pub(crate) struct DefaultBatchContainer {
    entries: Vec<BatchedMessage>,
    payload_bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

impl BatchContainer for DefaultBatchContainer {
    fn add(&mut self, message: BatchedMessage) -> bool {
        self.payload_bytes += message.payload.len();
        self.entries.push(message);
        self.entries.len() >= self.max_messages || self.payload_bytes >= self.max_bytes
    }

    fn has_enough_space(&self, payload_len: usize) -> bool {
        self.entries.is_empty()
            || (self.entries.len() < self.max_messages
                && self.payload_bytes + payload_len <= self.max_bytes)
    }

    fn is_first_message_to_add(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_multi_op_send_msgs(&self) -> bool {
        false
    }

    fn create_op_send_msgs(&mut self, context: &BatchContext) -> Vec<OpSendMsg> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        self.payload_bytes = 0;
        vec![make_batch_op(std::mem::take(&mut self.entries), context)]
    }
}

/// One batch per ordering key (falling back to the partition key).
pub(crate) struct KeyGroupedBatchContainer {
    /// Insertion-ordered groups; lookup is linear but group counts are
    /// small.
    groups: Vec<(Bytes, Vec<BatchedMessage>)>,
    num_messages: usize,
    payload_bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

impl BatchContainer for KeyGroupedBatchContainer {
    fn add(&mut self, message: BatchedMessage) -> bool {
        self.payload_bytes += message.payload.len();
        self.num_messages += 1;
        let key = message.grouping_key();
        match self.groups.iter_mut().find(|(group_key, _)| *group_key == key) {
            Some((_, group)) => group.push(message),
            None => self.groups.push((key, vec![message])),
        }
        self.num_messages >= self.max_messages || self.payload_bytes >= self.max_bytes
    }

    fn has_enough_space(&self, payload_len: usize) -> bool {
        self.num_messages == 0
            || (self.num_messages < self.max_messages
                && self.payload_bytes + payload_len <= self.max_bytes)
    }

    fn is_first_message_to_add(&self) -> bool {
        self.num_messages == 0
    }

    fn is_empty(&self) -> bool {
        self.num_messages == 0
    }

    fn has_multi_op_send_msgs(&self) -> bool {
        true
    }

    fn create_op_send_msgs(&mut self, context: &BatchContext) -> Vec<OpSendMsg> {
        self.num_messages = 0;
        self.payload_bytes = 0;
        let mut ops: Vec<OpSendMsg> = std::mem::take(&mut self.groups)
            .into_iter()
            .map(|(_, group)| make_batch_op(group, context))
            .collect();
        // The pending queue is ordered by sequence id; emit groups
        // accordingly.
        ops.sort_by_key(|op| op.args.sequence_id);
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchingType;
    use crate::producer::pending::PublishedId;
    use crate::types::MessageId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn context() -> BatchContext {
        BatchContext {
            producer_id: ProducerId(3),
            producer_name: "batcher".into(),
            compression: CompressionType::None,
            send_timeout: Duration::from_secs(30),
            schema_version: None,
        }
    }

    fn message(sequence_id: u64, key: Option<&str>, payload: &'static [u8]) -> BatchedMessage {
        BatchedMessage {
            sequence_id,
            partition_key: key.map(|k| k.to_string()),
            ordering_key: None,
            payload: Bytes::from_static(payload),
            callback: Box::new(|_| {}),
        }
    }

    #[test]
    fn test_default_container_flushes_to_single_op() {
        let mut container = new_batch_container(BatchingType::Default, 10, 1024);
        assert!(container.is_first_message_to_add());
        assert!(!container.add(message(5, None, b"aa")));
        assert!(!container.is_first_message_to_add());
        assert!(!container.add(message(6, None, b"bb")));

        let ops = container.create_op_send_msgs(&context());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].messages_count, 2);
        assert_eq!(ops[0].args.sequence_id, 5);
        assert_eq!(ops[0].args.num_messages, 2);
        assert_eq!(ops[0].args.metadata.num_messages_in_batch, Some(2));
        assert_eq!(ops[0].messages_size, 4);
        assert!(ops[0].create_result.is_ok());
        assert!(container.is_empty());
    }

    #[test]
    fn test_default_container_full_on_max_messages() {
        let mut container = new_batch_container(BatchingType::Default, 2, 1024 * 1024);
        assert!(!container.add(message(0, None, b"x")));
        assert!(container.add(message(1, None, b"y")));
    }

    #[test]
    fn test_default_container_full_on_max_bytes() {
        let mut container = new_batch_container(BatchingType::Default, 100, 4);
        assert!(!container.add(message(0, None, b"ab")));
        assert!(container.add(message(1, None, b"cd")));
        assert!(!container.has_enough_space(1));
    }

    #[test]
    fn test_key_grouped_container_one_op_per_key() {
        let mut container = new_batch_container(BatchingType::KeyBased, 100, 1024 * 1024);
        assert!(container.has_multi_op_send_msgs());
        container.add(message(10, Some("a"), b"1"));
        container.add(message(11, Some("b"), b"2"));
        container.add(message(12, Some("a"), b"3"));

        let ops = container.create_op_send_msgs(&context());
        assert_eq!(ops.len(), 2);
        // Sorted by first sequence id per group.
        assert_eq!(ops[0].args.sequence_id, 10);
        assert_eq!(ops[0].messages_count, 2);
        assert_eq!(ops[1].args.sequence_id, 11);
        assert_eq!(ops[1].messages_count, 1);
        assert!(container.is_empty());
    }

    #[test]
    fn test_ordering_key_takes_precedence() {
        let mut container = new_batch_container(BatchingType::KeyBased, 100, 1024 * 1024);
        container.add(BatchedMessage {
            sequence_id: 1,
            partition_key: Some("p1".into()),
            ordering_key: Some(Bytes::from_static(b"group")),
            payload: Bytes::from_static(b"x"),
            callback: Box::new(|_| {}),
        });
        container.add(BatchedMessage {
            sequence_id: 2,
            partition_key: Some("p2".into()),
            ordering_key: Some(Bytes::from_static(b"group")),
            payload: Bytes::from_static(b"y"),
            callback: Box::new(|_| {}),
        });
        let ops = container.create_op_send_msgs(&context());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].messages_count, 2);
    }

    #[test]
    fn test_batch_callbacks_receive_batch_indexes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut container = new_batch_container(BatchingType::Default, 10, 1024);
        for sequence_id in 0..3u64 {
            let seen = seen.clone();
            container.add(BatchedMessage {
                sequence_id,
                partition_key: None,
                ordering_key: None,
                payload: Bytes::from_static(b"p"),
                callback: Box::new(move |result| {
                    seen.lock().unwrap().push(result.unwrap().message_id().batch_index);
                }),
            });
        }
        let mut ops = container.create_op_send_msgs(&context());
        ops.remove(0)
            .complete(Ok(PublishedId::Message(MessageId::new(7, 7))));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_compressed_batch_stamps_metadata() {
        let mut container = new_batch_container(BatchingType::Default, 10, 1 << 20);
        let payload: &'static [u8] = Box::leak(vec![9u8; 2048].into_boxed_slice());
        container.add(message(0, None, payload));
        let context = BatchContext {
            compression: CompressionType::Lz4,
            ..context()
        };
        let ops = container.create_op_send_msgs(&context);
        assert_eq!(ops[0].args.metadata.compression, CompressionType::Lz4);
        assert!(ops[0].args.metadata.uncompressed_size > 0);
        assert!(ops[0].args.payload.len() < 2048 + 32);
    }

    #[test]
    fn test_oversized_batch_carries_error_result() {
        crate::connection::reset_max_message_size();
        let huge: &'static [u8] =
            Box::leak(vec![1u8; max_message_size() as usize + 16].into_boxed_slice());
        let mut container = new_batch_container(BatchingType::Default, 10, usize::MAX);
        let completions = Arc::new(AtomicUsize::new(0));
        let completions_clone = completions.clone();
        container.add(BatchedMessage {
            sequence_id: 0,
            partition_key: None,
            ordering_key: None,
            payload: Bytes::from_static(huge),
            callback: Box::new(move |result| {
                assert_eq!(result.unwrap_err(), Error::MessageTooBig);
                completions_clone.fetch_add(1, Ordering::SeqCst);
            }),
        });
        let mut ops = container.create_op_send_msgs(&context());
        assert_eq!(ops[0].create_result, Err(Error::MessageTooBig));
        ops.remove(0).complete(Err(Error::MessageTooBig));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }
}
