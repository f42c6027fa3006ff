//! In-flight send operations and the ordered pending queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use crate::commands::MessageMetadata;
use crate::error::Result;
use crate::types::{ChunkMessageId, ChunkMessageIdBuilder, MessageId, ProducerId};

/// The identity delivered to a send callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishedId {
    /// A regular (or batched) message.
    Message(MessageId),
    /// A chunked message; carries the first and last chunk positions.
    Chunked(ChunkMessageId),
}

impl PublishedId {
    /// The broker position usable for seeking: the message itself, or the
    /// last chunk of a chunked message.
    pub fn message_id(&self) -> MessageId {
        match self {
            PublishedId::Message(id) => *id,
            PublishedId::Chunked(id) => id.last_chunk,
        }
    }
}

/// Completion callback of one `send` call.
pub type SendCallback = Box<dyn FnOnce(Result<PublishedId>) + Send + 'static>;

/// Completion callback of a `flush` or `close` call.
pub type DoneCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// The wire-level arguments of one SEND: everything the connection needs
/// to (re)build the frame. Shared between the pending queue (for resend)
/// and the writer (for encoding), so it is reference-counted and
/// immutable.
#[derive(Debug)]
pub struct SendArguments {
    pub producer_id: ProducerId,
    pub sequence_id: u64,
    pub num_messages: i32,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

pub(crate) enum OpCallbacks {
    /// One callback, absent for non-final chunks.
    Single(Option<SendCallback>),
    /// Per-message callbacks of a batch, in batch order.
    Batch(Vec<SendCallback>),
}

/// One in-flight send operation: a single message, one chunk of a chunked
/// message, or one batch.
pub(crate) struct OpSendMsg {
    pub args: Arc<SendArguments>,
    /// Messages represented by this operation (>1 for batches). One
    /// admission permit is held per message.
    pub messages_count: u32,
    /// Uncompressed payload bytes accounted against the memory limit.
    pub messages_size: u64,
    pub send_deadline: Instant,
    pub chunk_id: i32,
    pub num_chunks: i32,
    /// Shared accumulator across the chunks of one message.
    pub chunk_message_id: Option<Arc<Mutex<ChunkMessageIdBuilder>>>,
    /// Set when building the operation failed (e.g. an oversized batch);
    /// such operations are never written, only completed with the error.
    pub create_result: Result<()>,
    callbacks: OpCallbacks,
    /// Flush trackers attached to this operation; fired on completion
    /// regardless of which callback variant is present.
    trackers: Vec<DoneCallback>,
}

impl OpSendMsg {
    pub fn single(
        args: Arc<SendArguments>,
        messages_size: u64,
        send_deadline: Instant,
        callback: Option<SendCallback>,
    ) -> Self {
        OpSendMsg {
            args,
            messages_count: 1,
            messages_size,
            send_deadline,
            chunk_id: 0,
            num_chunks: 1,
            chunk_message_id: None,
            create_result: Ok(()),
            callbacks: OpCallbacks::Single(callback),
            trackers: Vec::new(),
        }
    }

    pub fn batch(
        args: Arc<SendArguments>,
        messages_count: u32,
        messages_size: u64,
        send_deadline: Instant,
        callbacks: Vec<SendCallback>,
        create_result: Result<()>,
    ) -> Self {
        OpSendMsg {
            args,
            messages_count,
            messages_size,
            send_deadline,
            chunk_id: 0,
            num_chunks: 1,
            chunk_message_id: None,
            create_result,
            callbacks: OpCallbacks::Batch(callbacks),
            trackers: Vec::new(),
        }
    }

    pub fn add_tracker_callback(&mut self, callback: DoneCallback) {
        self.trackers.push(callback);
    }

    /// Fire every callback held by this operation. Batch callbacks receive
    /// the message id with their batch index filled in.
    pub fn complete(self, result: Result<PublishedId>) {
        match self.callbacks {
            OpCallbacks::Single(Some(callback)) => callback(result),
            OpCallbacks::Single(None) => {}
            OpCallbacks::Batch(callbacks) => {
                for (index, callback) in callbacks.into_iter().enumerate() {
                    let indexed = result.map(|published| match published {
                        PublishedId::Message(id) => {
                            PublishedId::Message(id.with_batch_index(index as i32))
                        }
                        chunked => chunked,
                    });
                    callback(indexed);
                }
            }
        }
        for tracker in self.trackers {
            tracker(result.map(|_| ()));
        }
    }
}

/// Strictly FIFO queue of in-flight operations, ordered by ascending
/// sequence id.
///
/// The head carries the earliest send deadline: entries inherit the same
/// timeout and are inserted in order, so expired entries always form a
/// prefix.
pub(crate) struct PendingQueue {
    queue: VecDeque<OpSendMsg>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, op: OpSendMsg) {
        self.queue.push_back(op);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn front(&self) -> Option<&OpSendMsg> {
        self.queue.front()
    }

    pub fn back_mut(&mut self) -> Option<&mut OpSendMsg> {
        self.queue.back_mut()
    }

    pub fn pop_front(&mut self) -> Option<OpSendMsg> {
        self.queue.pop_front()
    }

    /// Absolute deadline of the head entry.
    pub fn head_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|op| op.send_deadline)
    }

    /// Remove the expired prefix.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<OpSendMsg> {
        let mut expired = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.send_deadline <= now {
                expired.push(self.queue.pop_front().expect("head vanished"));
            } else {
                break;
            }
        }
        expired
    }

    /// Remove everything, e.g. to fail all pending sends on close.
    pub fn take_all(&mut self) -> Vec<OpSendMsg> {
        self.queue.drain(..).collect()
    }

    /// The wire arguments of every queued operation, in order, for resend
    /// after a reconnect.
    pub fn resend_args(&self) -> Vec<Arc<SendArguments>> {
        self.queue.iter().map(|op| op.args.clone()).collect()
    }
}
