//! The producer send pipeline.
//!
//! A [`Producer`] owns the pending-message queue that enforces publish
//! ordering and drives:
//!
//! - admission control against a per-producer permit pool and the
//!   process-wide memory budget,
//! - batching (default or key-grouped), chunking of oversized messages,
//!   compression and optional payload encryption,
//! - the head-first send-timeout timer,
//! - ack reconciliation with the broker, including chunk reassembly of
//!   the published message id,
//! - resend of the whole queue after a reconnect.
//!
//! Reconnection is delegated to [`crate::handler`]; the producer supplies
//! the create-producer exchange and the resend step.

pub(crate) mod batch;
pub mod pending;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use crate::commands::{
    BaseCommand, CommandCloseProducer, CommandProducer, MessageMetadata,
};
use crate::compression::{self, CompressionType};
use crate::config::{ClientConfiguration, ProducerConfiguration};
use crate::connection::{
    max_message_size, new_request_id, ClientConnection, ProducerListener, ResponseData,
};
use crate::constants::DATA_KEY_REFRESH_INTERVAL_SECS;
use crate::crypto::MessageCrypto;
use crate::error::{Error, Result};
use crate::handler::{
    self, ConnectionPool, HandlerBase, HandlerState, ReconnectBackoff, ReconnectableHandler,
};
use crate::memory::MemoryLimitController;
use crate::types::{ChunkMessageIdBuilder, MessageId, ProducerId};

use batch::{current_time_millis, new_batch_container, BatchContext, BatchedMessage};
use pending::{DoneCallback, OpSendMsg, PendingQueue, PublishedId, SendArguments, SendCallback};

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Bytes,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Bytes>,
    /// Absolute delivery time for delayed messages, milliseconds since
    /// the epoch. Delayed messages are never batched.
    pub deliver_at_time: Option<i64>,
    /// Pins the sequence id instead of using the producer's generator.
    pub sequence_id: Option<u64>,
    /// Only valid together with `replicated_from`; set by replicator
    /// producers.
    pub producer_name: Option<String>,
    pub replicated_from: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

struct ProducerInner {
    producer_name: String,
    schema_version: Option<Bytes>,
    topic_epoch: Option<u64>,
    sequence_generator: u64,
    last_sequence_id_published: i64,
    pending: PendingQueue,
    batch: Option<Box<dyn batch::BatchContainer>>,
    batch_timer: Option<JoinHandle<()>>,
    send_timer: Option<JoinHandle<()>>,
    data_key_task: Option<JoinHandle<()>>,
}

/// A producer bound to one topic (or one partition of a topic).
pub struct Producer {
    self_weak: Weak<Producer>,
    base: HandlerBase,
    conf: ProducerConfiguration,
    producer_id: ProducerId,
    user_provided_name: bool,
    chunking_enabled: bool,
    permits: Option<Arc<Semaphore>>,
    memory: Arc<MemoryLimitController>,
    crypto: Option<Arc<MessageCrypto>>,
    inner: Mutex<ProducerInner>,
    created_sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.base.topic())
            .field("producer_id", &self.producer_id)
            .field("state", &self.base.state())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Build a producer. It holds no connection until [`Producer::start`]
    /// (or [`Producer::create`]) runs.
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        topic: impl Into<String>,
        producer_id: ProducerId,
        conf: ProducerConfiguration,
        client_conf: &ClientConfiguration,
        memory: Arc<MemoryLimitController>,
    ) -> Result<Arc<Producer>> {
        conf.validate()?;
        let topic = topic.into();

        let crypto = match &conf.encryption {
            Some(encryption) => Some(Arc::new(MessageCrypto::new(
                encryption.key_names.clone(),
                encryption.key_reader.clone(),
            )?)),
            None => None,
        };

        let backoff = ReconnectBackoff::new(
            client_conf.initial_backoff,
            client_conf.max_backoff,
            conf.send_timeout,
        );
        let base = HandlerBase::new(pool, topic, backoff, client_conf.operation_timeout);

        let chunking_enabled = conf.chunking_enabled && !conf.batching_enabled;
        let permits = if conf.max_pending_messages > 0 {
            Some(Arc::new(Semaphore::new(conf.max_pending_messages)))
        } else {
            None
        };
        let batch_container = if conf.batching_enabled {
            Some(new_batch_container(
                conf.batching_type,
                conf.batching_max_messages,
                conf.batching_max_bytes,
            ))
        } else {
            None
        };

        let initial_sequence_id = conf.initial_sequence_id;
        let producer_name = conf.producer_name.clone().unwrap_or_default();
        let user_provided_name = conf.producer_name.is_some();

        let producer = Arc::new_cyclic(|self_weak| Producer {
            self_weak: self_weak.clone(),
            base,
            conf,
            producer_id,
            user_provided_name,
            chunking_enabled,
            permits,
            memory,
            crypto,
            inner: Mutex::new(ProducerInner {
                producer_name,
                schema_version: None,
                topic_epoch: None,
                sequence_generator: (initial_sequence_id + 1) as u64,
                last_sequence_id_published: initial_sequence_id,
                pending: PendingQueue::new(),
                batch: batch_container,
                batch_timer: None,
                send_timer: None,
                data_key_task: None,
            }),
            created_sender: Mutex::new(None),
        });
        tracing::debug!(
            topic = producer.base.topic(),
            producer_id = %producer.producer_id,
            "Created producer handle"
        );
        Ok(producer)
    }

    /// Build and start a producer, waiting until it is registered with a
    /// broker.
    pub async fn create(
        pool: Arc<dyn ConnectionPool>,
        topic: impl Into<String>,
        producer_id: ProducerId,
        conf: ProducerConfiguration,
        client_conf: &ClientConfiguration,
        memory: Arc<MemoryLimitController>,
    ) -> Result<Arc<Producer>> {
        let producer = Producer::new(pool, topic, producer_id, conf, client_conf, memory)?;
        producer.start().await?;
        Ok(producer)
    }

    /// Start the reconnection machine and await the first successful
    /// registration.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.base.state() != HandlerState::NotStarted {
            return Err(Error::AlreadyClosed);
        }
        let receiver = {
            let mut created = self.created_sender.lock().expect("created lock poisoned");
            let (sender, receiver) = oneshot::channel();
            *created = Some(sender);
            receiver
        };
        handler::start(self);
        // Lazily started shared producers may take longer than the send
        // timeout to connect; their pending sends must still expire.
        if self.conf.is_lazy_shared() {
            self.start_send_timeout_timer();
        }
        receiver.await.unwrap_or(Err(Error::AlreadyClosed))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn topic(&self) -> &str {
        self.base.topic()
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    /// Name assigned by the broker (or configured by the user).
    pub fn producer_name(&self) -> String {
        self.inner
            .lock()
            .expect("producer lock poisoned")
            .producer_name
            .clone()
    }

    /// Highest sequence id known to be persisted. Monotone non-decreasing.
    pub fn last_sequence_id(&self) -> i64 {
        self.inner
            .lock()
            .expect("producer lock poisoned")
            .last_sequence_id_published
    }

    pub fn schema_version(&self) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("producer lock poisoned")
            .schema_version
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.base.state() == HandlerState::Closed
    }

    pub fn is_started(&self) -> bool {
        self.base.state() != HandlerState::NotStarted
    }

    pub fn is_connected(&self) -> bool {
        self.base.state() == HandlerState::Ready && self.base.connection().is_some()
    }

    /// Number of in-flight send operations.
    pub fn pending_queue_size(&self) -> usize {
        self.inner.lock().expect("producer lock poisoned").pending.len()
    }

    // -------------------------------------------------------------------------
    // Send path
    // -------------------------------------------------------------------------

    /// Publish one message and await its receipt.
    pub async fn send(self: &Arc<Self>, message: Message) -> Result<PublishedId> {
        let (sender, receiver) = oneshot::channel();
        self.send_with_callback(
            message,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        )
        .await;
        receiver.await.unwrap_or(Err(Error::AlreadyClosed))
    }

    /// Publish one message; `callback` fires exactly once with the receipt
    /// or the failure. Callbacks fire in sequence-id order.
    pub async fn send_with_callback(self: &Arc<Self>, message: Message, callback: SendCallback) {
        match self.base.state() {
            HandlerState::Ready | HandlerState::Pending => {}
            HandlerState::Closing | HandlerState::Closed => {
                return callback(Err(Error::AlreadyClosed));
            }
            HandlerState::ProducerFenced => return callback(Err(Error::ProducerFenced)),
            HandlerState::NotStarted | HandlerState::Failed => {
                return callback(Err(Error::NotConnected));
            }
        }

        let uncompressed_size = message.payload.len();
        if let Err(error) = self.can_enqueue_request(uncompressed_size).await {
            // The queue is full; flush any accumulating batch immediately
            // instead of waiting out the publish delay.
            if self.has_batch() {
                let failures = {
                    let mut inner = self.inner.lock().expect("producer lock poisoned");
                    self.flush_batch_locked(&mut inner)
                };
                Self::complete_failures(failures);
            }
            return callback(Err(error));
        }

        // A user-supplied producer name is only valid on replicated
        // messages.
        if message.producer_name.is_some() && message.replicated_from.is_none() {
            self.release_semaphore(uncompressed_size);
            return callback(Err(Error::InvalidMessage));
        }

        if self.has_batch() && message.deliver_at_time.is_none() {
            self.add_to_batch(message, callback);
            return;
        }

        self.send_individual(message, callback, uncompressed_size)
            .await;
    }

    async fn send_individual(
        self: &Arc<Self>,
        message: Message,
        callback: SendCallback,
        uncompressed_size: usize,
    ) {
        let payload = match compression::encode(self.conf.compression_type, &message.payload) {
            Ok(payload) => payload,
            Err(error) => {
                self.release_semaphore(uncompressed_size);
                return callback(Err(error));
            }
        };
        let compressed_size = payload.len();
        let max_size = max_message_size() as usize;

        let (producer_name, schema_version) = {
            let inner = self.inner.lock().expect("producer lock poisoned");
            (inner.producer_name.clone(), inner.schema_version.clone())
        };
        let mut metadata = MessageMetadata {
            producer_name: message.producer_name.clone().unwrap_or(producer_name),
            publish_time: current_time_millis(),
            sequence_id: 0,
            replicated_from: message.replicated_from.clone(),
            partition_key: message.partition_key.clone(),
            ordering_key: message.ordering_key.clone(),
            deliver_at_time: message.deliver_at_time,
            schema_version,
            ..Default::default()
        };
        if self.conf.compression_type != CompressionType::None {
            metadata.compression = self.conf.compression_type;
            metadata.uncompressed_size = uncompressed_size as u32;
        }

        // The sequence field is fixed width, so the metadata size (and
        // with it the chunk geometry) is final before the id is assigned.
        let mut payload_chunk_size = max_size;
        let total_chunks = if self.chunking_enabled {
            let metadata_size = metadata.encoded_size();
            if metadata_size >= max_size {
                tracing::warn!(
                    producer_id = %self.producer_id,
                    metadata_size,
                    max_size,
                    "Metadata size cannot exceed the frame limit"
                );
                self.release_semaphore(uncompressed_size);
                return callback(Err(Error::MessageTooBig));
            }
            payload_chunk_size = max_size - metadata_size;
            num_chunks(compressed_size, payload_chunk_size)
        } else {
            1
        };

        // Each chunk is sent individually and needs its own permit; the
        // memory was already reserved with the first admission.
        let mut extra_permits = 0;
        let mut admission_error = None;
        for _ in 1..total_chunks {
            match self.can_enqueue_request(0).await {
                Ok(()) => extra_permits += 1,
                Err(error) => {
                    admission_error = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = admission_error {
            self.release_permits(extra_permits);
            self.release_semaphore(uncompressed_size);
            return callback(Err(error));
        }

        let send_chunks = total_chunks > 1;
        let deadline = Instant::now() + self.conf.send_timeout;

        let mut inner = self.inner.lock().expect("producer lock poisoned");
        let sequence_id = match message.sequence_id {
            Some(sequence_id) => sequence_id,
            None => {
                let sequence_id = inner.sequence_generator;
                inner.sequence_generator += 1;
                sequence_id
            }
        };
        metadata.sequence_id = sequence_id;
        if send_chunks {
            metadata.uuid = Some(format!("{}-{}", metadata.producer_name, sequence_id));
            metadata.num_chunks_from_msg = Some(total_chunks as i32);
            metadata.total_chunk_msg_size = Some(compressed_size as u32);
        }

        // Prepare every chunk (metadata + encrypted payload) before
        // enqueueing any of them, so a failure leaves the queue untouched.
        let mut chunk_parts = Vec::with_capacity(total_chunks);
        let mut begin = 0usize;
        for chunk_id in 0..total_chunks {
            let mut chunk_metadata = metadata.clone();
            if send_chunks {
                chunk_metadata.chunk_id = Some(chunk_id as i32);
            }
            let end = compressed_size.min(begin + payload_chunk_size);
            let chunk_payload = payload.slice(begin..end);
            begin = end;

            let final_payload = match &self.crypto {
                Some(crypto) => match crypto.encrypt(&mut chunk_metadata, &chunk_payload) {
                    Ok(encrypted) => encrypted,
                    Err(_) => {
                        drop(inner);
                        self.release_permits(extra_permits);
                        self.release_semaphore(uncompressed_size);
                        return callback(Err(Error::CryptoError));
                    }
                },
                None => chunk_payload,
            };
            chunk_parts.push((chunk_metadata, final_payload));
        }

        if !self.chunking_enabled {
            let (chunk_metadata, final_payload) = &chunk_parts[0];
            let frame_size = chunk_metadata.encoded_size() + final_payload.len();
            if frame_size > max_size {
                drop(inner);
                self.release_semaphore(uncompressed_size);
                tracing::warn!(
                    producer_id = %self.producer_id,
                    frame_size,
                    max_size,
                    "Compressed message size cannot exceed the frame limit unless chunking is enabled"
                );
                return callback(Err(Error::MessageTooBig));
            }
        }

        let chunk_accumulator = if send_chunks {
            Some(Arc::new(Mutex::new(ChunkMessageIdBuilder::default())))
        } else {
            None
        };
        let connection = self.base.connection();
        let mut callback_slot = Some(callback);
        let chunk_count = chunk_parts.len();
        for (index, (chunk_metadata, chunk_payload)) in chunk_parts.into_iter().enumerate() {
            let is_last = index + 1 == chunk_count;
            let args = Arc::new(SendArguments {
                producer_id: self.producer_id,
                sequence_id,
                num_messages: 1,
                metadata: chunk_metadata,
                payload: chunk_payload,
            });
            // The memory reservation is carried by the final chunk so it
            // is released only when the whole message resolves.
            let mut op = OpSendMsg::single(
                args.clone(),
                if is_last { uncompressed_size as u64 } else { 0 },
                deadline,
                if is_last { callback_slot.take() } else { None },
            );
            if send_chunks {
                op.chunk_id = index as i32;
                op.num_chunks = chunk_count as i32;
                op.chunk_message_id = chunk_accumulator.clone();
            }
            inner.pending.push(op);
            match &connection {
                Some(connection) => {
                    tracing::debug!(sequence_id, chunk = index, "Sending msg immediately");
                    connection.send_message(args);
                }
                None => {
                    tracing::debug!(sequence_id, "Connection is not ready, queueing");
                }
            }
        }
    }

    fn add_to_batch(self: &Arc<Self>, message: Message, callback: SendCallback) {
        let mut failures = Vec::new();
        {
            let mut inner = self.inner.lock().expect("producer lock poisoned");
            let sequence_id = match message.sequence_id {
                Some(sequence_id) => sequence_id,
                None => {
                    let sequence_id = inner.sequence_generator;
                    inner.sequence_generator += 1;
                    sequence_id
                }
            };
            let payload_len = message.payload.len();
            if !inner
                .batch
                .as_ref()
                .expect("batching enabled")
                .has_enough_space(payload_len)
            {
                failures.extend(self.flush_batch_locked(&mut inner));
            }
            let batch = inner.batch.as_mut().expect("batching enabled");
            let is_first = batch.is_first_message_to_add();
            let is_full = batch.add(BatchedMessage {
                sequence_id,
                partition_key: message.partition_key,
                ordering_key: message.ordering_key,
                payload: message.payload,
                callback,
            });
            if is_first {
                self.arm_batch_timer(&mut inner);
            }
            if is_full {
                failures.extend(self.flush_batch_locked(&mut inner));
            }
        }
        Self::complete_failures(failures);
    }

    fn arm_batch_timer(self: &Arc<Self>, inner: &mut ProducerInner) {
        let weak = self.self_weak.clone();
        let delay = self.conf.batching_max_publish_delay;
        inner.batch_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(producer) = weak.upgrade() else {
                return;
            };
            let state = producer.base.state();
            if state != HandlerState::Pending && state != HandlerState::Ready {
                return;
            }
            tracing::debug!(producer_id = %producer.producer_id, "Batch publish delay expired");
            let failures = {
                let mut inner = producer.inner.lock().expect("producer lock poisoned");
                producer.flush_batch_locked(&mut inner)
            };
            Producer::complete_failures(failures);
        }));
    }

    /// Drain the batch container into the pending queue. Operations whose
    /// creation failed are returned so their callbacks can fire after the
    /// lock is released.
    fn flush_batch_locked(self: &Arc<Self>, inner: &mut ProducerInner) -> Vec<OpSendMsg> {
        if let Some(timer) = inner.batch_timer.take() {
            timer.abort();
        }
        let context = BatchContext {
            producer_id: self.producer_id,
            producer_name: inner.producer_name.clone(),
            compression: self.conf.compression_type,
            send_timeout: self.conf.send_timeout,
            schema_version: inner.schema_version.clone(),
        };
        let ops = match inner.batch.as_mut() {
            Some(batch) if !batch.is_empty() => batch.create_op_send_msgs(&context),
            _ => return Vec::new(),
        };

        let connection = self.base.connection();
        let mut failures = Vec::new();
        for op in ops {
            if op.create_result.is_ok() {
                let args = op.args.clone();
                inner.pending.push(op);
                if let Some(connection) = &connection {
                    connection.send_message(args);
                }
            } else {
                tracing::error!(
                    producer_id = %self.producer_id,
                    error = %op.create_result.unwrap_err(),
                    "Failed to create batch send operation"
                );
                self.release_for_op(&op);
                failures.push(op);
            }
        }
        failures
    }

    fn complete_failures(failures: Vec<OpSendMsg>) {
        for op in failures {
            let error = op.create_result.err().unwrap_or(Error::UnknownError);
            op.complete(Err(error));
        }
    }

    fn has_batch(&self) -> bool {
        self.inner.lock().expect("producer lock poisoned").batch.is_some()
    }

    /// Flush: push out any accumulating batch and resolve once everything
    /// currently pending has been acknowledged.
    pub async fn flush(self: &Arc<Self>) -> Result<()> {
        if self.base.state() != HandlerState::Ready {
            return Err(Error::AlreadyClosed);
        }
        let (sender, receiver) = oneshot::channel();
        let mut tracker = Some(Box::new(move |result: Result<()>| {
            let _ = sender.send(result);
        }) as DoneCallback);

        let failures = {
            let mut inner = self.inner.lock().expect("producer lock poisoned");
            let failures = if inner.batch.is_some() {
                self.flush_batch_locked(&mut inner)
            } else {
                Vec::new()
            };
            if let Some(op) = inner.pending.back_mut() {
                op.add_tracker_callback(tracker.take().expect("tracker not yet attached"));
            }
            failures
        };
        Self::complete_failures(failures);
        // Nothing pending: the flush is already complete.
        if let Some(tracker) = tracker {
            tracker(Ok(()));
        }
        receiver.await.unwrap_or(Err(Error::AlreadyClosed))
    }

    // -------------------------------------------------------------------------
    // Admission control
    // -------------------------------------------------------------------------

    async fn can_enqueue_request(&self, payload_size: usize) -> Result<()> {
        if self.conf.block_if_queue_full {
            if let Some(permits) = &self.permits {
                let permit = permits.acquire().await.map_err(|_| Error::Interrupted)?;
                permit.forget();
            }
            if let Err(error) = self.memory.reserve(payload_size).await {
                self.release_permits(1);
                return Err(error);
            }
            Ok(())
        } else {
            if let Some(permits) = &self.permits {
                match permits.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(Error::ProducerQueueIsFull),
                }
            }
            if !self.memory.try_reserve(payload_size) {
                self.release_permits(1);
                return Err(Error::MemoryBufferIsFull);
            }
            Ok(())
        }
    }

    fn release_permits(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(permits) = &self.permits {
            permits.add_permits(count);
        }
    }

    fn release_semaphore(&self, payload_size: usize) {
        self.release_permits(1);
        self.memory.release(payload_size);
    }

    fn release_for_op(&self, op: &OpSendMsg) {
        self.release_permits(op.messages_count as usize);
        self.memory.release(op.messages_size as usize);
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn start_send_timeout_timer(self: &Arc<Self>) {
        if self.conf.send_timeout.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().expect("producer lock poisoned");
        if inner.send_timer.is_some() {
            return;
        }
        let weak = self.self_weak.clone();
        let send_timeout = self.conf.send_timeout;
        inner.send_timer = Some(tokio::spawn(async move {
            let mut delay = send_timeout;
            loop {
                tokio::time::sleep(delay).await;
                let Some(producer) = weak.upgrade() else {
                    return;
                };
                let state = producer.base.state();
                if state != HandlerState::Pending && state != HandlerState::Ready {
                    return;
                }
                let (expired, next_delay) = {
                    let mut inner = producer.inner.lock().expect("producer lock poisoned");
                    let now = Instant::now();
                    match inner.pending.head_deadline() {
                        None => (Vec::new(), send_timeout),
                        Some(deadline) if deadline <= now => {
                            let expired = inner.pending.drain_expired(now);
                            let next = inner
                                .pending
                                .head_deadline()
                                .map(|deadline| deadline.saturating_duration_since(now))
                                .unwrap_or(send_timeout);
                            (expired, next)
                        }
                        Some(deadline) => (Vec::new(), deadline.saturating_duration_since(now)),
                    }
                };
                if !expired.is_empty() {
                    tracing::debug!(
                        producer_id = %producer.producer_id,
                        count = expired.len(),
                        "Send timeout expired, failing head messages"
                    );
                }
                for op in &expired {
                    producer.release_for_op(op);
                }
                for op in expired {
                    op.complete(Err(Error::Timeout));
                }
                delay = next_delay;
            }
        }));
    }

    fn start_data_key_refresh_task(self: &Arc<Self>) {
        let Some(crypto) = self.crypto.clone() else {
            return;
        };
        let mut inner = self.inner.lock().expect("producer lock poisoned");
        if inner.data_key_task.is_some() {
            return;
        }
        let weak = self.self_weak.clone();
        inner.data_key_task = Some(tokio::spawn(async move {
            let period = Duration::from_secs(DATA_KEY_REFRESH_INTERVAL_SECS);
            loop {
                tokio::time::sleep(period).await;
                let Some(producer) = weak.upgrade() else {
                    return;
                };
                if producer.base.state() == HandlerState::Closed {
                    return;
                }
                if let Err(error) = crypto.refresh_data_key() {
                    tracing::error!(%error, "Data key refresh failed");
                }
            }
        }));
    }

    fn cancel_timers(&self) {
        let mut inner = self.inner.lock().expect("producer lock poisoned");
        if let Some(timer) = inner.batch_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.send_timer.take() {
            timer.abort();
        }
        if let Some(task) = inner.data_key_task.take() {
            task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Creation / reconnection
    // -------------------------------------------------------------------------

    fn listener_weak(&self) -> Weak<dyn ProducerListener> {
        self.self_weak.clone()
    }

    fn send_close_producer(&self, connection: &Arc<ClientConnection>) {
        let request_id = new_request_id();
        let connection = connection.clone();
        let producer_id = self.producer_id;
        tokio::spawn(async move {
            let _ = connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(CommandCloseProducer {
                        producer_id,
                        request_id,
                    }),
                    request_id,
                )
                .await;
        });
    }

    fn take_created_sender(&self) -> Option<oneshot::Sender<Result<()>>> {
        self.created_sender
            .lock()
            .expect("created lock poisoned")
            .take()
    }

    fn handle_create_producer(
        self: &Arc<Self>,
        connection: &Arc<ClientConnection>,
        result: Result<ResponseData>,
    ) {
        tracing::debug!(
            producer_id = %self.producer_id,
            ok = result.is_ok(),
            "Create producer response"
        );

        let state = self.base.state();
        if state != HandlerState::Ready && state != HandlerState::Pending {
            // Closed while the request was in flight.
            tracing::debug!("Producer created response received but producer already closed");
            self.fail_pending_messages(Error::AlreadyClosed);
            if matches!(&result, Ok(_) | Err(Error::Timeout)) {
                // The broker may have created the producer; release the
                // slot so later attempts are not blocked.
                self.send_close_producer(connection);
            }
            if let Some(sender) = self.take_created_sender() {
                let _ = sender.send(Err(Error::AlreadyClosed));
            }
            return;
        }

        match result {
            Ok(response) => {
                tracing::info!(
                    cnx = %connection.cnx_string(),
                    producer_name = %response.producer_name,
                    "Created producer on broker"
                );
                connection.register_producer(self.producer_id, self.listener_weak());
                let resend = {
                    let mut inner = self.inner.lock().expect("producer lock poisoned");
                    inner.producer_name = response.producer_name;
                    inner.schema_version = response.schema_version;
                    inner.topic_epoch = response.topic_epoch;
                    if inner.last_sequence_id_published == -1
                        && self.conf.initial_sequence_id == -1
                    {
                        inner.last_sequence_id_published = response.last_sequence_id;
                        inner.sequence_generator = (response.last_sequence_id + 1) as u64;
                    }
                    inner.pending.resend_args()
                };
                if !resend.is_empty() {
                    tracing::debug!(
                        producer_id = %self.producer_id,
                        count = resend.len(),
                        "Re-sending pending messages to server"
                    );
                }
                // Resends go out first; new sends only start writing once
                // the connection is bound below.
                for args in resend {
                    connection.send_message(args);
                }
                handler::set_connection(self, connection);
                self.base.set_state(HandlerState::Ready);
                self.base.reset_backoff();
                self.start_data_key_refresh_task();
                if !self.conf.is_lazy_shared() {
                    self.start_send_timeout_timer();
                }
                if let Some(sender) = self.take_created_sender() {
                    let _ = sender.send(Ok(()));
                }
            }
            Err(error) => {
                if error == Error::Timeout {
                    // The broker might still have created the producer;
                    // tell it to release the slot.
                    self.send_close_producer(connection);
                }

                if error == Error::ProducerFenced {
                    self.base.set_state(HandlerState::ProducerFenced);
                    self.fail_pending_messages(error);
                    if let Some(sender) = self.take_created_sender() {
                        let _ = sender.send(Err(error));
                    }
                } else if self.created_sender.lock().expect("created lock poisoned").is_none() {
                    // The producer existed before this attempt; keep
                    // reconnecting no matter what.
                    if error == Error::ProducerBlockedQuotaExceededException {
                        tracing::warn!(
                            producer_id = %self.producer_id,
                            "Backlog is exceeded on topic, failing pending messages"
                        );
                        self.fail_pending_messages(error);
                    } else if error == Error::ProducerBlockedQuotaExceededError {
                        tracing::warn!(
                            producer_id = %self.producer_id,
                            "Producer is blocked on creation because backlog is exceeded"
                        );
                    }
                    tracing::warn!(producer_id = %self.producer_id, %error, "Failed to reconnect producer");
                    handler::schedule_reconnection(self);
                } else {
                    let converted = self
                        .base
                        .convert_to_timeout_if_necessary(error, self.base.creation_timestamp());
                    if converted.is_retryable() {
                        tracing::warn!(
                            producer_id = %self.producer_id,
                            "Temporary error in creating producer"
                        );
                        handler::schedule_reconnection(self);
                    } else {
                        tracing::error!(
                            producer_id = %self.producer_id,
                            error = %converted,
                            "Failed to create producer"
                        );
                        self.fail_pending_messages(converted);
                        self.base.set_state(HandlerState::Failed);
                        if let Some(sender) = self.take_created_sender() {
                            let _ = sender.send(Err(converted));
                        }
                    }
                }
            }
        }
    }

    /// Drain everything in flight (queue and batch) releasing permits and
    /// memory, then fail the callbacks with `result`.
    fn fail_pending_messages(self: &Arc<Self>, result: Error) {
        let ops = {
            let mut inner = self.inner.lock().expect("producer lock poisoned");
            self.take_pending_ops_locked(&mut inner)
        };
        for op in ops {
            op.complete(Err(result));
        }
    }

    fn take_pending_ops_locked(self: &Arc<Self>, inner: &mut ProducerInner) -> Vec<OpSendMsg> {
        let mut ops = inner.pending.take_all();
        for op in &ops {
            self.release_for_op(op);
        }
        let context = BatchContext {
            producer_id: self.producer_id,
            producer_name: inner.producer_name.clone(),
            compression: self.conf.compression_type,
            send_timeout: self.conf.send_timeout,
            schema_version: inner.schema_version.clone(),
        };
        if let Some(batch) = inner.batch.as_mut() {
            if !batch.is_empty() {
                for op in batch.create_op_send_msgs(&context) {
                    self.release_for_op(&op);
                    ops.push(op);
                }
            }
        }
        ops
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the producer: fail pending sends, release the broker-side
    /// slot, and stop reconnecting. Idempotent.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.close_with_callback(Box::new(move |result| {
            let _ = sender.send(result);
        }));
        receiver.await.unwrap_or(Err(Error::AlreadyClosed))
    }

    pub fn close_with_callback(self: &Arc<Self>, callback: DoneCallback) {
        // Never started: nothing to clean up.
        if self
            .base
            .compare_and_set_state(HandlerState::NotStarted, HandlerState::Closed)
        {
            callback(Ok(()));
            return;
        }

        self.cancel_timers();
        // Unblock producers waiting on admission.
        if let Some(permits) = &self.permits {
            permits.close();
        }
        // Remaining send callbacks fire before the close callback does.
        self.fail_pending_messages(Error::AlreadyClosed);

        let state = self.base.state();
        if state != HandlerState::Ready && state != HandlerState::Pending {
            callback(Err(Error::AlreadyClosed));
            return;
        }
        tracing::info!(topic = self.base.topic(), producer_id = %self.producer_id, "Closing producer");
        self.base.set_state(HandlerState::Closing);

        let Some(connection) = self.base.connection() else {
            self.shutdown();
            callback(Ok(()));
            return;
        };
        // Detach first so nothing else is written by this producer.
        handler::reset_connection(self);

        let request_id = new_request_id();
        let producer = self.clone();
        let producer_id = self.producer_id;
        tokio::spawn(async move {
            let result = connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(CommandCloseProducer {
                        producer_id,
                        request_id,
                    }),
                    request_id,
                )
                .await;
            match result {
                Ok(_) => {
                    tracing::info!(producer_id = %producer_id, "Closed producer");
                    producer.shutdown();
                    callback(Ok(()));
                }
                Err(error) => {
                    tracing::error!(producer_id = %producer_id, %error, "Failed to close producer");
                    callback(Err(error));
                }
            }
        });
    }

    fn shutdown(self: &Arc<Self>) {
        handler::reset_connection(self);
        self.cancel_timers();
        if let Some(sender) = self.take_created_sender() {
            let _ = sender.send(Err(Error::AlreadyClosed));
        }
        self.base.set_state(HandlerState::Closed);
    }
}

fn num_chunks(size: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 1;
    }
    if size >= chunk_size {
        size / chunk_size + usize::from(size % chunk_size != 0)
    } else {
        1
    }
}

#[async_trait]
impl ReconnectableHandler for Producer {
    fn handler_base(&self) -> &HandlerBase {
        &self.base
    }

    fn handler_name(&self) -> String {
        format!("[{}, {}] ", self.base.topic(), self.producer_name())
    }

    async fn connection_opened(self: Arc<Self>, connection: Arc<ClientConnection>) {
        if self.base.state() == HandlerState::Closed {
            tracing::debug!(producer_id = %self.producer_id, "Producer is already closed");
            return;
        }

        let request_id = new_request_id();
        let command = {
            let inner = self.inner.lock().expect("producer lock poisoned");
            BaseCommand::Producer(CommandProducer {
                topic: self.base.topic().to_string(),
                producer_id: self.producer_id,
                request_id,
                producer_name: if inner.producer_name.is_empty() {
                    None
                } else {
                    Some(inner.producer_name.clone())
                },
                encrypted: self.crypto.is_some(),
                properties: self.conf.properties.clone(),
                schema: self.conf.schema.clone(),
                epoch: self.base.epoch(),
                user_provided_producer_name: self.user_provided_name,
                access_mode: self.conf.access_mode,
                topic_epoch: inner.topic_epoch,
                initial_subscription_name: self.conf.initial_subscription_name.clone(),
            })
        };
        let result = connection.send_request_with_id(command, request_id).await;
        self.handle_create_producer(&connection, result);
    }

    fn connection_failed(&self, result: Error) {
        // Lazily started shared producers keep retrying forever.
        if self.conf.is_lazy_shared() {
            return;
        }
        if let Some(sender) = self.take_created_sender() {
            self.base.set_state(HandlerState::Failed);
            let _ = sender.send(Err(result));
        }
    }

    fn before_connection_change(&self, connection: &Arc<ClientConnection>) {
        connection.remove_producer(self.producer_id);
    }
}

impl ProducerListener for Producer {
    fn ack_received(&self, sequence_id: u64, message_id: MessageId) -> bool {
        let (op, published) = {
            let mut inner = self.inner.lock().expect("producer lock poisoned");
            let Some(front) = inner.pending.front() else {
                tracing::debug!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    "Got a receipt for an expired message, ignoring it"
                );
                return true;
            };
            if front.create_result.is_err() {
                tracing::error!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    "Unexpected receipt for a send operation that failed to build"
                );
                return false;
            }
            let expected = front.args.sequence_id;
            if sequence_id > expected {
                tracing::warn!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    expected,
                    queue_size = inner.pending.len(),
                    "Got receipt ahead of the expected sequence"
                );
                return false;
            }
            if sequence_id < expected {
                tracing::debug!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    expected,
                    "Got receipt for a timed out message, ignoring it"
                );
                return true;
            }

            let op = inner.pending.pop_front().expect("head checked above");
            self.release_for_op(&op);
            inner.last_sequence_id_published = sequence_id as i64 + op.messages_count as i64 - 1;

            let published = match &op.chunk_message_id {
                Some(accumulator) => {
                    let mut accumulator = accumulator.lock().expect("chunk id lock poisoned");
                    if op.chunk_id == 0 {
                        accumulator.set_first_chunk(message_id);
                    }
                    if op.chunk_id == op.num_chunks - 1 {
                        accumulator.set_last_chunk(message_id);
                        accumulator
                            .build()
                            .map(PublishedId::Chunked)
                            .unwrap_or(PublishedId::Message(message_id))
                    } else {
                        PublishedId::Message(message_id)
                    }
                }
                None => PublishedId::Message(message_id),
            };
            (op, published)
        };
        tracing::debug!(producer_id = %self.producer_id, sequence_id, "Received ack");
        op.complete(Ok(published));
        true
    }

    fn remove_corrupt_message(&self, sequence_id: u64) -> bool {
        let op = {
            let mut inner = self.inner.lock().expect("producer lock poisoned");
            let Some(front) = inner.pending.front() else {
                tracing::debug!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    "Got send failure for an expired message, ignoring it"
                );
                return true;
            };
            let expected = front.args.sequence_id;
            if sequence_id > expected {
                tracing::warn!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    expected,
                    queue_size = inner.pending.len(),
                    "Got send failure ahead of the expected sequence"
                );
                return false;
            }
            if sequence_id < expected {
                tracing::debug!(
                    producer_id = %self.producer_id,
                    sequence_id,
                    "Corrupt message already timed out, ignoring it"
                );
                return true;
            }
            let op = inner.pending.pop_front().expect("head checked above");
            self.release_for_op(&op);
            op
        };
        tracing::debug!(
            producer_id = %self.producer_id,
            sequence_id,
            "Removing corrupt message from queue"
        );
        op.complete(Err(Error::ChecksumError));
        true
    }

    fn disconnect_producer(&self) {
        tracing::debug!(
            producer_id = %self.producer_id,
            "Broker notification of closed producer"
        );
        let Some(producer) = self.self_weak.upgrade() else {
            return;
        };
        handler::reset_connection(&producer);
        handler::schedule_reconnection(&producer);
    }

    fn handle_disconnection(&self, result: Error, connection: &Arc<ClientConnection>) {
        let Some(producer) = self.self_weak.upgrade() else {
            return;
        };
        handler::handle_disconnection(&producer, result, connection);
    }
}
