//! The protocol command schema.
//!
//! Every control-plane exchange with the broker is one `BaseCommand`
//! framed as described in [`crate::codec`]. Data-plane frames (SEND and
//! MESSAGE) additionally carry a metadata + payload region after the
//! command.
//!
//! Commands are encoded with the [`ToByte`](crate::encode::ToByte)
//! primitives and parsed with the [`crate::parser`] combinators. Field
//! order is fixed per command; optional scalars carry a presence byte,
//! optional strings use an `i16 = -1` length.

use bytes::{BufMut, Bytes, BytesMut};
use nom::IResult;
use nombytes::NomBytes;
use num_traits::FromPrimitive;

use crate::compression::CompressionType;
use crate::encode::{encode_as_array, encode_opt, encode_opt_bytes, encode_opt_string, ToByte};
use crate::error::{Error, Result, ServerError};
use crate::parser::{
    parse_array, parse_bool, parse_bytes, parse_f64, parse_i32, parse_i64, parse_opt,
    parse_opt_bytes, parse_opt_utf8, parse_u16, parse_u32, parse_u64, parse_u8, parse_utf8,
};
use crate::types::{ConsumerId, MessageId, ProducerId, RequestId};

// =============================================================================
// Command type discriminants
// =============================================================================

/// Wire discriminant of a [`BaseCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum CommandType {
    Connect = 2,
    Connected = 3,
    Producer = 5,
    Send = 6,
    SendReceipt = 7,
    SendError = 8,
    Message = 9,
    Success = 13,
    Error = 14,
    CloseProducer = 15,
    CloseConsumer = 16,
    ProducerSuccess = 17,
    Ping = 18,
    Pong = 19,
    PartitionedMetadata = 21,
    PartitionedMetadataResponse = 22,
    Lookup = 23,
    LookupResponse = 24,
    ConsumerStats = 25,
    ConsumerStatsResponse = 26,
    GetLastMessageId = 29,
    GetLastMessageIdResponse = 30,
    ActiveConsumerChange = 31,
    GetTopicsOfNamespace = 32,
    GetTopicsOfNamespaceResponse = 33,
    GetSchema = 34,
    GetSchemaResponse = 35,
    AuthChallenge = 36,
    AuthResponse = 37,
    AckResponse = 38,
}

impl CommandType {
    /// Short name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            CommandType::Connect => "CONNECT",
            CommandType::Connected => "CONNECTED",
            CommandType::Producer => "PRODUCER",
            CommandType::Send => "SEND",
            CommandType::SendReceipt => "SEND_RECEIPT",
            CommandType::SendError => "SEND_ERROR",
            CommandType::Message => "MESSAGE",
            CommandType::Success => "SUCCESS",
            CommandType::Error => "ERROR",
            CommandType::CloseProducer => "CLOSE_PRODUCER",
            CommandType::CloseConsumer => "CLOSE_CONSUMER",
            CommandType::ProducerSuccess => "PRODUCER_SUCCESS",
            CommandType::Ping => "PING",
            CommandType::Pong => "PONG",
            CommandType::PartitionedMetadata => "PARTITIONED_METADATA",
            CommandType::PartitionedMetadataResponse => "PARTITIONED_METADATA_RESPONSE",
            CommandType::Lookup => "LOOKUP",
            CommandType::LookupResponse => "LOOKUP_RESPONSE",
            CommandType::ConsumerStats => "CONSUMER_STATS",
            CommandType::ConsumerStatsResponse => "CONSUMER_STATS_RESPONSE",
            CommandType::GetLastMessageId => "GET_LAST_MESSAGE_ID",
            CommandType::GetLastMessageIdResponse => "GET_LAST_MESSAGE_ID_RESPONSE",
            CommandType::ActiveConsumerChange => "ACTIVE_CONSUMER_CHANGE",
            CommandType::GetTopicsOfNamespace => "GET_TOPICS_OF_NAMESPACE",
            CommandType::GetTopicsOfNamespaceResponse => "GET_TOPICS_OF_NAMESPACE_RESPONSE",
            CommandType::GetSchema => "GET_SCHEMA",
            CommandType::GetSchemaResponse => "GET_SCHEMA_RESPONSE",
            CommandType::AuthChallenge => "AUTH_CHALLENGE",
            CommandType::AuthResponse => "AUTH_RESPONSE",
            CommandType::AckResponse => "ACK_RESPONSE",
        }
    }
}

// =============================================================================
// Shared sub-structures
// =============================================================================

/// Access mode requested when creating a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, num_derive::FromPrimitive)]
pub enum ProducerAccessMode {
    /// Multiple producers may publish concurrently.
    #[default]
    Shared = 0,
    /// Only one producer may be attached at a time.
    Exclusive = 1,
    /// Queue behind the current exclusive producer.
    WaitForExclusive = 2,
    /// Exclusive, fencing out the previous producer.
    ExclusiveWithFencing = 3,
}

/// Topic domain filter for namespace listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, num_derive::FromPrimitive)]
pub enum TopicsOfNamespaceMode {
    Persistent = 0,
    NonPersistent = 1,
    #[default]
    All = 2,
}

/// Outcome discriminant of a LOOKUP_RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum LookupResponseType {
    /// Re-issue the lookup against the returned broker.
    Redirect = 0,
    /// Connect to the returned broker.
    Connect = 1,
    /// The lookup failed; see the error field.
    Failed = 2,
}

/// Outcome discriminant of a PARTITIONED_METADATA_RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum PartitionedMetadataResponseType {
    Success = 0,
    Failed = 1,
}

fn encode_message_id<T: BufMut>(id: &MessageId, buffer: &mut T) -> Result<()> {
    id.ledger_id.encode(buffer)?;
    id.entry_id.encode(buffer)?;
    id.partition.encode(buffer)?;
    id.batch_index.encode(buffer)
}

fn parse_message_id(s: NomBytes) -> IResult<NomBytes, MessageId> {
    let (s, ledger_id) = parse_i64(s)?;
    let (s, entry_id) = parse_i64(s)?;
    let (s, partition) = parse_i32(s)?;
    let (s, batch_index) = parse_i32(s)?;
    Ok((
        s,
        MessageId {
            ledger_id,
            entry_id,
            partition,
            batch_index,
        },
    ))
}

fn encode_properties<T: BufMut>(props: &[(String, String)], buffer: &mut T) -> Result<()> {
    encode_as_array(buffer, props, |buffer, (key, value)| {
        key.encode(buffer)?;
        value.encode(buffer)
    })
}

fn parse_property(s: NomBytes) -> IResult<NomBytes, (String, String)> {
    let (s, key) = parse_utf8(s)?;
    let (s, value) = parse_utf8(s)?;
    Ok((s, (key, value)))
}

/// Schema information carried by PRODUCER and GET_SCHEMA_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaInfo {
    /// Schema type discriminant (0 = none/bytes).
    pub schema_type: i32,
    /// Raw schema definition.
    pub data: Bytes,
    /// Free-form schema properties.
    pub properties: Vec<(String, String)>,
}

impl ToByte for SchemaInfo {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.schema_type.encode(buffer)?;
        self.data.encode(buffer)?;
        encode_properties(&self.properties, buffer)
    }
}

fn parse_schema_info(s: NomBytes) -> IResult<NomBytes, SchemaInfo> {
    let (s, schema_type) = parse_i32(s)?;
    let (s, data) = parse_bytes(s)?;
    let (s, properties) = parse_array(parse_property)(s)?;
    Ok((
        s,
        SchemaInfo {
            schema_type,
            data,
            properties,
        },
    ))
}

/// Per-message key used for end-to-end encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    /// Key name as known to the key management system.
    pub key: String,
    /// Data key encrypted under the named key.
    pub value: Bytes,
}

// =============================================================================
// Message metadata
// =============================================================================

/// Metadata stamped on every published message (or batch).
///
/// Serialized into the payload region of SEND and MESSAGE frames, after the
/// optional checksum section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageMetadata {
    pub producer_name: String,
    /// Publish timestamp, milliseconds since the epoch.
    pub publish_time: u64,
    pub sequence_id: u64,
    /// Cluster this message was replicated from, when set by a replicator
    /// producer.
    pub replicated_from: Option<String>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Bytes>,
    pub compression: CompressionType,
    /// Payload size before compression. Only meaningful when `compression`
    /// is not `None`.
    pub uncompressed_size: u32,
    /// Number of single messages packed in the payload; absent for
    /// non-batched messages.
    pub num_messages_in_batch: Option<i32>,
    /// Absolute delivery time for delayed messages.
    pub deliver_at_time: Option<i64>,
    /// Chunking: shared identity of all chunks of one large message.
    pub uuid: Option<String>,
    pub chunk_id: Option<i32>,
    pub num_chunks_from_msg: Option<i32>,
    pub total_chunk_msg_size: Option<u32>,
    pub schema_version: Option<Bytes>,
    pub encryption_keys: Vec<EncryptionKey>,
    pub encryption_algo: Option<String>,
    /// Algorithm parameter (the IV for CBC modes).
    pub encryption_param: Option<Bytes>,
}

impl MessageMetadata {
    /// Size of this metadata once encoded.
    pub fn encoded_size(&self) -> usize {
        let mut buffer = BytesMut::new();
        // Encoding only fails on oversized strings, which the producer
        // rejects long before this point.
        self.encode(&mut buffer).map(|_| buffer.len()).unwrap_or(0)
    }
}

impl ToByte for MessageMetadata {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.producer_name.encode(buffer)?;
        self.publish_time.encode(buffer)?;
        self.sequence_id.encode(buffer)?;
        encode_opt_string(buffer, self.replicated_from.as_deref())?;
        encode_opt_string(buffer, self.partition_key.as_deref())?;
        encode_opt_bytes(buffer, self.ordering_key.as_deref())?;
        buffer.put_u8(self.compression as u8);
        self.uncompressed_size.encode(buffer)?;
        encode_opt(buffer, self.num_messages_in_batch.as_ref())?;
        encode_opt(buffer, self.deliver_at_time.as_ref())?;
        encode_opt_string(buffer, self.uuid.as_deref())?;
        encode_opt(buffer, self.chunk_id.as_ref())?;
        encode_opt(buffer, self.num_chunks_from_msg.as_ref())?;
        encode_opt(buffer, self.total_chunk_msg_size.as_ref())?;
        encode_opt_bytes(buffer, self.schema_version.as_deref())?;
        encode_as_array(buffer, &self.encryption_keys, |buffer, key| {
            key.key.encode(buffer)?;
            key.value.encode(buffer)
        })?;
        encode_opt_string(buffer, self.encryption_algo.as_deref())?;
        encode_opt_bytes(buffer, self.encryption_param.as_deref())
    }
}

fn parse_encryption_key(s: NomBytes) -> IResult<NomBytes, EncryptionKey> {
    let (s, key) = parse_utf8(s)?;
    let (s, value) = parse_bytes(s)?;
    Ok((s, EncryptionKey { key, value }))
}

/// Parse a [`MessageMetadata`] section, e.g. from a frame's payload
/// region.
pub fn parse_message_metadata(s: NomBytes) -> IResult<NomBytes, MessageMetadata> {
    let (s, producer_name) = parse_utf8(s)?;
    let (s, publish_time) = parse_u64(s)?;
    let (s, sequence_id) = parse_u64(s)?;
    let (s, replicated_from) = parse_opt_utf8(s)?;
    let (s, partition_key) = parse_opt_utf8(s)?;
    let (s, ordering_key) = parse_opt_bytes(s)?;
    let (s, compression_raw) = parse_u8(s)?;
    let compression = CompressionType::from_u8(compression_raw).unwrap_or_default();
    let (s, uncompressed_size) = parse_u32(s)?;
    let (s, num_messages_in_batch) = parse_opt(parse_i32)(s)?;
    let (s, deliver_at_time) = parse_opt(parse_i64)(s)?;
    let (s, uuid) = parse_opt_utf8(s)?;
    let (s, chunk_id) = parse_opt(parse_i32)(s)?;
    let (s, num_chunks_from_msg) = parse_opt(parse_i32)(s)?;
    let (s, total_chunk_msg_size) = parse_opt(parse_u32)(s)?;
    let (s, schema_version) = parse_opt_bytes(s)?;
    let (s, encryption_keys) = parse_array(parse_encryption_key)(s)?;
    let (s, encryption_algo) = parse_opt_utf8(s)?;
    let (s, encryption_param) = parse_opt_bytes(s)?;
    Ok((
        s,
        MessageMetadata {
            producer_name,
            publish_time,
            sequence_id,
            replicated_from,
            partition_key,
            ordering_key,
            compression,
            uncompressed_size,
            num_messages_in_batch,
            deliver_at_time,
            uuid,
            chunk_id,
            num_chunks_from_msg,
            total_chunk_msg_size,
            schema_version,
            encryption_keys,
            encryption_algo,
            encryption_param,
        },
    ))
}

/// Per-entry metadata inside a batched payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SingleMessageMetadata {
    pub partition_key: Option<String>,
    pub ordering_key: Option<Bytes>,
    pub payload_size: u32,
    pub sequence_id: u64,
}

impl ToByte for SingleMessageMetadata {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_opt_string(buffer, self.partition_key.as_deref())?;
        encode_opt_bytes(buffer, self.ordering_key.as_deref())?;
        self.payload_size.encode(buffer)?;
        self.sequence_id.encode(buffer)
    }
}

/// Parse one batch-entry header. Consumers walk a batched payload by
/// alternating `u32` entry sizes, these headers, and the entry payloads.
pub fn parse_single_message_metadata(s: NomBytes) -> IResult<NomBytes, SingleMessageMetadata> {
    let (s, partition_key) = parse_opt_utf8(s)?;
    let (s, ordering_key) = parse_opt_bytes(s)?;
    let (s, payload_size) = parse_u32(s)?;
    let (s, sequence_id) = parse_u64(s)?;
    Ok((
        s,
        SingleMessageMetadata {
            partition_key,
            ordering_key,
            payload_size,
            sequence_id,
        },
    ))
}

/// Metadata stamped by the broker on dispatched entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerEntryMetadata {
    pub broker_timestamp: Option<u64>,
    pub index: Option<u64>,
}

impl ToByte for BrokerEntryMetadata {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_opt(buffer, self.broker_timestamp.as_ref())?;
        encode_opt(buffer, self.index.as_ref())
    }
}

/// Parse a [`BrokerEntryMetadata`] section.
pub fn parse_broker_entry_metadata(s: NomBytes) -> IResult<NomBytes, BrokerEntryMetadata> {
    let (s, broker_timestamp) = parse_opt(parse_u64)(s)?;
    let (s, index) = parse_opt(parse_u64)(s)?;
    Ok((
        s,
        BrokerEntryMetadata {
            broker_timestamp,
            index,
        },
    ))
}

// =============================================================================
// Commands
// =============================================================================

/// First command on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandConnect {
    pub client_version: String,
    pub auth_method_name: Option<String>,
    pub auth_data: Option<Bytes>,
    pub protocol_version: i32,
    /// Set when connecting through a proxy: the logical broker the proxy
    /// should forward to.
    pub proxy_to_broker_url: Option<String>,
}

impl ToByte for CommandConnect {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.client_version.encode(buffer)?;
        encode_opt_string(buffer, self.auth_method_name.as_deref())?;
        encode_opt_bytes(buffer, self.auth_data.as_deref())?;
        self.protocol_version.encode(buffer)?;
        encode_opt_string(buffer, self.proxy_to_broker_url.as_deref())
    }
}

fn parse_connect(s: NomBytes) -> IResult<NomBytes, CommandConnect> {
    let (s, client_version) = parse_utf8(s)?;
    let (s, auth_method_name) = parse_opt_utf8(s)?;
    let (s, auth_data) = parse_opt_bytes(s)?;
    let (s, protocol_version) = parse_i32(s)?;
    let (s, proxy_to_broker_url) = parse_opt_utf8(s)?;
    Ok((
        s,
        CommandConnect {
            client_version,
            auth_method_name,
            auth_data,
            protocol_version,
            proxy_to_broker_url,
        },
    ))
}

/// Broker handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandConnected {
    /// Required by the contract; a missing value closes the connection.
    pub server_version: Option<String>,
    pub protocol_version: i32,
    /// Overrides the process-wide frame size limit when present.
    pub max_message_size: Option<i32>,
}

impl ToByte for CommandConnected {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_opt_string(buffer, self.server_version.as_deref())?;
        self.protocol_version.encode(buffer)?;
        encode_opt(buffer, self.max_message_size.as_ref())
    }
}

fn parse_connected(s: NomBytes) -> IResult<NomBytes, CommandConnected> {
    let (s, server_version) = parse_opt_utf8(s)?;
    let (s, protocol_version) = parse_i32(s)?;
    let (s, max_message_size) = parse_opt(parse_i32)(s)?;
    Ok((
        s,
        CommandConnected {
            server_version,
            protocol_version,
            max_message_size,
        },
    ))
}

/// Create (or re-attach) a producer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandProducer {
    pub topic: String,
    pub producer_id: ProducerId,
    pub request_id: RequestId,
    pub producer_name: Option<String>,
    pub encrypted: bool,
    pub properties: Vec<(String, String)>,
    pub schema: Option<SchemaInfo>,
    /// Handler epoch at the time of the request; lets the broker discard
    /// stale attach attempts.
    pub epoch: u64,
    pub user_provided_producer_name: bool,
    pub access_mode: ProducerAccessMode,
    pub topic_epoch: Option<u64>,
    pub initial_subscription_name: Option<String>,
}

impl ToByte for CommandProducer {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.topic.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.request_id.encode(buffer)?;
        encode_opt_string(buffer, self.producer_name.as_deref())?;
        self.encrypted.encode(buffer)?;
        encode_properties(&self.properties, buffer)?;
        match &self.schema {
            Some(schema) => {
                buffer.put_u8(1);
                schema.encode(buffer)?;
            }
            None => buffer.put_u8(0),
        }
        self.epoch.encode(buffer)?;
        self.user_provided_producer_name.encode(buffer)?;
        (self.access_mode as i32).encode(buffer)?;
        encode_opt(buffer, self.topic_epoch.as_ref())?;
        encode_opt_string(buffer, self.initial_subscription_name.as_deref())
    }
}

fn parse_producer(s: NomBytes) -> IResult<NomBytes, CommandProducer> {
    let (s, topic) = parse_utf8(s)?;
    let (s, producer_id) = parse_u64(s)?;
    let (s, request_id) = parse_u64(s)?;
    let (s, producer_name) = parse_opt_utf8(s)?;
    let (s, encrypted) = parse_bool(s)?;
    let (s, properties) = parse_array(parse_property)(s)?;
    let (s, has_schema) = parse_u8(s)?;
    let (s, schema) = if has_schema != 0 {
        let (s, schema) = parse_schema_info(s)?;
        (s, Some(schema))
    } else {
        (s, None)
    };
    let (s, epoch) = parse_u64(s)?;
    let (s, user_provided_producer_name) = parse_bool(s)?;
    let (s, access_mode_raw) = parse_i32(s)?;
    let (s, topic_epoch) = parse_opt(parse_u64)(s)?;
    let (s, initial_subscription_name) = parse_opt_utf8(s)?;
    Ok((
        s,
        CommandProducer {
            topic,
            producer_id: ProducerId(producer_id),
            request_id: RequestId(request_id),
            producer_name,
            encrypted,
            properties,
            schema,
            epoch,
            user_provided_producer_name,
            access_mode: ProducerAccessMode::from_i32(access_mode_raw).unwrap_or_default(),
            topic_epoch,
            initial_subscription_name,
        },
    ))
}

/// Publish one message, batch or chunk. The metadata and payload travel in
/// the frame's payload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandSend {
    pub producer_id: ProducerId,
    pub sequence_id: u64,
    pub num_messages: i32,
}

impl ToByte for CommandSend {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.sequence_id.encode(buffer)?;
        self.num_messages.encode(buffer)
    }
}

fn parse_send(s: NomBytes) -> IResult<NomBytes, CommandSend> {
    let (s, producer_id) = parse_u64(s)?;
    let (s, sequence_id) = parse_u64(s)?;
    let (s, num_messages) = parse_i32(s)?;
    Ok((
        s,
        CommandSend {
            producer_id: ProducerId(producer_id),
            sequence_id,
            num_messages,
        },
    ))
}

/// Broker acknowledgement of a SEND.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandSendReceipt {
    pub producer_id: ProducerId,
    pub sequence_id: u64,
    pub message_id: MessageId,
}

impl ToByte for CommandSendReceipt {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.sequence_id.encode(buffer)?;
        encode_message_id(&self.message_id, buffer)
    }
}

fn parse_send_receipt(s: NomBytes) -> IResult<NomBytes, CommandSendReceipt> {
    let (s, producer_id) = parse_u64(s)?;
    let (s, sequence_id) = parse_u64(s)?;
    let (s, message_id) = parse_message_id(s)?;
    Ok((
        s,
        CommandSendReceipt {
            producer_id: ProducerId(producer_id),
            sequence_id,
            message_id,
        },
    ))
}

/// Broker rejection of a SEND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSendError {
    pub producer_id: ProducerId,
    pub sequence_id: u64,
    pub error: ServerError,
    pub message: String,
}

impl ToByte for CommandSendError {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.sequence_id.encode(buffer)?;
        (self.error as i32).encode(buffer)?;
        self.message.encode(buffer)
    }
}

fn parse_send_error(s: NomBytes) -> IResult<NomBytes, CommandSendError> {
    let (s, producer_id) = parse_u64(s)?;
    let (s, sequence_id) = parse_u64(s)?;
    let (s, error_raw) = parse_i32(s)?;
    let (s, message) = parse_utf8(s)?;
    Ok((
        s,
        CommandSendError {
            producer_id: ProducerId(producer_id),
            sequence_id,
            error: ServerError::from_i32(error_raw).unwrap_or(ServerError::UnknownError),
            message,
        },
    ))
}

/// Entry dispatched to a consumer. Metadata and payload travel in the
/// frame's payload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandMessage {
    pub consumer_id: ConsumerId,
    pub message_id: MessageId,
    pub redelivery_count: u32,
}

impl ToByte for CommandMessage {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_id.encode(buffer)?;
        encode_message_id(&self.message_id, buffer)?;
        self.redelivery_count.encode(buffer)
    }
}

fn parse_message(s: NomBytes) -> IResult<NomBytes, CommandMessage> {
    let (s, consumer_id) = parse_u64(s)?;
    let (s, message_id) = parse_message_id(s)?;
    let (s, redelivery_count) = parse_u32(s)?;
    Ok((
        s,
        CommandMessage {
            consumer_id: ConsumerId(consumer_id),
            message_id,
            redelivery_count,
        },
    ))
}

/// Generic success reply keyed by request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandSuccess {
    pub request_id: RequestId,
}

impl ToByte for CommandSuccess {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)
    }
}

fn parse_success(s: NomBytes) -> IResult<NomBytes, CommandSuccess> {
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandSuccess {
            request_id: RequestId(request_id),
        },
    ))
}

/// Generic error reply keyed by request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub request_id: RequestId,
    pub error: ServerError,
    pub message: String,
}

impl ToByte for CommandError {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        (self.error as i32).encode(buffer)?;
        self.message.encode(buffer)
    }
}

fn parse_error(s: NomBytes) -> IResult<NomBytes, CommandError> {
    let (s, request_id) = parse_u64(s)?;
    let (s, error_raw) = parse_i32(s)?;
    let (s, message) = parse_utf8(s)?;
    Ok((
        s,
        CommandError {
            request_id: RequestId(request_id),
            error: ServerError::from_i32(error_raw).unwrap_or(ServerError::UnknownError),
            message,
        },
    ))
}

/// Close a producer: client request or broker notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandCloseProducer {
    pub producer_id: ProducerId,
    pub request_id: RequestId,
}

impl ToByte for CommandCloseProducer {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.request_id.encode(buffer)
    }
}

fn parse_close_producer(s: NomBytes) -> IResult<NomBytes, CommandCloseProducer> {
    let (s, producer_id) = parse_u64(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandCloseProducer {
            producer_id: ProducerId(producer_id),
            request_id: RequestId(request_id),
        },
    ))
}

/// Close a consumer: client request or broker notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandCloseConsumer {
    pub consumer_id: ConsumerId,
    pub request_id: RequestId,
}

impl ToByte for CommandCloseConsumer {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_id.encode(buffer)?;
        self.request_id.encode(buffer)
    }
}

fn parse_close_consumer(s: NomBytes) -> IResult<NomBytes, CommandCloseConsumer> {
    let (s, consumer_id) = parse_u64(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandCloseConsumer {
            consumer_id: ConsumerId(consumer_id),
            request_id: RequestId(request_id),
        },
    ))
}

/// Producer creation reply, possibly two-phase.
///
/// With `producer_ready = false` the broker has only queued the producer
/// (e.g. waiting on an exclusive slot); a second PRODUCER_SUCCESS with
/// `producer_ready = true` completes the request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandProducerSuccess {
    pub request_id: RequestId,
    pub producer_name: String,
    pub last_sequence_id: i64,
    pub schema_version: Option<Bytes>,
    pub topic_epoch: Option<u64>,
    pub producer_ready: bool,
}

impl ToByte for CommandProducerSuccess {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        self.producer_name.encode(buffer)?;
        self.last_sequence_id.encode(buffer)?;
        encode_opt_bytes(buffer, self.schema_version.as_deref())?;
        encode_opt(buffer, self.topic_epoch.as_ref())?;
        self.producer_ready.encode(buffer)
    }
}

fn parse_producer_success(s: NomBytes) -> IResult<NomBytes, CommandProducerSuccess> {
    let (s, request_id) = parse_u64(s)?;
    let (s, producer_name) = parse_utf8(s)?;
    let (s, last_sequence_id) = parse_i64(s)?;
    let (s, schema_version) = parse_opt_bytes(s)?;
    let (s, topic_epoch) = parse_opt(parse_u64)(s)?;
    let (s, producer_ready) = parse_bool(s)?;
    Ok((
        s,
        CommandProducerSuccess {
            request_id: RequestId(request_id),
            producer_name,
            last_sequence_id,
            schema_version,
            topic_epoch,
            producer_ready,
        },
    ))
}

/// Topic lookup request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLookup {
    pub topic: String,
    pub request_id: RequestId,
    pub authoritative: bool,
    pub listener_name: Option<String>,
}

impl ToByte for CommandLookup {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.topic.encode(buffer)?;
        self.request_id.encode(buffer)?;
        self.authoritative.encode(buffer)?;
        encode_opt_string(buffer, self.listener_name.as_deref())
    }
}

fn parse_lookup(s: NomBytes) -> IResult<NomBytes, CommandLookup> {
    let (s, topic) = parse_utf8(s)?;
    let (s, request_id) = parse_u64(s)?;
    let (s, authoritative) = parse_bool(s)?;
    let (s, listener_name) = parse_opt_utf8(s)?;
    Ok((
        s,
        CommandLookup {
            topic,
            request_id: RequestId(request_id),
            authoritative,
            listener_name,
        },
    ))
}

/// Topic lookup reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLookupResponse {
    pub request_id: RequestId,
    /// Absent when the broker sent a malformed failure reply; mapped to
    /// `ConnectError` by the dispatcher.
    pub response: Option<LookupResponseType>,
    pub broker_service_url: Option<String>,
    pub broker_service_url_tls: Option<String>,
    pub authoritative: bool,
    pub proxy_through_service_url: bool,
    pub error: Option<ServerError>,
    pub message: Option<String>,
}

impl Default for CommandLookupResponse {
    fn default() -> Self {
        CommandLookupResponse {
            request_id: RequestId(0),
            response: None,
            broker_service_url: None,
            broker_service_url_tls: None,
            authoritative: false,
            proxy_through_service_url: false,
            error: None,
            message: None,
        }
    }
}

impl ToByte for CommandLookupResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_opt(buffer, self.response.map(|r| r as i32).as_ref())?;
        encode_opt_string(buffer, self.broker_service_url.as_deref())?;
        encode_opt_string(buffer, self.broker_service_url_tls.as_deref())?;
        self.authoritative.encode(buffer)?;
        self.proxy_through_service_url.encode(buffer)?;
        encode_opt(buffer, self.error.map(|e| e as i32).as_ref())?;
        encode_opt_string(buffer, self.message.as_deref())
    }
}

fn parse_lookup_response(s: NomBytes) -> IResult<NomBytes, CommandLookupResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, response_raw) = parse_opt(parse_i32)(s)?;
    let (s, broker_service_url) = parse_opt_utf8(s)?;
    let (s, broker_service_url_tls) = parse_opt_utf8(s)?;
    let (s, authoritative) = parse_bool(s)?;
    let (s, proxy_through_service_url) = parse_bool(s)?;
    let (s, error_raw) = parse_opt(parse_i32)(s)?;
    let (s, message) = parse_opt_utf8(s)?;
    Ok((
        s,
        CommandLookupResponse {
            request_id: RequestId(request_id),
            response: response_raw.and_then(LookupResponseType::from_i32),
            broker_service_url,
            broker_service_url_tls,
            authoritative,
            proxy_through_service_url,
            error: error_raw.and_then(ServerError::from_i32),
            message,
        },
    ))
}

/// Partition count request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandPartitionedMetadata {
    pub topic: String,
    pub request_id: RequestId,
}

impl ToByte for CommandPartitionedMetadata {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.topic.encode(buffer)?;
        self.request_id.encode(buffer)
    }
}

fn parse_partitioned_metadata(s: NomBytes) -> IResult<NomBytes, CommandPartitionedMetadata> {
    let (s, topic) = parse_utf8(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandPartitionedMetadata {
            topic,
            request_id: RequestId(request_id),
        },
    ))
}

/// Partition count reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPartitionedMetadataResponse {
    pub request_id: RequestId,
    pub partitions: u32,
    pub response: Option<PartitionedMetadataResponseType>,
    pub error: Option<ServerError>,
    pub message: Option<String>,
}

impl Default for CommandPartitionedMetadataResponse {
    fn default() -> Self {
        CommandPartitionedMetadataResponse {
            request_id: RequestId(0),
            partitions: 0,
            response: None,
            error: None,
            message: None,
        }
    }
}

impl ToByte for CommandPartitionedMetadataResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        self.partitions.encode(buffer)?;
        encode_opt(buffer, self.response.map(|r| r as i32).as_ref())?;
        encode_opt(buffer, self.error.map(|e| e as i32).as_ref())?;
        encode_opt_string(buffer, self.message.as_deref())
    }
}

fn parse_partitioned_metadata_response(
    s: NomBytes,
) -> IResult<NomBytes, CommandPartitionedMetadataResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, partitions) = parse_u32(s)?;
    let (s, response_raw) = parse_opt(parse_i32)(s)?;
    let (s, error_raw) = parse_opt(parse_i32)(s)?;
    let (s, message) = parse_opt_utf8(s)?;
    Ok((
        s,
        CommandPartitionedMetadataResponse {
            request_id: RequestId(request_id),
            partitions,
            response: response_raw.and_then(PartitionedMetadataResponseType::from_i32),
            error: error_raw.and_then(ServerError::from_i32),
            message,
        },
    ))
}

/// Broker-side consumer stats request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandConsumerStats {
    pub consumer_id: ConsumerId,
    pub request_id: RequestId,
}

impl ToByte for CommandConsumerStats {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_id.encode(buffer)?;
        self.request_id.encode(buffer)
    }
}

fn parse_consumer_stats(s: NomBytes) -> IResult<NomBytes, CommandConsumerStats> {
    let (s, consumer_id) = parse_u64(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandConsumerStats {
            consumer_id: ConsumerId(consumer_id),
            request_id: RequestId(request_id),
        },
    ))
}

/// Broker-side consumer stats snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandConsumerStatsResponse {
    pub request_id: RequestId,
    pub error_code: Option<ServerError>,
    pub error_message: Option<String>,
    pub msg_rate_out: f64,
    pub msg_throughput_out: f64,
    pub msg_rate_redeliver: f64,
    pub consumer_name: String,
    pub available_permits: u64,
    pub unacked_messages: u64,
    pub blocked_consumer_on_unacked_msgs: bool,
    pub address: String,
    pub connected_since: String,
    pub consumer_type: String,
    pub msg_rate_expired: f64,
    pub msg_backlog: u64,
}

impl ToByte for CommandConsumerStatsResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_opt(buffer, self.error_code.map(|e| e as i32).as_ref())?;
        encode_opt_string(buffer, self.error_message.as_deref())?;
        self.msg_rate_out.encode(buffer)?;
        self.msg_throughput_out.encode(buffer)?;
        self.msg_rate_redeliver.encode(buffer)?;
        self.consumer_name.encode(buffer)?;
        self.available_permits.encode(buffer)?;
        self.unacked_messages.encode(buffer)?;
        self.blocked_consumer_on_unacked_msgs.encode(buffer)?;
        self.address.encode(buffer)?;
        self.connected_since.encode(buffer)?;
        self.consumer_type.encode(buffer)?;
        self.msg_rate_expired.encode(buffer)?;
        self.msg_backlog.encode(buffer)
    }
}

fn parse_consumer_stats_response(s: NomBytes) -> IResult<NomBytes, CommandConsumerStatsResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, error_raw) = parse_opt(parse_i32)(s)?;
    let (s, error_message) = parse_opt_utf8(s)?;
    let (s, msg_rate_out) = parse_f64(s)?;
    let (s, msg_throughput_out) = parse_f64(s)?;
    let (s, msg_rate_redeliver) = parse_f64(s)?;
    let (s, consumer_name) = parse_utf8(s)?;
    let (s, available_permits) = parse_u64(s)?;
    let (s, unacked_messages) = parse_u64(s)?;
    let (s, blocked_consumer_on_unacked_msgs) = parse_bool(s)?;
    let (s, address) = parse_utf8(s)?;
    let (s, connected_since) = parse_utf8(s)?;
    let (s, consumer_type) = parse_utf8(s)?;
    let (s, msg_rate_expired) = parse_f64(s)?;
    let (s, msg_backlog) = parse_u64(s)?;
    Ok((
        s,
        CommandConsumerStatsResponse {
            request_id: RequestId(request_id),
            error_code: error_raw.and_then(ServerError::from_i32),
            error_message,
            msg_rate_out,
            msg_throughput_out,
            msg_rate_redeliver,
            consumer_name,
            available_permits,
            unacked_messages,
            blocked_consumer_on_unacked_msgs,
            address,
            connected_since,
            consumer_type,
            msg_rate_expired,
            msg_backlog,
        },
    ))
}

/// Last message id request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandGetLastMessageId {
    pub consumer_id: ConsumerId,
    pub request_id: RequestId,
}

impl ToByte for CommandGetLastMessageId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_id.encode(buffer)?;
        self.request_id.encode(buffer)
    }
}

fn parse_get_last_message_id(s: NomBytes) -> IResult<NomBytes, CommandGetLastMessageId> {
    let (s, consumer_id) = parse_u64(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandGetLastMessageId {
            consumer_id: ConsumerId(consumer_id),
            request_id: RequestId(request_id),
        },
    ))
}

/// Last message id reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandGetLastMessageIdResponse {
    pub request_id: RequestId,
    pub last_message_id: MessageId,
    pub consumer_mark_delete_position: Option<MessageId>,
}

impl ToByte for CommandGetLastMessageIdResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_message_id(&self.last_message_id, buffer)?;
        match &self.consumer_mark_delete_position {
            Some(position) => {
                buffer.put_u8(1);
                encode_message_id(position, buffer)?;
            }
            None => buffer.put_u8(0),
        }
        Ok(())
    }
}

fn parse_get_last_message_id_response(
    s: NomBytes,
) -> IResult<NomBytes, CommandGetLastMessageIdResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, last_message_id) = parse_message_id(s)?;
    let (s, consumer_mark_delete_position) = parse_opt(parse_message_id)(s)?;
    Ok((
        s,
        CommandGetLastMessageIdResponse {
            request_id: RequestId(request_id),
            last_message_id,
            consumer_mark_delete_position,
        },
    ))
}

/// Exclusive-subscription ownership notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandActiveConsumerChange {
    pub consumer_id: ConsumerId,
    pub is_active: bool,
}

impl ToByte for CommandActiveConsumerChange {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_id.encode(buffer)?;
        self.is_active.encode(buffer)
    }
}

fn parse_active_consumer_change(s: NomBytes) -> IResult<NomBytes, CommandActiveConsumerChange> {
    let (s, consumer_id) = parse_u64(s)?;
    let (s, is_active) = parse_bool(s)?;
    Ok((
        s,
        CommandActiveConsumerChange {
            consumer_id: ConsumerId(consumer_id),
            is_active,
        },
    ))
}

/// Namespace topic listing request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandGetTopicsOfNamespace {
    pub namespace: String,
    pub request_id: RequestId,
    pub mode: TopicsOfNamespaceMode,
}

impl ToByte for CommandGetTopicsOfNamespace {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.namespace.encode(buffer)?;
        self.request_id.encode(buffer)?;
        (self.mode as i32).encode(buffer)
    }
}

fn parse_get_topics_of_namespace(s: NomBytes) -> IResult<NomBytes, CommandGetTopicsOfNamespace> {
    let (s, namespace) = parse_utf8(s)?;
    let (s, request_id) = parse_u64(s)?;
    let (s, mode_raw) = parse_i32(s)?;
    Ok((
        s,
        CommandGetTopicsOfNamespace {
            namespace,
            request_id: RequestId(request_id),
            mode: TopicsOfNamespaceMode::from_i32(mode_raw).unwrap_or_default(),
        },
    ))
}

/// Namespace topic listing reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandGetTopicsOfNamespaceResponse {
    pub request_id: RequestId,
    pub topics: Vec<String>,
}

impl ToByte for CommandGetTopicsOfNamespaceResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| topic.encode(buffer))
    }
}

fn parse_get_topics_of_namespace_response(
    s: NomBytes,
) -> IResult<NomBytes, CommandGetTopicsOfNamespaceResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, topics) = parse_array(parse_utf8)(s)?;
    Ok((
        s,
        CommandGetTopicsOfNamespaceResponse {
            request_id: RequestId(request_id),
            topics,
        },
    ))
}

/// Schema fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandGetSchema {
    pub topic: String,
    pub schema_version: Option<Bytes>,
    pub request_id: RequestId,
}

impl ToByte for CommandGetSchema {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_opt_bytes(buffer, self.schema_version.as_deref())?;
        self.request_id.encode(buffer)
    }
}

fn parse_get_schema(s: NomBytes) -> IResult<NomBytes, CommandGetSchema> {
    let (s, topic) = parse_utf8(s)?;
    let (s, schema_version) = parse_opt_bytes(s)?;
    let (s, request_id) = parse_u64(s)?;
    Ok((
        s,
        CommandGetSchema {
            topic,
            schema_version,
            request_id: RequestId(request_id),
        },
    ))
}

/// Schema fetch reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandGetSchemaResponse {
    pub request_id: RequestId,
    pub error_code: Option<ServerError>,
    pub error_message: Option<String>,
    pub schema: Option<SchemaInfo>,
}

impl ToByte for CommandGetSchemaResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_opt(buffer, self.error_code.map(|e| e as i32).as_ref())?;
        encode_opt_string(buffer, self.error_message.as_deref())?;
        match &self.schema {
            Some(schema) => {
                buffer.put_u8(1);
                schema.encode(buffer)?;
            }
            None => buffer.put_u8(0),
        }
        Ok(())
    }
}

fn parse_get_schema_response(s: NomBytes) -> IResult<NomBytes, CommandGetSchemaResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, error_raw) = parse_opt(parse_i32)(s)?;
    let (s, error_message) = parse_opt_utf8(s)?;
    let (s, has_schema) = parse_u8(s)?;
    let (s, schema) = if has_schema != 0 {
        let (s, schema) = parse_schema_info(s)?;
        (s, Some(schema))
    } else {
        (s, None)
    };
    Ok((
        s,
        CommandGetSchemaResponse {
            request_id: RequestId(request_id),
            error_code: error_raw.and_then(ServerError::from_i32),
            error_message,
            schema,
        },
    ))
}

/// Broker demand for fresh authentication data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandAuthChallenge {
    pub auth_method_name: Option<String>,
    pub challenge: Bytes,
}

impl ToByte for CommandAuthChallenge {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_opt_string(buffer, self.auth_method_name.as_deref())?;
        self.challenge.encode(buffer)
    }
}

fn parse_auth_challenge(s: NomBytes) -> IResult<NomBytes, CommandAuthChallenge> {
    let (s, auth_method_name) = parse_opt_utf8(s)?;
    let (s, challenge) = parse_bytes(s)?;
    Ok((
        s,
        CommandAuthChallenge {
            auth_method_name,
            challenge,
        },
    ))
}

/// Reply to an AUTH_CHALLENGE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandAuthResponse {
    pub client_version: String,
    pub auth_method_name: Option<String>,
    pub auth_data: Bytes,
    pub protocol_version: i32,
}

impl ToByte for CommandAuthResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.client_version.encode(buffer)?;
        encode_opt_string(buffer, self.auth_method_name.as_deref())?;
        self.auth_data.encode(buffer)?;
        self.protocol_version.encode(buffer)
    }
}

fn parse_auth_response(s: NomBytes) -> IResult<NomBytes, CommandAuthResponse> {
    let (s, client_version) = parse_utf8(s)?;
    let (s, auth_method_name) = parse_opt_utf8(s)?;
    let (s, auth_data) = parse_bytes(s)?;
    let (s, protocol_version) = parse_i32(s)?;
    Ok((
        s,
        CommandAuthResponse {
            client_version,
            auth_method_name,
            auth_data,
            protocol_version,
        },
    ))
}

/// Acknowledgement confirmation keyed by request id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandAckResponse {
    pub request_id: RequestId,
    pub error: Option<ServerError>,
}

impl ToByte for CommandAckResponse {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.request_id.encode(buffer)?;
        encode_opt(buffer, self.error.map(|e| e as i32).as_ref())
    }
}

fn parse_ack_response(s: NomBytes) -> IResult<NomBytes, CommandAckResponse> {
    let (s, request_id) = parse_u64(s)?;
    let (s, error_raw) = parse_opt(parse_i32)(s)?;
    Ok((
        s,
        CommandAckResponse {
            request_id: RequestId(request_id),
            error: error_raw.and_then(ServerError::from_i32),
        },
    ))
}

// =============================================================================
// BaseCommand
// =============================================================================

/// The protocol-level discriminated union of control and data commands.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseCommand {
    Connect(CommandConnect),
    Connected(CommandConnected),
    Producer(CommandProducer),
    Send(CommandSend),
    SendReceipt(CommandSendReceipt),
    SendError(CommandSendError),
    Message(CommandMessage),
    Success(CommandSuccess),
    Error(CommandError),
    CloseProducer(CommandCloseProducer),
    CloseConsumer(CommandCloseConsumer),
    ProducerSuccess(CommandProducerSuccess),
    Ping,
    Pong,
    PartitionedMetadata(CommandPartitionedMetadata),
    PartitionedMetadataResponse(CommandPartitionedMetadataResponse),
    Lookup(CommandLookup),
    LookupResponse(CommandLookupResponse),
    ConsumerStats(CommandConsumerStats),
    ConsumerStatsResponse(CommandConsumerStatsResponse),
    GetLastMessageId(CommandGetLastMessageId),
    GetLastMessageIdResponse(CommandGetLastMessageIdResponse),
    ActiveConsumerChange(CommandActiveConsumerChange),
    GetTopicsOfNamespace(CommandGetTopicsOfNamespace),
    GetTopicsOfNamespaceResponse(CommandGetTopicsOfNamespaceResponse),
    GetSchema(CommandGetSchema),
    GetSchemaResponse(CommandGetSchemaResponse),
    AuthChallenge(CommandAuthChallenge),
    AuthResponse(CommandAuthResponse),
    AckResponse(CommandAckResponse),
}

impl BaseCommand {
    /// Wire discriminant of this command.
    pub fn command_type(&self) -> CommandType {
        match self {
            BaseCommand::Connect(_) => CommandType::Connect,
            BaseCommand::Connected(_) => CommandType::Connected,
            BaseCommand::Producer(_) => CommandType::Producer,
            BaseCommand::Send(_) => CommandType::Send,
            BaseCommand::SendReceipt(_) => CommandType::SendReceipt,
            BaseCommand::SendError(_) => CommandType::SendError,
            BaseCommand::Message(_) => CommandType::Message,
            BaseCommand::Success(_) => CommandType::Success,
            BaseCommand::Error(_) => CommandType::Error,
            BaseCommand::CloseProducer(_) => CommandType::CloseProducer,
            BaseCommand::CloseConsumer(_) => CommandType::CloseConsumer,
            BaseCommand::ProducerSuccess(_) => CommandType::ProducerSuccess,
            BaseCommand::Ping => CommandType::Ping,
            BaseCommand::Pong => CommandType::Pong,
            BaseCommand::PartitionedMetadata(_) => CommandType::PartitionedMetadata,
            BaseCommand::PartitionedMetadataResponse(_) => {
                CommandType::PartitionedMetadataResponse
            }
            BaseCommand::Lookup(_) => CommandType::Lookup,
            BaseCommand::LookupResponse(_) => CommandType::LookupResponse,
            BaseCommand::ConsumerStats(_) => CommandType::ConsumerStats,
            BaseCommand::ConsumerStatsResponse(_) => CommandType::ConsumerStatsResponse,
            BaseCommand::GetLastMessageId(_) => CommandType::GetLastMessageId,
            BaseCommand::GetLastMessageIdResponse(_) => CommandType::GetLastMessageIdResponse,
            BaseCommand::ActiveConsumerChange(_) => CommandType::ActiveConsumerChange,
            BaseCommand::GetTopicsOfNamespace(_) => CommandType::GetTopicsOfNamespace,
            BaseCommand::GetTopicsOfNamespaceResponse(_) => {
                CommandType::GetTopicsOfNamespaceResponse
            }
            BaseCommand::GetSchema(_) => CommandType::GetSchema,
            BaseCommand::GetSchemaResponse(_) => CommandType::GetSchemaResponse,
            BaseCommand::AuthChallenge(_) => CommandType::AuthChallenge,
            BaseCommand::AuthResponse(_) => CommandType::AuthResponse,
            BaseCommand::AckResponse(_) => CommandType::AckResponse,
        }
    }

    /// Encode this command (discriminant plus body) into `buffer`.
    pub fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u16(self.command_type() as u16);
        match self {
            BaseCommand::Connect(cmd) => cmd.encode(buffer),
            BaseCommand::Connected(cmd) => cmd.encode(buffer),
            BaseCommand::Producer(cmd) => cmd.encode(buffer),
            BaseCommand::Send(cmd) => cmd.encode(buffer),
            BaseCommand::SendReceipt(cmd) => cmd.encode(buffer),
            BaseCommand::SendError(cmd) => cmd.encode(buffer),
            BaseCommand::Message(cmd) => cmd.encode(buffer),
            BaseCommand::Success(cmd) => cmd.encode(buffer),
            BaseCommand::Error(cmd) => cmd.encode(buffer),
            BaseCommand::CloseProducer(cmd) => cmd.encode(buffer),
            BaseCommand::CloseConsumer(cmd) => cmd.encode(buffer),
            BaseCommand::ProducerSuccess(cmd) => cmd.encode(buffer),
            BaseCommand::Ping | BaseCommand::Pong => Ok(()),
            BaseCommand::PartitionedMetadata(cmd) => cmd.encode(buffer),
            BaseCommand::PartitionedMetadataResponse(cmd) => cmd.encode(buffer),
            BaseCommand::Lookup(cmd) => cmd.encode(buffer),
            BaseCommand::LookupResponse(cmd) => cmd.encode(buffer),
            BaseCommand::ConsumerStats(cmd) => cmd.encode(buffer),
            BaseCommand::ConsumerStatsResponse(cmd) => cmd.encode(buffer),
            BaseCommand::GetLastMessageId(cmd) => cmd.encode(buffer),
            BaseCommand::GetLastMessageIdResponse(cmd) => cmd.encode(buffer),
            BaseCommand::ActiveConsumerChange(cmd) => cmd.encode(buffer),
            BaseCommand::GetTopicsOfNamespace(cmd) => cmd.encode(buffer),
            BaseCommand::GetTopicsOfNamespaceResponse(cmd) => cmd.encode(buffer),
            BaseCommand::GetSchema(cmd) => cmd.encode(buffer),
            BaseCommand::GetSchemaResponse(cmd) => cmd.encode(buffer),
            BaseCommand::AuthChallenge(cmd) => cmd.encode(buffer),
            BaseCommand::AuthResponse(cmd) => cmd.encode(buffer),
            BaseCommand::AckResponse(cmd) => cmd.encode(buffer),
        }
    }

    /// Encode this command into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        self.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    /// Parse a command from exactly `data`.
    pub fn parse(data: Bytes) -> Result<BaseCommand> {
        let input = NomBytes::new(data);
        let (input, type_raw) =
            parse_u16::<_, nom::error::Error<NomBytes>>(input).map_err(|_| Error::MalformedFrame)?;
        let command_type = CommandType::from_u16(type_raw).ok_or(Error::UnknownCommand)?;

        fn finish<C>(
            result: IResult<NomBytes, C>,
            wrap: impl FnOnce(C) -> BaseCommand,
        ) -> Result<BaseCommand> {
            match result {
                Ok((_, cmd)) => Ok(wrap(cmd)),
                Err(_) => Err(Error::MalformedFrame),
            }
        }

        match command_type {
            CommandType::Connect => finish(parse_connect(input), BaseCommand::Connect),
            CommandType::Connected => finish(parse_connected(input), BaseCommand::Connected),
            CommandType::Producer => finish(parse_producer(input), BaseCommand::Producer),
            CommandType::Send => finish(parse_send(input), BaseCommand::Send),
            CommandType::SendReceipt => finish(parse_send_receipt(input), BaseCommand::SendReceipt),
            CommandType::SendError => finish(parse_send_error(input), BaseCommand::SendError),
            CommandType::Message => finish(parse_message(input), BaseCommand::Message),
            CommandType::Success => finish(parse_success(input), BaseCommand::Success),
            CommandType::Error => finish(parse_error(input), BaseCommand::Error),
            CommandType::CloseProducer => {
                finish(parse_close_producer(input), BaseCommand::CloseProducer)
            }
            CommandType::CloseConsumer => {
                finish(parse_close_consumer(input), BaseCommand::CloseConsumer)
            }
            CommandType::ProducerSuccess => {
                finish(parse_producer_success(input), BaseCommand::ProducerSuccess)
            }
            CommandType::Ping => Ok(BaseCommand::Ping),
            CommandType::Pong => Ok(BaseCommand::Pong),
            CommandType::PartitionedMetadata => finish(
                parse_partitioned_metadata(input),
                BaseCommand::PartitionedMetadata,
            ),
            CommandType::PartitionedMetadataResponse => finish(
                parse_partitioned_metadata_response(input),
                BaseCommand::PartitionedMetadataResponse,
            ),
            CommandType::Lookup => finish(parse_lookup(input), BaseCommand::Lookup),
            CommandType::LookupResponse => {
                finish(parse_lookup_response(input), BaseCommand::LookupResponse)
            }
            CommandType::ConsumerStats => {
                finish(parse_consumer_stats(input), BaseCommand::ConsumerStats)
            }
            CommandType::ConsumerStatsResponse => finish(
                parse_consumer_stats_response(input),
                BaseCommand::ConsumerStatsResponse,
            ),
            CommandType::GetLastMessageId => finish(
                parse_get_last_message_id(input),
                BaseCommand::GetLastMessageId,
            ),
            CommandType::GetLastMessageIdResponse => finish(
                parse_get_last_message_id_response(input),
                BaseCommand::GetLastMessageIdResponse,
            ),
            CommandType::ActiveConsumerChange => finish(
                parse_active_consumer_change(input),
                BaseCommand::ActiveConsumerChange,
            ),
            CommandType::GetTopicsOfNamespace => finish(
                parse_get_topics_of_namespace(input),
                BaseCommand::GetTopicsOfNamespace,
            ),
            CommandType::GetTopicsOfNamespaceResponse => finish(
                parse_get_topics_of_namespace_response(input),
                BaseCommand::GetTopicsOfNamespaceResponse,
            ),
            CommandType::GetSchema => finish(parse_get_schema(input), BaseCommand::GetSchema),
            CommandType::GetSchemaResponse => finish(
                parse_get_schema_response(input),
                BaseCommand::GetSchemaResponse,
            ),
            CommandType::AuthChallenge => {
                finish(parse_auth_challenge(input), BaseCommand::AuthChallenge)
            }
            CommandType::AuthResponse => {
                finish(parse_auth_response(input), BaseCommand::AuthResponse)
            }
            CommandType::AckResponse => finish(parse_ack_response(input), BaseCommand::AckResponse),
        }
    }
}
