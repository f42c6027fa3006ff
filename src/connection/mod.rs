//! The multiplexed broker connection.
//!
//! One [`ClientConnection`] carries every producer and consumer bound to a
//! broker over a single full-duplex framed session. It owns:
//!
//! - the lifecycle state machine (`Pending → TcpConnected → Ready →
//!   Disconnected`, with `Disconnected` terminal),
//! - the request registries keyed by request id, one map per request kind,
//! - the keep-alive protocol (PING every 30 s, death on an unanswered
//!   probe),
//! - dispatch of incoming commands to response futures and to registered
//!   producer/consumer handles.
//!
//! Writes are serialized through a single writer task fed by a channel, so
//! at most one socket write is in flight at any time; this also covers the
//! TLS case where reads and writes must not interleave with handshakes.
//! Reads are driven by a single reader task. Registry locks are held only
//! around map mutations: every user-visible completion happens after the
//! lock is dropped.

mod socket;
pub(crate) mod tls;

pub use socket::ServiceUrl;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::codec::{self, ChecksumType, DecodedFrame};
use crate::commands::{
    BaseCommand, BrokerEntryMetadata, CommandAuthResponse, CommandConnect, CommandMessage,
    CommandSend, LookupResponseType, MessageMetadata, PartitionedMetadataResponseType, SchemaInfo,
};
use crate::config::ClientConfiguration;
use crate::constants::{
    CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_MESSAGE_SIZE, KEEP_ALIVE_INTERVAL_SECS,
    PARTITION_SUFFIX, PROTOCOL_VERSION_CHECKSUM, PROTOCOL_VERSION_CONSUMER_STATS,
    PROTOCOL_VERSION_KEEP_ALIVE, PROTOCOL_VERSION_MIN,
};
use crate::error::{Error, Result, ServerError};
use crate::producer::pending::SendArguments;
use crate::types::{ConsumerId, MessageId, ProducerId, RequestId};

use socket::{BrokerStream, FrameReader};

// =============================================================================
// Process-wide negotiated state
// =============================================================================

static MAX_MESSAGE_SIZE: AtomicI32 = AtomicI32::new(DEFAULT_MAX_MESSAGE_SIZE);

/// The negotiated maximum frame size, observed by all producers on all
/// connections.
pub fn max_message_size() -> i32 {
    MAX_MESSAGE_SIZE.load(Ordering::Acquire)
}

fn set_max_message_size(size: i32) {
    MAX_MESSAGE_SIZE.store(size, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn reset_max_message_size() {
    set_max_message_size(DEFAULT_MAX_MESSAGE_SIZE);
}

static REQUEST_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

/// Allocate a request id, unique across the process and therefore across
/// every connection.
pub fn new_request_id() -> RequestId {
    RequestId(REQUEST_ID_GENERATOR.fetch_add(1, Ordering::Relaxed))
}

// =============================================================================
// Results delivered through request futures
// =============================================================================

/// Data returned by request/response exchanges; populated by
/// PRODUCER_SUCCESS, empty for plain SUCCESS acks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseData {
    pub producer_name: String,
    pub last_sequence_id: i64,
    pub schema_version: Option<Bytes>,
    pub topic_epoch: Option<u64>,
}

/// Successful topic lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupResult {
    /// Broker URL matching this connection's transport (TLS url on a TLS
    /// connection, plain otherwise).
    pub broker_url: String,
    pub broker_url_tls: String,
    pub authoritative: bool,
    /// True when the broker asks the client to re-lookup elsewhere.
    pub redirect: bool,
    pub proxy_through_service_url: bool,
}

/// Either outcome of the shared lookup registry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LookupOutcome {
    Broker(LookupResult),
    Partitions(u32),
}

/// Broker-side consumer statistics snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BrokerConsumerStats {
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

/// Reply to a last-message-id request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastMessageIdResult {
    pub last_message_id: MessageId,
    pub mark_delete_position: Option<MessageId>,
}

// =============================================================================
// Handle contracts
// =============================================================================

/// The connection-facing surface of a producer handle.
///
/// A `false` return from the ack callbacks is a protocol violation and
/// closes the connection so the producer can resynchronize on reconnect.
pub trait ProducerListener: Send + Sync {
    fn ack_received(&self, sequence_id: u64, message_id: MessageId) -> bool;
    fn remove_corrupt_message(&self, sequence_id: u64) -> bool;
    /// Broker-initiated CLOSE_PRODUCER notification.
    fn disconnect_producer(&self);
    /// The connection carrying this producer closed.
    fn handle_disconnection(&self, result: Error, connection: &Arc<ClientConnection>);
}

/// The connection-facing surface of a consumer handle.
pub trait ConsumerListener: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn message_received(
        &self,
        connection: &Arc<ClientConnection>,
        message: CommandMessage,
        checksum_valid: bool,
        broker_metadata: Option<BrokerEntryMetadata>,
        metadata: MessageMetadata,
        payload: Bytes,
    );
    fn active_consumer_changed(&self, is_active: bool);
    /// Broker-initiated CLOSE_CONSUMER notification.
    fn disconnect_consumer(&self);
    /// The connection carrying this consumer closed.
    fn handle_disconnection(&self, result: Error, connection: &Arc<ClientConnection>);
}

// =============================================================================
// Internals
// =============================================================================

/// Connection lifecycle states. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Pending = 0,
    TcpConnected = 1,
    Ready = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Pending,
            1 => State::TcpConnected,
            2 => State::Ready,
            _ => State::Disconnected,
        }
    }
}

/// One queued socket write.
enum WriteOp {
    /// A pre-encoded command frame.
    Command(Bytes),
    /// A send operation, encoded by the writer so the reusable header is
    /// rebuilt per write while the payload bytes stay shared.
    Send(Arc<SendArguments>),
}

struct PendingRequest {
    sender: oneshot::Sender<Result<ResponseData>>,
    /// Set when a two-phase reply (PRODUCER_SUCCESS with
    /// `producer_ready=false`) arrived; suppresses the timeout.
    has_got_response: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    pending_requests: HashMap<u64, PendingRequest>,
    pending_lookups: HashMap<u64, oneshot::Sender<Result<LookupOutcome>>>,
    num_pending_lookups: u32,
    pending_consumer_stats: HashMap<u64, oneshot::Sender<Result<BrokerConsumerStats>>>,
    pending_last_message_id: HashMap<u64, oneshot::Sender<Result<LastMessageIdResult>>>,
    pending_namespace_topics: HashMap<u64, oneshot::Sender<Result<Vec<String>>>>,
    pending_get_schema: HashMap<u64, oneshot::Sender<Result<SchemaInfo>>>,
    producers: HashMap<u64, Weak<dyn ProducerListener>>,
    consumers: HashMap<u64, Weak<dyn ConsumerListener>>,
}

struct DrainedRegistry {
    pending_requests: Vec<PendingRequest>,
    pending_lookups: Vec<oneshot::Sender<Result<LookupOutcome>>>,
    pending_consumer_stats: Vec<oneshot::Sender<Result<BrokerConsumerStats>>>,
    pending_last_message_id: Vec<oneshot::Sender<Result<LastMessageIdResult>>>,
    pending_namespace_topics: Vec<oneshot::Sender<Result<Vec<String>>>>,
    pending_get_schema: Vec<oneshot::Sender<Result<SchemaInfo>>>,
    producers: Vec<Weak<dyn ProducerListener>>,
    consumers: Vec<Weak<dyn ConsumerListener>>,
}

impl Registry {
    fn drain(&mut self) -> DrainedRegistry {
        self.num_pending_lookups = 0;
        DrainedRegistry {
            pending_requests: self.pending_requests.drain().map(|(_, v)| v).collect(),
            pending_lookups: self.pending_lookups.drain().map(|(_, v)| v).collect(),
            pending_consumer_stats: self
                .pending_consumer_stats
                .drain()
                .map(|(_, v)| v)
                .collect(),
            pending_last_message_id: self
                .pending_last_message_id
                .drain()
                .map(|(_, v)| v)
                .collect(),
            pending_namespace_topics: self
                .pending_namespace_topics
                .drain()
                .map(|(_, v)| v)
                .collect(),
            pending_get_schema: self.pending_get_schema.drain().map(|(_, v)| v).collect(),
            producers: self.producers.drain().map(|(_, v)| v).collect(),
            consumers: self.consumers.drain().map(|(_, v)| v).collect(),
        }
    }
}

// =============================================================================
// ClientConnection
// =============================================================================

/// A single framed protocol session with one broker.
pub struct ClientConnection {
    logical_address: String,
    physical_address: String,
    /// `[local -> remote]` label prefixed to log lines; a placeholder
    /// until the TCP connect resolves the local endpoint.
    cnx_string: Mutex<String>,
    state: AtomicU8,
    /// Negotiated at the CONNECTED handshake, minimum until then.
    server_protocol_version: AtomicI32,
    is_tls: bool,
    operation_timeout: Duration,
    max_pending_lookups: u32,
    auth: Arc<dyn Authenticator>,
    client_version: String,
    writer_tx: mpsc::UnboundedSender<WriteOp>,
    have_pending_ping: AtomicBool,
    /// Resolved once the handshake completes (or fails).
    connect_sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
    registry: Mutex<Registry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("cnx", &self.cnx_string())
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("protocol_version", &self.server_protocol_version())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Establish a connection: resolve, connect, optionally handshake TLS,
    /// then run the protocol handshake (CONNECT/CONNECTED) through the
    /// dispatch loop. The whole sequence shares one `connection_timeout`
    /// budget: the dial phase runs under an explicit timeout, the
    /// remainder is watched by a connect-timeout task that closes the
    /// socket if `Ready` is not reached in time.
    ///
    /// `physical_address` is the address to dial; `logical_address` is the
    /// target broker, differing only when connecting through a proxy.
    pub async fn connect(
        logical_address: &str,
        physical_address: &str,
        config: &ClientConfiguration,
        auth: Arc<dyn Authenticator>,
        client_version: &str,
    ) -> Result<Arc<ClientConnection>> {
        config.validate()?;
        let service_url = ServiceUrl::parse(physical_address)?;
        let is_tls = service_url.tls || config.use_tls;
        let started = std::time::Instant::now();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = oneshot::channel();
        let connection = Arc::new(ClientConnection {
            logical_address: logical_address.to_string(),
            physical_address: physical_address.to_string(),
            cnx_string: Mutex::new(format!("[<none> -> {}] ", physical_address)),
            state: AtomicU8::new(State::Pending as u8),
            server_protocol_version: AtomicI32::new(PROTOCOL_VERSION_MIN),
            is_tls,
            operation_timeout: config.operation_timeout,
            max_pending_lookups: config.concurrent_lookup_requests,
            auth,
            client_version: client_version.to_string(),
            writer_tx,
            have_pending_ping: AtomicBool::new(false),
            connect_sender: Mutex::new(Some(connect_tx)),
            registry: Mutex::new(Registry::default()),
            tasks: Mutex::new(Vec::new()),
        });

        // Dial phase. No tasks exist yet, so a failure here just drops
        // the half-built connection.
        let dialed = tokio::time::timeout(
            config.connection_timeout,
            socket::connect_socket(physical_address, config, connection.auth.as_ref()),
        )
        .await;
        let (stream, cnx_string) = match dialed {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(
                    physical_address,
                    timeout_ms = config.connection_timeout.as_millis() as u64,
                    "Connection was not established within the connection timeout"
                );
                return Err(Error::ConnectError);
            }
        };
        *connection.cnx_string.lock().expect("cnx lock poisoned") = cnx_string;
        connection
            .state
            .store(State::TcpConnected as u8, Ordering::Release);

        if logical_address == physical_address {
            tracing::info!(cnx = %connection.cnx_string(), "Connected to broker");
        } else {
            tracing::info!(
                cnx = %connection.cnx_string(),
                logical_address,
                "Connected to broker through proxy"
            );
        }

        connection.spawn_io_tasks(stream, writer_rx);
        connection.spawn_connect_watchdog(
            config.connection_timeout.saturating_sub(started.elapsed()),
            config.connection_timeout,
        );

        // Send CONNECT; the CONNECTED reply is dispatched through
        // `handle_frame` (the `TcpConnected` state accepts nothing else)
        // and resolves the connect promise.
        let auth_data = match connection.auth.auth_data().await {
            Ok(auth_data) => auth_data,
            Err(error) => {
                connection.close(error);
                return Err(error);
            }
        };
        connection.send_command(BaseCommand::Connect(CommandConnect {
            client_version: client_version.to_string(),
            auth_method_name: Some(connection.auth.auth_method_name().to_string()),
            auth_data: if auth_data.is_empty() {
                None
            } else {
                Some(auth_data)
            },
            protocol_version: CURRENT_PROTOCOL_VERSION,
            proxy_to_broker_url: if logical_address == physical_address {
                None
            } else {
                Some(logical_address.to_string())
            },
        }));

        match connect_rx.await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::ConnectError),
        }
    }

    fn spawn_io_tasks(self: &Arc<Self>, stream: BrokerStream, writer_rx: mpsc::UnboundedReceiver<WriteOp>) {
        let (read_half, write_half) = tokio::io::split(stream);

        let tasks = vec![
            tokio::spawn(run_reader(
                Arc::downgrade(self),
                read_half,
                FrameReader::new(),
            )),
            tokio::spawn(run_writer(Arc::downgrade(self), write_half, writer_rx)),
        ];

        self.tasks.lock().expect("task lock poisoned").extend(tasks);

        // A racing close may have drained an empty task list; re-collect.
        if self.is_closed() {
            let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
            for task in tasks {
                task.abort();
            }
        }
    }

    /// The connect-timeout watchdog: if the handshake has not reached
    /// `Ready` when the remaining budget elapses, the connection is
    /// closed and the connect promise fails.
    fn spawn_connect_watchdog(self: &Arc<Self>, remaining: Duration, budget: Duration) {
        let weak = Arc::downgrade(self);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let state = connection.state();
            if state != State::Ready && state != State::Disconnected {
                tracing::error!(
                    cnx = %connection.cnx_string(),
                    timeout_ms = budget.as_millis() as u64,
                    "Connection was not established within the connection timeout, closing the socket"
                );
                connection.close(Error::ConnectError);
            }
        });
        self.tasks.lock().expect("task lock poisoned").push(watchdog);

        if self.is_closed() {
            let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
            for task in tasks {
                task.abort();
            }
        }
    }

    /// Complete the handshake: validate CONNECTED, adopt the negotiated
    /// limits, transition to `Ready`, and start the timers that depend on
    /// the protocol version.
    fn handle_pulsar_connected(self: &Arc<Self>, connected: crate::commands::CommandConnected) {
        let Some(server_version) = connected.server_version else {
            tracing::error!(cnx = %self.cnx_string(), "Server version is not set");
            self.close(Error::ConnectError);
            return;
        };
        if let Some(size) = connected.max_message_size {
            tracing::debug!(max_message_size = size, "Negotiated max message size");
            set_max_message_size(size);
        }

        self.server_protocol_version
            .store(connected.protocol_version, Ordering::Release);
        // Only a live handshake may become Ready; a connection closed in
        // the meantime stays closed.
        if self
            .state
            .compare_exchange(
                State::TcpConnected as u8,
                State::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::info!(cnx = %self.cnx_string(), "Connection already closed");
            return;
        }

        tracing::info!(
            cnx = %self.cnx_string(),
            server_version = %server_version,
            protocol_version = connected.protocol_version,
            "Connection established"
        );

        {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            if connected.protocol_version >= PROTOCOL_VERSION_KEEP_ALIVE {
                tasks.push(tokio::spawn(run_keep_alive(Arc::downgrade(self))));
            }
            if connected.protocol_version >= PROTOCOL_VERSION_CONSUMER_STATS {
                tasks.push(tokio::spawn(run_consumer_stats_sweep(
                    Arc::downgrade(self),
                    self.operation_timeout,
                )));
            }
        }
        if self.is_closed() {
            let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
            for task in tasks {
                task.abort();
            }
        }

        if let Some(sender) = self
            .connect_sender
            .lock()
            .expect("connect lock poisoned")
            .take()
        {
            let _ = sender.send(Ok(()));
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Address this connection dialed.
    pub fn broker_address(&self) -> &str {
        &self.physical_address
    }

    /// Logical broker this connection serves.
    pub fn logical_address(&self) -> &str {
        &self.logical_address
    }

    /// The `[local -> remote]` label for log correlation.
    pub fn cnx_string(&self) -> String {
        self.cnx_string.lock().expect("cnx lock poisoned").clone()
    }

    /// Protocol version advertised by the broker; the minimum until the
    /// handshake completes.
    pub fn server_protocol_version(&self) -> i32 {
        self.server_protocol_version.load(Ordering::Acquire)
    }

    /// Checksum policy for outgoing SEND frames on this connection.
    pub fn checksum_type(&self) -> ChecksumType {
        if self.server_protocol_version() >= PROTOCOL_VERSION_CHECKSUM {
            ChecksumType::Crc32c
        } else {
            ChecksumType::None
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Queue a command frame for writing. Frames are drained strictly in
    /// FIFO order by the single writer.
    pub fn send_command(&self, command: BaseCommand) {
        if self.is_closed() {
            tracing::debug!(cnx = %self.cnx_string(), "Dropping command on closed connection");
            return;
        }
        match codec::encode_command(&command) {
            Ok(frame) => {
                let _ = self.writer_tx.send(WriteOp::Command(frame));
            }
            Err(error) => {
                tracing::error!(cnx = %self.cnx_string(), %error, "Failed to encode command");
            }
        }
    }

    /// Queue a send operation. The frame is built at write time so the
    /// header can carry this connection's checksum policy.
    pub fn send_message(&self, args: Arc<SendArguments>) {
        if self.is_closed() {
            return;
        }
        let _ = self.writer_tx.send(WriteOp::Send(args));
    }

    /// Send a request and await the broker's reply for `request_id`.
    ///
    /// The reply future fails with [`Error::Timeout`] after the operation
    /// timeout, with the broker-reported error on ERROR, or with the close
    /// reason when the connection dies first.
    pub async fn send_request_with_id(
        self: &Arc<Self>,
        command: BaseCommand,
        request_id: RequestId,
    ) -> Result<ResponseData> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            let (sender, receiver) = oneshot::channel();
            registry.pending_requests.insert(
                request_id.0,
                PendingRequest {
                    sender,
                    has_got_response: Arc::new(AtomicBool::new(false)),
                },
            );
            receiver
        };
        self.spawn_request_timeout(request_id);
        self.send_command(command);
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    fn spawn_request_timeout(self: &Arc<Self>, request_id: RequestId) {
        let weak = Arc::downgrade(self);
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut registry = connection.registry.lock().expect("registry lock poisoned");
                let has_got_response = registry
                    .pending_requests
                    .get(&request_id.0)
                    .map(|pending| pending.has_got_response.load(Ordering::Acquire));
                match has_got_response {
                    // An intermediate reply arrived; the final response has
                    // no deadline of its own.
                    Some(true) => None,
                    Some(false) => registry.pending_requests.remove(&request_id.0),
                    None => None,
                }
            };
            if let Some(pending) = expired {
                let _ = pending.sender.send(Err(Error::Timeout));
            }
        });
    }

    async fn new_lookup(
        self: &Arc<Self>,
        command: BaseCommand,
        request_id: RequestId,
    ) -> Result<LookupOutcome> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            if registry.num_pending_lookups >= self.max_pending_lookups {
                return Err(Error::TooManyLookupRequests);
            }
            let (sender, receiver) = oneshot::channel();
            registry.pending_lookups.insert(request_id.0, sender);
            registry.num_pending_lookups += 1;
            receiver
        };
        self.spawn_lookup_timeout(request_id);
        self.send_command(command);
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    fn spawn_lookup_timeout(self: &Arc<Self>, request_id: RequestId) {
        let weak = Arc::downgrade(self);
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut registry = connection.registry.lock().expect("registry lock poisoned");
                let expired = registry.pending_lookups.remove(&request_id.0);
                if expired.is_some() {
                    registry.num_pending_lookups -= 1;
                }
                expired
            };
            if let Some(sender) = expired {
                let _ = sender.send(Err(Error::Timeout));
            }
        });
    }

    /// Look up the broker serving `topic`.
    ///
    /// Fails synchronously with [`Error::TooManyLookupRequests`] when the
    /// concurrent-lookup limit is reached; there is no queueing.
    pub async fn lookup_topic(
        self: &Arc<Self>,
        topic: &str,
        authoritative: bool,
        request_id: RequestId,
    ) -> Result<LookupResult> {
        let command = BaseCommand::Lookup(crate::commands::CommandLookup {
            topic: topic.to_string(),
            request_id,
            authoritative,
            listener_name: None,
        });
        match self.new_lookup(command, request_id).await? {
            LookupOutcome::Broker(result) => Ok(result),
            LookupOutcome::Partitions(_) => Err(Error::UnknownError),
        }
    }

    /// Look up the broker serving `topic`, forwarding a listener name.
    pub async fn lookup_topic_with_listener(
        self: &Arc<Self>,
        topic: &str,
        authoritative: bool,
        listener_name: Option<String>,
        request_id: RequestId,
    ) -> Result<LookupResult> {
        let command = BaseCommand::Lookup(crate::commands::CommandLookup {
            topic: topic.to_string(),
            request_id,
            authoritative,
            listener_name,
        });
        match self.new_lookup(command, request_id).await? {
            LookupOutcome::Broker(result) => Ok(result),
            LookupOutcome::Partitions(_) => Err(Error::UnknownError),
        }
    }

    /// Fetch the partition count of `topic`. Shares the lookup registry
    /// and its concurrency limit.
    pub async fn partitioned_metadata(
        self: &Arc<Self>,
        topic: &str,
        request_id: RequestId,
    ) -> Result<u32> {
        let command =
            BaseCommand::PartitionedMetadata(crate::commands::CommandPartitionedMetadata {
                topic: topic.to_string(),
                request_id,
            });
        match self.new_lookup(command, request_id).await? {
            LookupOutcome::Partitions(partitions) => Ok(partitions),
            LookupOutcome::Broker(_) => Err(Error::UnknownError),
        }
    }

    /// Fetch broker-side stats for a consumer. Timed out in bulk by the
    /// periodic stats sweep rather than per-request timers.
    pub async fn consumer_stats(
        self: &Arc<Self>,
        consumer_id: ConsumerId,
        request_id: RequestId,
    ) -> Result<BrokerConsumerStats> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            let (sender, receiver) = oneshot::channel();
            registry.pending_consumer_stats.insert(request_id.0, sender);
            receiver
        };
        self.send_command(BaseCommand::ConsumerStats(
            crate::commands::CommandConsumerStats {
                consumer_id,
                request_id,
            },
        ));
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    /// Fetch the id of the last message persisted on a topic.
    pub async fn get_last_message_id(
        self: &Arc<Self>,
        consumer_id: ConsumerId,
        request_id: RequestId,
    ) -> Result<LastMessageIdResult> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            let (sender, receiver) = oneshot::channel();
            registry
                .pending_last_message_id
                .insert(request_id.0, sender);
            receiver
        };
        self.spawn_last_message_id_timeout(request_id);
        self.send_command(BaseCommand::GetLastMessageId(
            crate::commands::CommandGetLastMessageId {
                consumer_id,
                request_id,
            },
        ));
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    fn spawn_last_message_id_timeout(self: &Arc<Self>, request_id: RequestId) {
        let weak = Arc::downgrade(self);
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut registry = connection.registry.lock().expect("registry lock poisoned");
                registry.pending_last_message_id.remove(&request_id.0)
            };
            if let Some(sender) = expired {
                let _ = sender.send(Err(Error::Timeout));
            }
        });
    }

    /// List the topics of a namespace, partition suffixes stripped and
    /// deduplicated.
    pub async fn get_topics_of_namespace(
        self: &Arc<Self>,
        namespace: &str,
        mode: crate::commands::TopicsOfNamespaceMode,
        request_id: RequestId,
    ) -> Result<Vec<String>> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            let (sender, receiver) = oneshot::channel();
            registry
                .pending_namespace_topics
                .insert(request_id.0, sender);
            receiver
        };
        self.spawn_namespace_topics_timeout(request_id);
        self.send_command(BaseCommand::GetTopicsOfNamespace(
            crate::commands::CommandGetTopicsOfNamespace {
                namespace: namespace.to_string(),
                request_id,
                mode,
            },
        ));
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    fn spawn_namespace_topics_timeout(self: &Arc<Self>, request_id: RequestId) {
        let weak = Arc::downgrade(self);
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut registry = connection.registry.lock().expect("registry lock poisoned");
                registry.pending_namespace_topics.remove(&request_id.0)
            };
            if let Some(sender) = expired {
                let _ = sender.send(Err(Error::Timeout));
            }
        });
    }

    /// Fetch the schema of a topic, optionally at a specific version.
    pub async fn get_schema(
        self: &Arc<Self>,
        topic: &str,
        schema_version: Option<Bytes>,
        request_id: RequestId,
    ) -> Result<SchemaInfo> {
        let receiver = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            let (sender, receiver) = oneshot::channel();
            registry.pending_get_schema.insert(request_id.0, sender);
            receiver
        };
        self.spawn_get_schema_timeout(request_id);
        self.send_command(BaseCommand::GetSchema(crate::commands::CommandGetSchema {
            topic: topic.to_string(),
            schema_version,
            request_id,
        }));
        receiver.await.unwrap_or(Err(Error::Disconnected))
    }

    fn spawn_get_schema_timeout(self: &Arc<Self>, request_id: RequestId) {
        let weak = Arc::downgrade(self);
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut registry = connection.registry.lock().expect("registry lock poisoned");
                registry.pending_get_schema.remove(&request_id.0)
            };
            if let Some(sender) = expired {
                let _ = sender.send(Err(Error::Timeout));
            }
        });
    }

    // -------------------------------------------------------------------------
    // Handle registration
    // -------------------------------------------------------------------------

    /// Register a producer for SEND_RECEIPT/SEND_ERROR dispatch. The
    /// connection keeps only a weak reference.
    pub fn register_producer(&self, producer_id: ProducerId, producer: Weak<dyn ProducerListener>) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.producers.insert(producer_id.0, producer);
    }

    /// Register a consumer for MESSAGE dispatch. The connection keeps only
    /// a weak reference.
    pub fn register_consumer(&self, consumer_id: ConsumerId, consumer: Weak<dyn ConsumerListener>) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.consumers.insert(consumer_id.0, consumer);
    }

    pub fn remove_producer(&self, producer_id: ProducerId) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.producers.remove(&producer_id.0);
    }

    pub fn remove_consumer(&self, consumer_id: ConsumerId) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.consumers.remove(&consumer_id.0);
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the connection. Idempotent.
    ///
    /// Transitions to `Disconnected`, tears down the socket and timers,
    /// then fails every outstanding promise with `result` and notifies all
    /// registered handles, outside the registry lock.
    pub fn close(self: &Arc<Self>, result: Error) {
        let previous = State::from_u8(
            self.state
                .swap(State::Disconnected as u8, Ordering::AcqRel),
        );
        if previous == State::Disconnected {
            return;
        }

        // Aborting the I/O tasks drops both socket halves, which shuts the
        // transport down in both directions.
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
        for task in tasks {
            task.abort();
        }

        let drained = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.drain()
        };

        if result == Error::Disconnected || result == Error::Retryable {
            tracing::info!(cnx = %self.cnx_string(), "Connection disconnected");
        } else {
            tracing::error!(cnx = %self.cnx_string(), %result, "Connection closed");
        }

        // A close during the handshake fails the connect promise.
        if let Some(sender) = self
            .connect_sender
            .lock()
            .expect("connect lock poisoned")
            .take()
        {
            let _ = sender.send(Err(result));
        }

        for producer in drained.producers {
            if let Some(producer) = producer.upgrade() {
                producer.handle_disconnection(result, self);
            }
        }
        for consumer in drained.consumers {
            if let Some(consumer) = consumer.upgrade() {
                consumer.handle_disconnection(result, self);
            }
        }
        for pending in drained.pending_requests {
            let _ = pending.sender.send(Err(result));
        }
        for sender in drained.pending_lookups {
            let _ = sender.send(Err(result));
        }
        for sender in drained.pending_consumer_stats {
            tracing::warn!(cnx = %self.cnx_string(), "Failing consumer stats request on close");
            let _ = sender.send(Err(result));
        }
        for sender in drained.pending_last_message_id {
            let _ = sender.send(Err(result));
        }
        for sender in drained.pending_namespace_topics {
            let _ = sender.send(Err(result));
        }
        for sender in drained.pending_get_schema {
            let _ = sender.send(Err(result));
        }
    }

    // -------------------------------------------------------------------------
    // Inbound dispatch
    // -------------------------------------------------------------------------

    fn handle_frame(self: &Arc<Self>, frame: DecodedFrame) {
        match self.state() {
            State::Pending => {
                tracing::error!(cnx = %self.cnx_string(), "Connection is not ready yet");
            }
            State::TcpConnected => {
                // Handshaking: the only acceptable command is CONNECTED.
                match frame.command {
                    BaseCommand::Connected(connected) => self.handle_pulsar_connected(connected),
                    other => {
                        tracing::error!(
                            cnx = %self.cnx_string(),
                            command = other.command_type().name(),
                            "Unexpected command during handshake"
                        );
                        self.close(Error::ConnectError);
                    }
                }
            }
            State::Disconnected => {
                tracing::error!(cnx = %self.cnx_string(), "Connection already disconnected");
            }
            State::Ready => {
                // Incoming data proves the peer is alive.
                self.have_pending_ping.store(false, Ordering::Release);
                self.dispatch_command(frame);
            }
        }
    }

    fn dispatch_command(self: &Arc<Self>, frame: DecodedFrame) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            command = frame.command.command_type().name(),
            "Handling incoming command"
        );
        match frame.command {
            BaseCommand::SendReceipt(receipt) => self.handle_send_receipt(receipt),
            BaseCommand::SendError(error) => self.handle_send_error(error),
            BaseCommand::Success(success) => self.handle_success(success),
            BaseCommand::Error(error) => self.handle_error(error),
            BaseCommand::ProducerSuccess(success) => self.handle_producer_success(success),
            BaseCommand::LookupResponse(response) => self.handle_lookup_response(response),
            BaseCommand::PartitionedMetadataResponse(response) => {
                self.handle_partitioned_metadata_response(response)
            }
            BaseCommand::CloseProducer(close) => self.handle_close_producer(close),
            BaseCommand::CloseConsumer(close) => self.handle_close_consumer(close),
            BaseCommand::Ping => {
                tracing::debug!(cnx = %self.cnx_string(), "Replying to ping command");
                self.send_command(BaseCommand::Pong);
            }
            BaseCommand::Pong => {
                tracing::debug!(cnx = %self.cnx_string(), "Received response to ping message");
            }
            BaseCommand::AuthChallenge(challenge) => self.handle_auth_challenge(challenge),
            BaseCommand::ActiveConsumerChange(change) => {
                self.handle_active_consumer_change(change)
            }
            BaseCommand::Message(message) => self.handle_incoming_message(message, frame.payload),
            BaseCommand::GetLastMessageIdResponse(response) => {
                self.handle_get_last_message_id_response(response)
            }
            BaseCommand::GetTopicsOfNamespaceResponse(response) => {
                self.handle_get_topics_of_namespace_response(response)
            }
            BaseCommand::GetSchemaResponse(response) => self.handle_get_schema_response(response),
            BaseCommand::ConsumerStatsResponse(response) => {
                self.handle_consumer_stats_response(response)
            }
            BaseCommand::AckResponse(response) => self.handle_ack_response(response),
            other => {
                tracing::warn!(
                    cnx = %self.cnx_string(),
                    command = other.command_type().name(),
                    "Received invalid message from server"
                );
                self.close(Error::Disconnected);
            }
        }
    }

    fn handle_send_receipt(self: &Arc<Self>, receipt: crate::commands::CommandSendReceipt) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            producer_id = %receipt.producer_id,
            sequence_id = receipt.sequence_id,
            message_id = %receipt.message_id,
            "Got receipt for producer"
        );
        let producer = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.producers.get(&receipt.producer_id.0).cloned()
        };
        match producer.and_then(|weak| weak.upgrade()) {
            Some(producer) => {
                if !producer.ack_received(receipt.sequence_id, receipt.message_id) {
                    // The producer lost track of this sequence; force a
                    // reconnect so it can resynchronize.
                    self.close(Error::Disconnected);
                }
            }
            None => {
                tracing::error!(
                    cnx = %self.cnx_string(),
                    producer_id = %receipt.producer_id,
                    sequence_id = receipt.sequence_id,
                    "Got invalid producer id in SEND_RECEIPT"
                );
            }
        }
    }

    fn handle_send_error(self: &Arc<Self>, error: crate::commands::CommandSendError) {
        tracing::warn!(
            cnx = %self.cnx_string(),
            producer_id = %error.producer_id,
            sequence_id = error.sequence_id,
            message = %error.message,
            "Received send error from server"
        );
        if error.error == ServerError::ChecksumError {
            let producer = {
                let registry = self.registry.lock().expect("registry lock poisoned");
                registry.producers.get(&error.producer_id.0).cloned()
            };
            if let Some(producer) = producer.and_then(|weak| weak.upgrade()) {
                if !producer.remove_corrupt_message(error.sequence_id) {
                    self.close(Error::Disconnected);
                }
            }
        } else {
            // Any other send error leaves the stream in an unknown state;
            // force a resync.
            self.close(Error::Disconnected);
        }
    }

    fn handle_success(self: &Arc<Self>, success: crate::commands::CommandSuccess) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            request_id = %success.request_id,
            "Received success response from server"
        );
        let pending = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_requests.remove(&success.request_id.0)
        };
        if let Some(pending) = pending {
            let _ = pending.sender.send(Ok(ResponseData::default()));
        }
    }

    fn handle_error(self: &Arc<Self>, error: crate::commands::CommandError) {
        let result = Error::from_server_error(error.error, &error.message);
        tracing::warn!(
            cnx = %self.cnx_string(),
            request_id = %error.request_id,
            message = %error.message,
            %result,
            "Received error response from server"
        );

        let request_id = error.request_id.0;
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if let Some(pending) = registry.pending_requests.remove(&request_id) {
            drop(registry);
            let _ = pending.sender.send(Err(result));
        } else if let Some(sender) = registry.pending_last_message_id.remove(&request_id) {
            drop(registry);
            let _ = sender.send(Err(result));
        } else if let Some(sender) = registry.pending_namespace_topics.remove(&request_id) {
            drop(registry);
            let _ = sender.send(Err(result));
        }
    }

    fn handle_producer_success(self: &Arc<Self>, success: crate::commands::CommandProducerSuccess) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            request_id = %success.request_id,
            producer_name = %success.producer_name,
            producer_ready = success.producer_ready,
            "Received producer success from server"
        );
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if !success.producer_ready {
            // Two-phase reply: the producer is queued behind an exclusive
            // slot. Mark the intermediate so the timeout stands down; the
            // future completes on the final reply.
            if let Some(pending) = registry.pending_requests.get(&success.request_id.0) {
                tracing::info!(
                    cnx = %self.cnx_string(),
                    request_id = %success.request_id,
                    producer_name = %success.producer_name,
                    "Producer has been queued up at broker"
                );
                pending.has_got_response.store(true, Ordering::Release);
            }
            return;
        }
        let pending = registry.pending_requests.remove(&success.request_id.0);
        drop(registry);
        if let Some(pending) = pending {
            let _ = pending.sender.send(Ok(ResponseData {
                producer_name: success.producer_name,
                last_sequence_id: success.last_sequence_id,
                schema_version: success.schema_version,
                topic_epoch: success.topic_epoch,
            }));
        }
    }

    /// Broker errors that indicate this broker should be abandoned: fail
    /// the request, then drop the connection so handles reconnect
    /// elsewhere.
    fn check_server_error(self: &Arc<Self>, error: ServerError) {
        match error {
            ServerError::ServiceNotReady | ServerError::TooManyRequests => {
                self.close(Error::Disconnected);
            }
            _ => {}
        }
    }

    fn take_lookup_sender(
        &self,
        request_id: RequestId,
    ) -> Option<oneshot::Sender<Result<LookupOutcome>>> {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let sender = registry.pending_lookups.remove(&request_id.0);
        if sender.is_some() {
            registry.num_pending_lookups -= 1;
        }
        sender
    }

    fn handle_lookup_response(self: &Arc<Self>, response: crate::commands::CommandLookupResponse) {
        let Some(sender) = self.take_lookup_sender(response.request_id) else {
            tracing::warn!(
                request_id = %response.request_id,
                "Received unknown request id from server"
            );
            return;
        };

        let failed = matches!(response.response, None | Some(LookupResponseType::Failed));
        if failed {
            let outcome = match response.error {
                Some(error) => {
                    tracing::error!(
                        cnx = %self.cnx_string(),
                        request_id = %response.request_id,
                        message = response.message.as_deref().unwrap_or(""),
                        "Failed lookup"
                    );
                    self.check_server_error(error);
                    Err(Error::from_server_error(
                        error,
                        response.message.as_deref().unwrap_or(""),
                    ))
                }
                None => {
                    tracing::error!(
                        cnx = %self.cnx_string(),
                        request_id = %response.request_id,
                        "Failed lookup with empty response"
                    );
                    Err(Error::ConnectError)
                }
            };
            let _ = sender.send(outcome);
            return;
        }

        let broker_url = if self.is_tls {
            response.broker_service_url_tls.clone().unwrap_or_default()
        } else {
            response.broker_service_url.clone().unwrap_or_default()
        };
        let _ = sender.send(Ok(LookupOutcome::Broker(LookupResult {
            broker_url,
            broker_url_tls: response.broker_service_url_tls.unwrap_or_default(),
            authoritative: response.authoritative,
            redirect: response.response == Some(LookupResponseType::Redirect),
            proxy_through_service_url: response.proxy_through_service_url,
        })));
    }

    fn handle_partitioned_metadata_response(
        self: &Arc<Self>,
        response: crate::commands::CommandPartitionedMetadataResponse,
    ) {
        let Some(sender) = self.take_lookup_sender(response.request_id) else {
            tracing::warn!(
                request_id = %response.request_id,
                "Received unknown request id from server"
            );
            return;
        };

        let failed = matches!(
            response.response,
            None | Some(PartitionedMetadataResponseType::Failed)
        );
        if failed {
            let outcome = match response.error {
                Some(error) => {
                    tracing::error!(
                        cnx = %self.cnx_string(),
                        request_id = %response.request_id,
                        message = response.message.as_deref().unwrap_or(""),
                        "Failed partition-metadata lookup"
                    );
                    self.check_server_error(error);
                    Err(Error::from_server_error(
                        error,
                        response.message.as_deref().unwrap_or(""),
                    ))
                }
                None => Err(Error::ConnectError),
            };
            let _ = sender.send(outcome);
            return;
        }

        let _ = sender.send(Ok(LookupOutcome::Partitions(response.partitions)));
    }

    fn handle_close_producer(self: &Arc<Self>, close: crate::commands::CommandCloseProducer) {
        tracing::debug!(
            producer_id = %close.producer_id,
            "Broker notification of closed producer"
        );
        let producer = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.producers.remove(&close.producer_id.0)
        };
        match producer.and_then(|weak| weak.upgrade()) {
            Some(producer) => producer.disconnect_producer(),
            None => {
                tracing::error!(
                    cnx = %self.cnx_string(),
                    producer_id = %close.producer_id,
                    "Got invalid producer id in CLOSE_PRODUCER"
                );
            }
        }
    }

    fn handle_close_consumer(self: &Arc<Self>, close: crate::commands::CommandCloseConsumer) {
        tracing::debug!(
            consumer_id = %close.consumer_id,
            "Broker notification of closed consumer"
        );
        let consumer = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.consumers.remove(&close.consumer_id.0)
        };
        match consumer.and_then(|weak| weak.upgrade()) {
            Some(consumer) => consumer.disconnect_consumer(),
            None => {
                tracing::error!(
                    cnx = %self.cnx_string(),
                    consumer_id = %close.consumer_id,
                    "Got invalid consumer id in CLOSE_CONSUMER"
                );
            }
        }
    }

    fn handle_auth_challenge(self: &Arc<Self>, challenge: crate::commands::CommandAuthChallenge) {
        tracing::debug!(cnx = %self.cnx_string(), "Received auth challenge from broker");
        let connection = self.clone();
        tokio::spawn(async move {
            match connection.auth.authenticate(challenge.challenge).await {
                Ok(auth_data) => {
                    // Fire and forget: a failed write surfaces through the
                    // writer task closing the connection.
                    connection.send_command(BaseCommand::AuthResponse(CommandAuthResponse {
                        client_version: connection.client_version.clone(),
                        auth_method_name: Some(
                            connection.auth.auth_method_name().to_string(),
                        ),
                        auth_data,
                        protocol_version: CURRENT_PROTOCOL_VERSION,
                    }));
                }
                Err(error) => {
                    tracing::error!(
                        cnx = %connection.cnx_string(),
                        %error,
                        "Failed to compute auth challenge response"
                    );
                    connection.close(Error::AuthenticationError);
                }
            }
        });
    }

    fn handle_active_consumer_change(
        self: &Arc<Self>,
        change: crate::commands::CommandActiveConsumerChange,
    ) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            consumer_id = %change.consumer_id,
            is_active = change.is_active,
            "Received notification about active consumer change"
        );
        let consumer = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            match registry.consumers.get(&change.consumer_id.0) {
                Some(weak) => match weak.upgrade() {
                    Some(consumer) => Some(consumer),
                    None => {
                        registry.consumers.remove(&change.consumer_id.0);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(consumer) = consumer {
            consumer.active_consumer_changed(change.is_active);
        }
    }

    fn handle_incoming_message(
        self: &Arc<Self>,
        message: CommandMessage,
        payload: Option<codec::MessagePayload>,
    ) {
        tracing::debug!(
            cnx = %self.cnx_string(),
            consumer_id = %message.consumer_id,
            "Received a message from the server"
        );
        let Some(payload) = payload else {
            tracing::error!(cnx = %self.cnx_string(), "MESSAGE frame without payload region");
            self.close(Error::Disconnected);
            return;
        };
        let consumer = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            match registry.consumers.get(&message.consumer_id.0) {
                Some(weak) => match weak.upgrade() {
                    Some(consumer) => Some(consumer),
                    None => {
                        registry.consumers.remove(&message.consumer_id.0);
                        tracing::debug!(
                            consumer_id = %message.consumer_id,
                            "Ignoring incoming message for already destroyed consumer"
                        );
                        None
                    }
                },
                None => {
                    tracing::debug!(
                        consumer_id = %message.consumer_id,
                        "Got invalid consumer id for incoming message"
                    );
                    None
                }
            }
        };
        if let Some(consumer) = consumer {
            consumer.message_received(
                self,
                message,
                payload.checksum_valid,
                payload.broker_metadata,
                payload.metadata,
                payload.payload,
            );
        }
    }

    fn handle_get_last_message_id_response(
        self: &Arc<Self>,
        response: crate::commands::CommandGetLastMessageIdResponse,
    ) {
        let sender = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_last_message_id.remove(&response.request_id.0)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(LastMessageIdResult {
                    last_message_id: response.last_message_id,
                    mark_delete_position: response.consumer_mark_delete_position,
                }));
            }
            None => {
                tracing::warn!(
                    request_id = %response.request_id,
                    "GET_LAST_MESSAGE_ID_RESPONSE with unknown request id"
                );
            }
        }
    }

    fn handle_get_topics_of_namespace_response(
        self: &Arc<Self>,
        response: crate::commands::CommandGetTopicsOfNamespaceResponse,
    ) {
        let sender = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_namespace_topics.remove(&response.request_id.0)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(dedup_partitioned_topics(response.topics)));
            }
            None => {
                tracing::warn!(
                    request_id = %response.request_id,
                    "GET_TOPICS_OF_NAMESPACE_RESPONSE with unknown request id"
                );
            }
        }
    }

    fn handle_get_schema_response(
        self: &Arc<Self>,
        response: crate::commands::CommandGetSchemaResponse,
    ) {
        let sender = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_get_schema.remove(&response.request_id.0)
        };
        let Some(sender) = sender else {
            tracing::warn!(
                request_id = %response.request_id,
                "GET_SCHEMA_RESPONSE with unknown request id"
            );
            return;
        };

        if let Some(error) = response.error_code {
            let result = Error::from_server_error(
                error,
                response.error_message.as_deref().unwrap_or(""),
            );
            if error != ServerError::TopicNotFound {
                tracing::warn!(
                    cnx = %self.cnx_string(),
                    request_id = %response.request_id,
                    %result,
                    "Received error GET_SCHEMA_RESPONSE from server"
                );
            }
            let _ = sender.send(Err(result));
            return;
        }
        let _ = sender.send(Ok(response.schema.unwrap_or_default()));
    }

    fn handle_consumer_stats_response(
        self: &Arc<Self>,
        response: crate::commands::CommandConsumerStatsResponse,
    ) {
        let sender = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_consumer_stats.remove(&response.request_id.0)
        };
        let Some(sender) = sender else {
            tracing::warn!(
                request_id = %response.request_id,
                "CONSUMER_STATS_RESPONSE with unknown request id"
            );
            return;
        };

        if let Some(error) = response.error_code {
            if let Some(message) = &response.error_message {
                tracing::error!(
                    cnx = %self.cnx_string(),
                    message = %message,
                    "Failed to get consumer stats"
                );
            }
            let _ = sender.send(Err(Error::from_server_error(
                error,
                response.error_message.as_deref().unwrap_or(""),
            )));
            return;
        }
        let _ = sender.send(Ok(BrokerConsumerStats {
            msg_rate_out: response.msg_rate_out,
            msg_throughput_out: response.msg_throughput_out,
            msg_rate_redeliver: response.msg_rate_redeliver,
            consumer_name: response.consumer_name,
            available_permits: response.available_permits,
            unacked_messages: response.unacked_messages,
            blocked_consumer_on_unacked_msgs: response.blocked_consumer_on_unacked_msgs,
            address: response.address,
            connected_since: response.connected_since,
            consumer_type: response.consumer_type,
            msg_rate_expired: response.msg_rate_expired,
            msg_backlog: response.msg_backlog,
        }));
    }

    fn handle_ack_response(self: &Arc<Self>, response: crate::commands::CommandAckResponse) {
        let pending = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.pending_requests.remove(&response.request_id.0)
        };
        let Some(pending) = pending else {
            tracing::warn!(
                request_id = %response.request_id,
                "Cannot find the cached request for ACK_RESPONSE"
            );
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(Error::from_server_error(error, "")),
            None => Ok(ResponseData::default()),
        };
        let _ = pending.sender.send(outcome);
    }
}

/// Strip `-partition-<n>` suffixes and deduplicate, preserving first-seen
/// order.
fn dedup_partitioned_topics(topics: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::with_capacity(topics.len());
    for topic in topics {
        let base = match topic.find(PARTITION_SUFFIX) {
            Some(position) => topic[..position].to_string(),
            None => topic,
        };
        if seen.insert(base.clone()) {
            result.push(base);
        }
    }
    result
}

// =============================================================================
// Background tasks
// =============================================================================

async fn run_reader(
    connection: std::sync::Weak<ClientConnection>,
    mut read_half: ReadHalf<BrokerStream>,
    mut frame_reader: FrameReader,
) {
    loop {
        match frame_reader.next_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                match codec::decode_frame(frame) {
                    Ok(decoded) => connection.handle_frame(decoded),
                    Err(error) => {
                        tracing::error!(
                            cnx = %connection.cnx_string(),
                            %error,
                            "Error decoding incoming frame"
                        );
                        connection.close(Error::Disconnected);
                        return;
                    }
                }
            }
            Ok(None) => {
                if let Some(connection) = connection.upgrade() {
                    tracing::debug!(cnx = %connection.cnx_string(), "Server closed the connection");
                    connection.close(Error::Disconnected);
                }
                return;
            }
            Err(error) => {
                if let Some(connection) = connection.upgrade() {
                    tracing::debug!(cnx = %connection.cnx_string(), %error, "Read loop terminated");
                    connection.close(Error::Disconnected);
                }
                return;
            }
        }
    }
}

async fn run_writer(
    connection: std::sync::Weak<ClientConnection>,
    mut write_half: WriteHalf<BrokerStream>,
    mut writer_rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = writer_rx.recv().await {
        let result = match op {
            WriteOp::Command(frame) => match write_half.write_all(&frame).await {
                Ok(()) => write_half.flush().await,
                Err(error) => Err(error),
            },
            WriteOp::Send(args) => {
                // The checksum policy depends on the negotiated protocol
                // version, so it is read per write.
                let checksum = match connection.upgrade() {
                    Some(connection) => connection.checksum_type(),
                    None => return,
                };
                let command = BaseCommand::Send(CommandSend {
                    producer_id: args.producer_id,
                    sequence_id: args.sequence_id,
                    num_messages: args.num_messages,
                });
                match codec::encode_send(&command, &args.metadata, &args.payload, checksum) {
                    Ok(frame) => {
                        match write_half.write_all(&frame.header).await {
                            Ok(()) => match write_half.write_all(&frame.packet).await {
                                Ok(()) => write_half.flush().await,
                                Err(error) => Err(error),
                            },
                            Err(error) => Err(error),
                        }
                    }
                    Err(error) => {
                        tracing::error!(%error, "Failed to encode send frame");
                        continue;
                    }
                }
            }
        };
        if let Err(error) = result {
            if let Some(connection) = connection.upgrade() {
                tracing::warn!(
                    cnx = %connection.cnx_string(),
                    %error,
                    "Could not send message on connection"
                );
                connection.close(Error::Disconnected);
            }
            return;
        }
    }
}

async fn run_keep_alive(connection: std::sync::Weak<ClientConnection>) {
    let period = Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS);
    loop {
        tokio::time::sleep(period).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if connection.is_closed() {
            return;
        }
        if connection.have_pending_ping.load(Ordering::Acquire) {
            tracing::warn!(
                cnx = %connection.cnx_string(),
                "Forcing connection to close after keep-alive timeout"
            );
            connection.close(Error::Disconnected);
            return;
        }
        tracing::debug!(cnx = %connection.cnx_string(), "Sending ping message");
        connection.have_pending_ping.store(true, Ordering::Release);
        connection.send_command(BaseCommand::Ping);
    }
}

/// Bulk timeout sweep for consumer-stats requests: every operation-timeout
/// period, requests that were already pending on the previous sweep are
/// failed with `Timeout`.
async fn run_consumer_stats_sweep(
    connection: std::sync::Weak<ClientConnection>,
    operation_timeout: Duration,
) {
    let mut previous: Vec<u64> = Vec::new();
    loop {
        tokio::time::sleep(operation_timeout).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if connection.is_closed() {
            return;
        }
        let expired: Vec<_> = {
            let mut registry = connection.registry.lock().expect("registry lock poisoned");
            let expired = previous
                .iter()
                .filter_map(|id| registry.pending_consumer_stats.remove(id))
                .collect();
            previous = registry.pending_consumer_stats.keys().copied().collect();
            expired
        };
        for sender in expired {
            tracing::warn!(
                cnx = %connection.cnx_string(),
                "Consumer stats request timed out, didn't get response from broker"
            );
            let _ = sender.send(Err(Error::Timeout));
        }
    }
}
