//! The reconnection state machine shared by producer and consumer handles.
//!
//! A handle owns a [`HandlerBase`] and implements [`ReconnectableHandler`];
//! the free functions in this module drive the shared lifecycle: `start`
//! CASes `NotStarted → Pending` and grabs a connection, disconnections
//! re-enter the machine, and failed attempts back off exponentially with
//! jitter. An epoch counter increments on every reconnection attempt so
//! stale callbacks can be detected by the broker.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};

use crate::connection::ClientConnection;
use crate::constants::BACKOFF_SEND_TIMEOUT_SLACK_MS;
use crate::error::{Error, Result};

/// Lifecycle states of a producer/consumer handle.
///
/// `Closed` is terminal: reconnection attempts cease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    NotStarted = 0,
    Pending = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
    ProducerFenced = 5,
    Failed = 6,
}

impl HandlerState {
    fn from_u8(value: u8) -> HandlerState {
        match value {
            0 => HandlerState::NotStarted,
            1 => HandlerState::Pending,
            2 => HandlerState::Ready,
            3 => HandlerState::Closing,
            5 => HandlerState::ProducerFenced,
            6 => HandlerState::Failed,
            _ => HandlerState::Closed,
        }
    }
}

/// Hands out connections for a topic. Implemented by the client's
/// connection pool; handles only consume it.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn get_connection(&self, topic: &str) -> Result<Arc<ClientConnection>>;
}

/// Exponential backoff with jitter for reconnection scheduling.
///
/// The ceiling is the smaller of the configured maximum and the send
/// timeout less a fixed slack, so reconnection gets a chance to resend
/// pending messages before they expire.
pub struct ReconnectBackoff {
    builder: ExponentialBuilder,
    current: Box<dyn Iterator<Item = Duration> + Send>,
    ceiling: Duration,
}

impl ReconnectBackoff {
    /// `send_timeout` of zero means no send timer; only `max_backoff`
    /// caps the delay then.
    pub fn new(initial_backoff: Duration, max_backoff: Duration, send_timeout: Duration) -> Self {
        let slack = Duration::from_millis(BACKOFF_SEND_TIMEOUT_SLACK_MS);
        let ceiling = if send_timeout.is_zero() {
            max_backoff
        } else {
            max_backoff.min(send_timeout.saturating_sub(slack).max(slack))
        };
        let builder = ExponentialBuilder::default()
            .with_min_delay(initial_backoff)
            .with_max_delay(ceiling)
            .with_jitter()
            .without_max_times();
        ReconnectBackoff {
            builder,
            current: Box::new(builder.clone().build()),
            ceiling,
        }
    }

    /// Next delay to wait before reconnecting.
    pub fn next(&mut self) -> Duration {
        self.current.next().unwrap_or(self.ceiling)
    }

    /// Restart from the initial delay; called once a connection is
    /// successfully (re)established.
    pub fn reset(&mut self) {
        self.current = Box::new(self.builder.clone().build());
    }
}

/// State shared by every reconnecting handle.
pub struct HandlerBase {
    topic: String,
    state: AtomicU8,
    epoch: AtomicU64,
    reconnection_pending: AtomicBool,
    connection: Mutex<Weak<ClientConnection>>,
    backoff: Mutex<ReconnectBackoff>,
    operation_timeout: Duration,
    creation_timestamp: Instant,
    pool: Arc<dyn ConnectionPool>,
}

impl HandlerBase {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        topic: impl Into<String>,
        backoff: ReconnectBackoff,
        operation_timeout: Duration,
    ) -> Self {
        HandlerBase {
            topic: topic.into(),
            state: AtomicU8::new(HandlerState::NotStarted as u8),
            epoch: AtomicU64::new(0),
            reconnection_pending: AtomicBool::new(false),
            connection: Mutex::new(Weak::new()),
            backoff: Mutex::new(backoff),
            operation_timeout,
            creation_timestamp: Instant::now(),
            pool,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically transition `expected → next`; returns whether the swap
    /// happened.
    pub fn compare_and_set_state(&self, expected: HandlerState, next: HandlerState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reconnection attempts so far; stamped on create requests so the
    /// broker can fence stale attempts.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The currently bound connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<ClientConnection>> {
        self.connection
            .lock()
            .expect("connection lock poisoned")
            .upgrade()
    }

    pub fn reset_backoff(&self) {
        self.backoff.lock().expect("backoff lock poisoned").reset();
    }

    fn next_backoff_delay(&self) -> Duration {
        self.backoff.lock().expect("backoff lock poisoned").next()
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn creation_timestamp(&self) -> Instant {
        self.creation_timestamp
    }

    /// A retryable failure that has been going on longer than the
    /// operation timeout becomes a timeout.
    pub fn convert_to_timeout_if_necessary(&self, result: Error, start: Instant) -> Error {
        if result.is_retryable() && start.elapsed() >= self.operation_timeout {
            Error::Timeout
        } else {
            result
        }
    }
}

/// The subclass surface of the reconnection machine: what producers and
/// consumers plug into [`HandlerBase`].
#[async_trait]
pub trait ReconnectableHandler: Send + Sync + 'static {
    fn handler_base(&self) -> &HandlerBase;

    /// Log prefix identifying this handle.
    fn handler_name(&self) -> String;

    /// A connection was obtained from the pool; send the create/subscribe
    /// request and bind on success.
    async fn connection_opened(self: Arc<Self>, connection: Arc<ClientConnection>);

    /// The pool could not produce a connection.
    fn connection_failed(&self, result: Error);

    /// The handle is about to bind a different connection; deregister from
    /// the previous one.
    fn before_connection_change(&self, connection: &Arc<ClientConnection>);
}

/// Start the handle: `NotStarted → Pending`, then grab a connection.
pub fn start<H: ReconnectableHandler>(handler: &Arc<H>) {
    // Guard against concurrent state changes such as closing.
    if handler
        .handler_base()
        .compare_and_set_state(HandlerState::NotStarted, HandlerState::Pending)
    {
        grab_cnx(handler);
    }
}

/// Bind `connection` as the handle's current connection, deregistering
/// from the previous one first.
pub fn set_connection<H: ReconnectableHandler>(
    handler: &Arc<H>,
    connection: &Arc<ClientConnection>,
) {
    let base = handler.handler_base();
    let mut guard = base.connection.lock().expect("connection lock poisoned");
    if let Some(previous) = guard.upgrade() {
        handler.before_connection_change(&previous);
    }
    *guard = Arc::downgrade(connection);
}

/// Drop the bound connection, deregistering from it.
pub fn reset_connection<H: ReconnectableHandler>(handler: &Arc<H>) {
    let base = handler.handler_base();
    let mut guard = base.connection.lock().expect("connection lock poisoned");
    if let Some(previous) = guard.upgrade() {
        handler.before_connection_change(&previous);
    }
    *guard = Weak::new();
}

/// Ask the pool for a connection and hand it to the subclass. No-op when
/// already connected or when an attempt is already in flight.
pub fn grab_cnx<H: ReconnectableHandler>(handler: &Arc<H>) {
    let base = handler.handler_base();
    if base.connection().is_some() {
        tracing::info!(
            handler = %handler.handler_name(),
            "Ignoring reconnection request since we're already connected"
        );
        return;
    }
    if base
        .reconnection_pending
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::debug!(
            handler = %handler.handler_name(),
            "Ignoring reconnection attempt since there's already a pending reconnection"
        );
        return;
    }

    tracing::info!(handler = %handler.handler_name(), "Getting connection from pool");
    let handler = handler.clone();
    tokio::spawn(async move {
        let base = handler.handler_base();
        let result = base.pool.get_connection(base.topic()).await;
        base.reconnection_pending.store(false, Ordering::Release);
        match result {
            Ok(connection) => {
                tracing::debug!(
                    handler = %handler.handler_name(),
                    cnx = %connection.cnx_string(),
                    "Connected to broker"
                );
                handler.clone().connection_opened(connection).await;
            }
            Err(error) => {
                handler.connection_failed(error);
                schedule_reconnection(&handler);
            }
        }
    });
}

/// React to the bound connection closing.
///
/// Events for a connection other than the currently bound one are late
/// notifications and ignored. `Retryable` always reconnects; other
/// results reconnect only while the handle is `Pending` or `Ready`.
pub fn handle_disconnection<H: ReconnectableHandler>(
    handler: &Arc<H>,
    result: Error,
    connection: &Arc<ClientConnection>,
) {
    let base = handler.handler_base();
    let state = base.state();

    if let Some(current) = base.connection() {
        if !Arc::ptr_eq(&current, connection) {
            tracing::warn!(
                handler = %handler.handler_name(),
                "Ignoring connection closed since we are already attached to a newer connection"
            );
            return;
        }
    }

    reset_connection(handler);

    if result.is_retryable() {
        schedule_reconnection(handler);
        return;
    }

    match state {
        HandlerState::Pending | HandlerState::Ready => schedule_reconnection(handler),
        _ => {
            tracing::debug!(
                handler = %handler.handler_name(),
                "Ignoring connection closed event since the handler is not used anymore"
            );
        }
    }
}

/// Arm the backoff timer; when it fires the epoch increments and a new
/// connection attempt starts. Cancellation is cooperative: a handle that
/// left `Pending`/`Ready` in the meantime is simply not reconnected.
pub fn schedule_reconnection<H: ReconnectableHandler>(handler: &Arc<H>) {
    let base = handler.handler_base();
    let state = base.state();
    if state != HandlerState::Pending && state != HandlerState::Ready {
        return;
    }

    let delay = base.next_backoff_delay();
    tracing::info!(
        handler = %handler.handler_name(),
        delay_ms = delay.as_millis() as u64,
        "Schedule reconnection"
    );
    let handler = handler.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let base = handler.handler_base();
        let state = base.state();
        if state == HandlerState::Pending || state == HandlerState::Ready {
            base.epoch.fetch_add(1, Ordering::AcqRel);
            grab_cnx(&handler);
        }
    });
}
