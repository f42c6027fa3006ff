//! # Pulsaresque
//! Rust-native Pulsar protocol client connection core.
//!
//! This crate implements the client side of the Pulsar binary protocol:
//! the single multiplexed TCP/TLS connection that carries many logical
//! producers and consumers against one broker, the reconnection state
//! machine shared by all handles, and the producer send pipeline with
//! batching, chunking, compression, encryption and timeout-based failure.
//! This is pure Rust all the way down; meaning memory safety, safe
//! concurrency, low resource usage, and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Provide a faithful implementation of the Pulsar client protocol
//! - Be a building block for Pulsar-compatible clients
//!
//! ## Getting started
//! Install `pulsaresque` to your rust project with `cargo add pulsaresque`
//! or include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! pulsaresque = "0.1"
//! ```
//!
//! ### Publishing messages
//! A [`Producer`](producer::Producer) needs a
//! [`ConnectionPool`](handler::ConnectionPool) that hands out broker
//! connections for a topic. The pool is where lookup orchestration
//! plugs in; the simplest possible pool dials a fixed broker:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use pulsaresque::memory::MemoryLimitController;
//! use pulsaresque::prelude::*;
//!
//! struct DirectPool {
//!     config: ClientConfiguration,
//! }
//!
//! #[async_trait]
//! impl ConnectionPool for DirectPool {
//!     async fn get_connection(&self, _topic: &str) -> Result<Arc<ClientConnection>> {
//!         ClientConnection::connect(
//!             "pulsar://localhost:6650",
//!             "pulsar://localhost:6650",
//!             &self.config,
//!             Arc::new(AuthNone),
//!             "pulsaresque-0.1.0",
//!         )
//!         .await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ClientConfiguration::default();
//!     let pool = Arc::new(DirectPool {
//!         config: config.clone(),
//!     });
//!     let memory = Arc::new(MemoryLimitController::new(64 * 1024 * 1024));
//!
//!     let producer = Producer::create(
//!         pool,
//!         "persistent://public/default/demo",
//!         ProducerId(1),
//!         ProducerConfiguration::default(),
//!         &config,
//!         memory,
//!     )
//!     .await?;
//!
//!     let receipt = producer.send(Message::new("hello")).await?;
//!     println!("published at {}", receipt.message_id());
//!     producer.close().await
//! }
//! ```
//!
//! ## Resources
//! - [Pulsar Binary Protocol Spec](https://pulsar.apache.org/docs/developing-binary-protocol/)

#![forbid(unsafe_code)]

pub mod auth;
pub mod codec;
pub mod commands;
pub mod compression;
pub mod config;
pub mod connection;
pub mod constants;
pub mod crypto;
mod encode;
pub mod error;
pub mod handler;
pub mod memory;
mod parser;
pub mod producer;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for client construction.

    pub use crate::auth::{AuthNone, AuthToken, Authenticator};
    pub use crate::codec::ChecksumType;
    pub use crate::config::{BatchingType, ClientConfiguration, ProducerConfiguration};
    pub use crate::connection::{
        BrokerConsumerStats, ClientConnection, ConsumerListener, LastMessageIdResult,
        LookupResult, ProducerListener, ResponseData,
    };
    pub use crate::error::{Error, Result, ServerError};
    pub use crate::handler::{ConnectionPool, HandlerState};
    pub use crate::producer::pending::{PublishedId, SendCallback};
    pub use crate::producer::{Message, Producer};
    pub use crate::types::{ChunkMessageId, ConsumerId, MessageId, ProducerId, RequestId};

    pub use bytes;
}
