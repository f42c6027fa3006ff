//! Shared test infrastructure: a scriptable in-process broker speaking
//! the wire protocol over real TCP sockets.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pulsaresque::auth::AuthNone;
use pulsaresque::codec::{decode_frame, encode_command, DecodedFrame};
use pulsaresque::commands::{BaseCommand, CommandConnect, CommandConnected};
use pulsaresque::config::ClientConfiguration;
use pulsaresque::connection::ClientConnection;
use pulsaresque::error::Result;
use pulsaresque::handler::ConnectionPool;

pub const CLIENT_VERSION: &str = "pulsaresque-test";

/// A TCP listener acting as the broker side of the protocol.
pub struct MockBroker {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl MockBroker {
    pub async fn start() -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("local addr");
        MockBroker { listener, addr }
    }

    pub fn service_url(&self) -> String {
        format!("pulsar://127.0.0.1:{}", self.addr.port())
    }

    /// Accept one connection without touching the protocol.
    pub async fn accept_raw(&self) -> BrokerSession {
        let (stream, _) = self.listener.accept().await.expect("accept");
        BrokerSession {
            stream,
            buffer: BytesMut::new(),
        }
    }

    /// Accept one connection and complete the CONNECT/CONNECTED handshake
    /// with default settings.
    pub async fn accept(&self) -> BrokerSession {
        self.accept_with(None, 19).await
    }

    /// Accept and handshake, optionally advertising a max message size.
    pub async fn accept_with(
        &self,
        max_message_size: Option<i32>,
        protocol_version: i32,
    ) -> BrokerSession {
        let mut session = self.accept_raw().await;
        let connect = session.expect_connect().await;
        assert!(!connect.client_version.is_empty());
        session
            .send(&BaseCommand::Connected(CommandConnected {
                server_version: Some("mock-broker-1.0".to_string()),
                protocol_version,
                max_message_size,
            }))
            .await;
        session
    }
}

/// One accepted broker-side connection.
pub struct BrokerSession {
    stream: TcpStream,
    buffer: BytesMut,
}

impl BrokerSession {
    /// Read and decode the next frame from the client.
    pub async fn read_frame(&mut self) -> DecodedFrame {
        loop {
            if self.buffer.len() >= 4 {
                let total = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if self.buffer.len() >= 4 + total {
                    let _ = self.buffer.split_to(4);
                    let frame = self.buffer.split_to(total).freeze();
                    return decode_frame(frame).expect("decode client frame");
                }
            }
            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .expect("read from client");
            assert!(read > 0, "client closed the connection mid-frame");
        }
    }

    /// Read frames until one matches `predicate`, answering PINGs along
    /// the way.
    pub async fn read_until(
        &mut self,
        mut predicate: impl FnMut(&DecodedFrame) -> bool,
    ) -> DecodedFrame {
        loop {
            let frame = self.read_frame().await;
            if let BaseCommand::Ping = frame.command {
                self.send(&BaseCommand::Pong).await;
                continue;
            }
            if predicate(&frame) {
                return frame;
            }
        }
    }

    pub async fn expect_connect(&mut self) -> CommandConnect {
        match self.read_frame().await.command {
            BaseCommand::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    /// Encode and write one command frame to the client.
    pub async fn send(&mut self, command: &BaseCommand) {
        let frame = encode_command(command).expect("encode broker frame");
        self.stream.write_all(&frame).await.expect("write to client");
        self.stream.flush().await.expect("flush to client");
    }

    /// Write raw bytes, for fragmented/corrupted wire images.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
        self.stream.flush().await.expect("flush raw");
    }

    /// Drop the connection.
    pub fn shutdown(self) {
        drop(self.stream);
    }
}

/// Connect a client to the broker while the broker side handshakes.
pub async fn connect_pair(
    broker: &MockBroker,
    config: &ClientConfiguration,
) -> (Arc<ClientConnection>, BrokerSession) {
    connect_pair_with(broker, config, None, 19).await
}

pub async fn connect_pair_with(
    broker: &MockBroker,
    config: &ClientConfiguration,
    max_message_size: Option<i32>,
    protocol_version: i32,
) -> (Arc<ClientConnection>, BrokerSession) {
    let url = broker.service_url();
    let config = config.clone();
    let client = tokio::spawn(async move {
        ClientConnection::connect(&url, &url, &config, Arc::new(AuthNone), CLIENT_VERSION).await
    });
    let session = broker.accept_with(max_message_size, protocol_version).await;
    let connection = client
        .await
        .expect("client task")
        .expect("connection established");
    (connection, session)
}

/// A pool that dials the given broker URL on every request.
pub struct TestPool {
    pub url: String,
    pub config: ClientConfiguration,
}

#[async_trait]
impl ConnectionPool for TestPool {
    async fn get_connection(&self, _topic: &str) -> Result<Arc<ClientConnection>> {
        ClientConnection::connect(
            &self.url,
            &self.url,
            &self.config,
            Arc::new(AuthNone),
            CLIENT_VERSION,
        )
        .await
    }
}

/// Payload helper: `n` copies of a marker byte.
pub fn payload(byte: u8, len: usize) -> Bytes {
    Bytes::from(vec![byte; len])
}

/// Accept a connection, handshake, and wait for the create-producer
/// request.
pub async fn accept_producer(
    broker: &MockBroker,
    max_message_size: Option<i32>,
) -> (BrokerSession, pulsaresque::commands::CommandProducer) {
    let mut session = broker.accept_with(max_message_size, 19).await;
    let frame = session
        .read_until(|frame| matches!(frame.command, BaseCommand::Producer(_)))
        .await;
    let command = match frame.command {
        BaseCommand::Producer(command) => command,
        _ => unreachable!(),
    };
    (session, command)
}

/// Complete producer creation with a ready reply.
pub async fn reply_producer_success(
    session: &mut BrokerSession,
    request_id: pulsaresque::types::RequestId,
    producer_name: &str,
) {
    session
        .send(&BaseCommand::ProducerSuccess(
            pulsaresque::commands::CommandProducerSuccess {
                request_id,
                producer_name: producer_name.to_string(),
                last_sequence_id: -1,
                schema_version: None,
                topic_epoch: None,
                producer_ready: true,
            },
        ))
        .await;
}

/// Spawn the broker side of a producer creation: accept, handshake,
/// answer the create request, and hand the session back.
pub fn serve_producer(
    broker: &Arc<MockBroker>,
    producer_name: &'static str,
    max_message_size: Option<i32>,
) -> tokio::task::JoinHandle<BrokerSession> {
    let broker = broker.clone();
    tokio::spawn(async move {
        let (mut session, command) = accept_producer(&broker, max_message_size).await;
        reply_producer_success(&mut session, command.request_id, producer_name).await;
        session
    })
}
