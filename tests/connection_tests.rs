//! Connection lifecycle integration tests against an in-process broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use pulsaresque::auth::AuthNone;
use pulsaresque::commands::{
    BaseCommand, CommandError, CommandGetLastMessageIdResponse, CommandGetSchemaResponse,
    CommandGetTopicsOfNamespaceResponse, CommandLookupResponse, CommandProducerSuccess,
    CommandSuccess, LookupResponseType, SchemaInfo, TopicsOfNamespaceMode,
};
use pulsaresque::config::ClientConfiguration;
use pulsaresque::connection::{new_request_id, ClientConnection};
use pulsaresque::error::{Error, ServerError};
use pulsaresque::types::{ConsumerId, MessageId, RequestId};

use common::{connect_pair, MockBroker, CLIENT_VERSION};

fn test_config() -> ClientConfiguration {
    ClientConfiguration {
        operation_timeout: Duration::from_millis(500),
        connection_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn handshake_establishes_ready_connection() {
    let broker = MockBroker::start().await;
    let (connection, _session) = connect_pair(&broker, &test_config()).await;

    assert!(!connection.is_closed());
    assert_eq!(connection.server_protocol_version(), 19);
    assert!(connection.cnx_string().contains("->"));
}

#[tokio::test]
async fn invalid_scheme_fails_immediately() {
    let result = ClientConnection::connect(
        "http://localhost:8080",
        "http://localhost:8080",
        &test_config(),
        Arc::new(AuthNone),
        CLIENT_VERSION,
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::ConnectError);
}

#[tokio::test]
async fn unreachable_endpoints_are_retryable() {
    // Port 1 on loopback: resolution succeeds, the TCP connect fails.
    let config = ClientConfiguration {
        connection_timeout: Duration::from_secs(2),
        ..test_config()
    };
    let result = ClientConnection::connect(
        "pulsar://127.0.0.1:1",
        "pulsar://127.0.0.1:1",
        &config,
        Arc::new(AuthNone),
        CLIENT_VERSION,
    )
    .await;
    let error = result.unwrap_err();
    assert!(
        error == Error::Retryable || error == Error::ConnectError,
        "unexpected error {:?}",
        error
    );
}

#[tokio::test]
async fn missing_server_version_closes_the_connection() {
    let broker = MockBroker::start().await;
    let url = broker.service_url();
    let config = test_config();
    let client = tokio::spawn(async move {
        ClientConnection::connect(&url, &url, &config, Arc::new(AuthNone), CLIENT_VERSION).await
    });

    let mut session = broker.accept_raw().await;
    session.expect_connect().await;
    session
        .send(&BaseCommand::Connected(
            pulsaresque::commands::CommandConnected {
                server_version: None,
                protocol_version: 19,
                max_message_size: None,
            },
        ))
        .await;

    assert_eq!(
        client.await.unwrap().unwrap_err(),
        Error::ConnectError
    );
}

#[tokio::test]
async fn non_connected_first_command_fails_handshake() {
    let broker = MockBroker::start().await;
    let url = broker.service_url();
    let config = test_config();
    let client = tokio::spawn(async move {
        ClientConnection::connect(&url, &url, &config, Arc::new(AuthNone), CLIENT_VERSION).await
    });

    let mut session = broker.accept_raw().await;
    session.expect_connect().await;
    session.send(&BaseCommand::Ping).await;

    assert_eq!(client.await.unwrap().unwrap_err(), Error::ConnectError);
}

#[tokio::test]
async fn fragmented_handshake_still_succeeds() {
    // The CONNECTED frame arrives one byte at a time.
    let broker = MockBroker::start().await;
    let url = broker.service_url();
    let config = test_config();
    let client = tokio::spawn(async move {
        ClientConnection::connect(&url, &url, &config, Arc::new(AuthNone), CLIENT_VERSION).await
    });

    let mut session = broker.accept_raw().await;
    session.expect_connect().await;
    let frame = pulsaresque::codec::encode_command(&BaseCommand::Connected(
        pulsaresque::commands::CommandConnected {
            server_version: Some("mock".into()),
            protocol_version: 19,
            max_message_size: None,
        },
    ))
    .unwrap();
    for byte in frame.iter() {
        session.send_raw(&[*byte]).await;
        tokio::task::yield_now().await;
    }

    let connection = client.await.unwrap().unwrap();
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn request_resolves_on_success_reply() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                        producer_id: pulsaresque::types::ProducerId(1),
                        request_id,
                    }),
                    request_id,
                )
                .await
        })
    };

    let frame = session
        .read_until(|frame| matches!(frame.command, BaseCommand::CloseProducer(_)))
        .await;
    match frame.command {
        BaseCommand::CloseProducer(close) => assert_eq!(close.request_id, request_id),
        _ => unreachable!(),
    }
    session
        .send(&BaseCommand::Success(CommandSuccess { request_id }))
        .await;

    assert!(client.await.unwrap().is_ok());
}

#[tokio::test]
async fn request_fails_with_mapped_broker_error() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                        producer_id: pulsaresque::types::ProducerId(1),
                        request_id,
                    }),
                    request_id,
                )
                .await
        })
    };

    session
        .read_until(|frame| matches!(frame.command, BaseCommand::CloseProducer(_)))
        .await;
    session
        .send(&BaseCommand::Error(CommandError {
            request_id,
            error: ServerError::AuthorizationError,
            message: "denied".to_string(),
        }))
        .await;

    assert_eq!(
        client.await.unwrap().unwrap_err(),
        Error::AuthorizationError
    );
}

#[tokio::test]
async fn request_times_out_when_broker_is_silent() {
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        operation_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let (connection, _session) = connect_pair(&broker, &config).await;

    let request_id = new_request_id();
    let started = std::time::Instant::now();
    let result = connection
        .send_request_with_id(
            BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                producer_id: pulsaresque::types::ProducerId(1),
                request_id,
            }),
            request_id,
        )
        .await;
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn two_phase_producer_success_suppresses_the_timeout() {
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        operation_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (connection, mut session) = connect_pair(&broker, &config).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                        producer_id: pulsaresque::types::ProducerId(1),
                        request_id,
                    }),
                    request_id,
                )
                .await
        })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::CloseProducer(_)))
        .await;

    // Intermediate reply before the deadline: the producer is queued.
    session
        .send(&BaseCommand::ProducerSuccess(CommandProducerSuccess {
            request_id,
            producer_name: "queued".to_string(),
            last_sequence_id: -1,
            schema_version: None,
            topic_epoch: None,
            producer_ready: false,
        }))
        .await;

    // Wait past the operation timeout, then complete.
    tokio::time::sleep(Duration::from_millis(400)).await;
    session
        .send(&BaseCommand::ProducerSuccess(CommandProducerSuccess {
            request_id,
            producer_name: "ready-name".to_string(),
            last_sequence_id: 5,
            schema_version: None,
            topic_epoch: Some(2),
            producer_ready: true,
        }))
        .await;

    let response = client.await.unwrap().expect("intermediate reply must hold off the timeout");
    assert_eq!(response.producer_name, "ready-name");
    assert_eq!(response.last_sequence_id, 5);
    assert_eq!(response.topic_epoch, Some(2));
}

#[tokio::test]
async fn lookup_limit_rejects_excess_lookups_synchronously() {
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        concurrent_lookup_requests: 2,
        operation_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let (connection, mut session) = connect_pair(&broker, &config).await;

    let first_id = new_request_id();
    let second_id = new_request_id();
    let first = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.lookup_topic("t1", false, first_id).await })
    };
    let second = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.lookup_topic("t2", false, second_id).await })
    };

    // Both lookups are on the wire and pending.
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::Lookup(_)))
        .await;
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::Lookup(_)))
        .await;

    // The third lookup hits the limit without touching the wire.
    let third = connection
        .lookup_topic("t3", false, new_request_id())
        .await;
    assert_eq!(third.unwrap_err(), Error::TooManyLookupRequests);

    // Completing one frees a slot for a later lookup.
    session
        .send(&BaseCommand::LookupResponse(CommandLookupResponse {
            request_id: first_id,
            response: Some(LookupResponseType::Connect),
            broker_service_url: Some(broker.service_url()),
            broker_service_url_tls: None,
            authoritative: true,
            proxy_through_service_url: false,
            error: None,
            message: None,
        }))
        .await;
    let first_result = first.await.unwrap().unwrap();
    assert_eq!(first_result.broker_url, broker.service_url());
    assert!(first_result.authoritative);
    assert!(!first_result.redirect);

    let fourth_id = new_request_id();
    let fourth = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.lookup_topic("t4", false, fourth_id).await })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::Lookup(_)))
        .await;
    session
        .send(&BaseCommand::LookupResponse(CommandLookupResponse {
            request_id: fourth_id,
            response: Some(LookupResponseType::Redirect),
            broker_service_url: Some("pulsar://other:6650".to_string()),
            broker_service_url_tls: None,
            authoritative: false,
            proxy_through_service_url: true,
            error: None,
            message: None,
        }))
        .await;
    let fourth_result = fourth.await.unwrap().unwrap();
    assert!(fourth_result.redirect);
    assert!(fourth_result.proxy_through_service_url);

    drop(second);
}

#[tokio::test]
async fn failed_lookup_maps_broker_error() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let lookup = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.lookup_topic("t", false, request_id).await })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::Lookup(_)))
        .await;
    session
        .send(&BaseCommand::LookupResponse(CommandLookupResponse {
            request_id,
            response: Some(LookupResponseType::Failed),
            error: Some(ServerError::TopicNotFound),
            message: Some("missing".to_string()),
            ..Default::default()
        }))
        .await;

    assert_eq!(lookup.await.unwrap().unwrap_err(), Error::TopicNotFound);
}

#[tokio::test]
async fn retryable_service_not_ready_closes_the_connection() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let lookup = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.lookup_topic("t", false, request_id).await })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::Lookup(_)))
        .await;
    session
        .send(&BaseCommand::LookupResponse(CommandLookupResponse {
            request_id,
            response: Some(LookupResponseType::Failed),
            error: Some(ServerError::ServiceNotReady),
            message: Some("bundle unloading".to_string()),
            ..Default::default()
        }))
        .await;

    // The request observes the retryable mapping, and the connection is
    // dropped to force reconnection against another broker.
    assert_eq!(lookup.await.unwrap().unwrap_err(), Error::Retryable);
    timeout(Duration::from_secs(2), async {
        while !connection.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should close after ServiceNotReady");
}

#[tokio::test]
async fn ping_from_broker_is_answered_with_pong() {
    let broker = MockBroker::start().await;
    let (_connection, mut session) = connect_pair(&broker, &test_config()).await;

    session.send(&BaseCommand::Ping).await;
    let frame = session.read_frame().await;
    assert!(matches!(frame.command, BaseCommand::Pong));
}

#[tokio::test]
async fn partitioned_metadata_shares_the_lookup_registry() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.partitioned_metadata("t", request_id).await })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::PartitionedMetadata(_)))
        .await;
    session
        .send(&BaseCommand::PartitionedMetadataResponse(
            pulsaresque::commands::CommandPartitionedMetadataResponse {
                request_id,
                partitions: 8,
                response: Some(pulsaresque::commands::PartitionedMetadataResponseType::Success),
                error: None,
                message: None,
            },
        ))
        .await;

    assert_eq!(client.await.unwrap().unwrap(), 8);
}

#[tokio::test]
async fn namespace_topics_are_deduplicated() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .get_topics_of_namespace("tenant/ns", TopicsOfNamespaceMode::All, request_id)
                .await
        })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::GetTopicsOfNamespace(_)))
        .await;
    session
        .send(&BaseCommand::GetTopicsOfNamespaceResponse(
            CommandGetTopicsOfNamespaceResponse {
                request_id,
                topics: vec![
                    "persistent://tenant/ns/a-partition-0".to_string(),
                    "persistent://tenant/ns/a-partition-1".to_string(),
                    "persistent://tenant/ns/b".to_string(),
                ],
            },
        ))
        .await;

    let topics = client.await.unwrap().unwrap();
    assert_eq!(
        topics,
        vec![
            "persistent://tenant/ns/a".to_string(),
            "persistent://tenant/ns/b".to_string(),
        ]
    );
}

#[tokio::test]
async fn get_schema_round_trips() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .get_schema("persistent://tenant/ns/topic", None, request_id)
                .await
        })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::GetSchema(_)))
        .await;
    session
        .send(&BaseCommand::GetSchemaResponse(CommandGetSchemaResponse {
            request_id,
            error_code: None,
            error_message: None,
            schema: Some(SchemaInfo {
                schema_type: 4,
                data: bytes::Bytes::from_static(b"avro-def"),
                properties: vec![("owner".to_string(), "team-a".to_string())],
            }),
        }))
        .await;

    let schema = client.await.unwrap().unwrap();
    assert_eq!(schema.schema_type, 4);
    assert_eq!(schema.data.as_ref(), b"avro-def");
}

#[tokio::test]
async fn schema_and_namespace_requests_time_out_when_broker_is_silent() {
    // Every request kind carries its own deadline timer: a broker that
    // swallows these requests must not hang the caller on an otherwise
    // healthy connection.
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        operation_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let (connection, _session) = connect_pair(&broker, &config).await;

    let schema = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .get_schema("persistent://tenant/ns/topic", None, new_request_id())
                .await
        })
    };
    let topics = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .get_topics_of_namespace(
                    "tenant/ns",
                    TopicsOfNamespaceMode::All,
                    new_request_id(),
                )
                .await
        })
    };

    assert_eq!(schema.await.unwrap().unwrap_err(), Error::Timeout);
    assert_eq!(topics.await.unwrap().unwrap_err(), Error::Timeout);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn get_last_message_id_round_trips() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    let request_id = new_request_id();
    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .get_last_message_id(ConsumerId(4), request_id)
                .await
        })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::GetLastMessageId(_)))
        .await;
    session
        .send(&BaseCommand::GetLastMessageIdResponse(
            CommandGetLastMessageIdResponse {
                request_id,
                last_message_id: MessageId::new(7, 11),
                consumer_mark_delete_position: Some(MessageId::new(7, 9)),
            },
        ))
        .await;

    let result = client.await.unwrap().unwrap();
    assert_eq!(result.last_message_id, MessageId::new(7, 11));
    assert_eq!(result.mark_delete_position, Some(MessageId::new(7, 9)));
}

#[tokio::test]
async fn close_fails_outstanding_requests_and_is_idempotent() {
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        operation_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let (connection, mut session) = connect_pair(&broker, &config).await;

    let request_id = new_request_id();
    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                        producer_id: pulsaresque::types::ProducerId(1),
                        request_id,
                    }),
                    request_id,
                )
                .await
        })
    };
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::CloseProducer(_)))
        .await;

    connection.close(Error::Disconnected);
    connection.close(Error::Disconnected);
    assert!(connection.is_closed());

    // The held promise resolves exactly once, with the close reason.
    assert_eq!(pending.await.unwrap().unwrap_err(), Error::Disconnected);

    // New requests on a closed connection fail fast.
    let request_id = new_request_id();
    let late = connection
        .send_request_with_id(
            BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                producer_id: pulsaresque::types::ProducerId(1),
                request_id,
            }),
            request_id,
        )
        .await;
    assert_eq!(late.unwrap_err(), Error::NotConnected);
}

#[tokio::test]
async fn server_disconnect_closes_the_connection() {
    let broker = MockBroker::start().await;
    let (connection, session) = connect_pair(&broker, &test_config()).await;

    session.shutdown();
    timeout(Duration::from_secs(2), async {
        while !connection.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should observe the disconnect");
}

#[tokio::test]
async fn garbage_frame_closes_the_connection() {
    let broker = MockBroker::start().await;
    let (connection, mut session) = connect_pair(&broker, &test_config()).await;

    // A frame claiming an unknown command type.
    session
        .send_raw(&[0, 0, 0, 2, 0, 0, 0, 2, 0x7f, 0xff])
        .await;

    timeout(Duration::from_secs(2), async {
        while !connection.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("malformed frame should close the connection");
}

#[tokio::test]
async fn auth_challenge_gets_a_response() {
    let broker = MockBroker::start().await;
    let url = broker.service_url();
    let config = test_config();
    let client = tokio::spawn(async move {
        ClientConnection::connect(
            &url,
            &url,
            &config,
            Arc::new(pulsaresque::auth::AuthToken::new("tok-123")),
            CLIENT_VERSION,
        )
        .await
    });
    let mut session = broker.accept_raw().await;
    let connect = session.expect_connect().await;
    assert_eq!(connect.auth_method_name.as_deref(), Some("token"));
    assert_eq!(connect.auth_data, Some(Bytes::from_static(b"tok-123")));
    session
        .send(&BaseCommand::Connected(
            pulsaresque::commands::CommandConnected {
                server_version: Some("mock".into()),
                protocol_version: 19,
                max_message_size: None,
            },
        ))
        .await;
    let _connection = client.await.unwrap().unwrap();

    session
        .send(&BaseCommand::AuthChallenge(
            pulsaresque::commands::CommandAuthChallenge {
                auth_method_name: Some("token".to_string()),
                challenge: Bytes::from_static(b"nonce"),
            },
        ))
        .await;

    let frame = session
        .read_until(|frame| matches!(frame.command, BaseCommand::AuthResponse(_)))
        .await;
    match frame.command {
        BaseCommand::AuthResponse(response) => {
            assert_eq!(response.auth_data, Bytes::from_static(b"tok-123"));
            assert_eq!(response.auth_method_name.as_deref(), Some("token"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn unanswered_keep_alive_probe_kills_the_connection() {
    // Connect in real time, then let the clock run virtually: the first
    // keep-alive interval sends a PING, the second finds it unanswered
    // and declares the connection dead. Outstanding promises fail with
    // the close reason.
    let broker = MockBroker::start().await;
    let config = ClientConfiguration {
        // Keep every other timer far away from the keep-alive interval.
        operation_timeout: Duration::from_secs(3600),
        ..test_config()
    };
    let (connection, mut session) = connect_pair(&broker, &config).await;

    let request_id = new_request_id();
    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_id(
                    BaseCommand::CloseProducer(pulsaresque::commands::CommandCloseProducer {
                        producer_id: pulsaresque::types::ProducerId(1),
                        request_id,
                    }),
                    request_id,
                )
                .await
        })
    };
    // Make sure the request is registered and on the wire before time
    // starts jumping.
    session
        .read_until(|frame| matches!(frame.command, BaseCommand::CloseProducer(_)))
        .await;

    // From here on, the broker goes silent and virtual time advances
    // through the keep-alive schedule.
    tokio::time::pause();

    assert_eq!(pending.await.unwrap().unwrap_err(), Error::Disconnected);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn request_ids_are_process_unique() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        assert!(seen.insert(new_request_id()));
    }
    let _ = RequestId(0);
}
