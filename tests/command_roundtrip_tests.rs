//! Command encode/parse matrix tests.
//!
//! Every command the client can see on the wire is round-tripped through
//! a full frame (encode, size-prefix strip, decode) across its optional
//! field combinations.

use bytes::Bytes;

use pulsaresque::codec::{decode_frame, encode_command};
use pulsaresque::commands::*;
use pulsaresque::error::ServerError;
use pulsaresque::types::{ConsumerId, MessageId, ProducerId, RequestId};

fn roundtrip_via_frame(command: BaseCommand) {
    let frame = encode_command(&command).expect("encode");
    let decoded = decode_frame(frame.slice(4..)).expect("decode");
    assert_eq!(decoded.command, command);
    assert!(decoded.payload.is_none());
}

#[test]
fn connect_matrix() {
    for auth_method_name in [None, Some("token".to_string())] {
        for auth_data in [None, Some(Bytes::from_static(b"credential"))] {
            for proxy in [None, Some("pulsar://target:6650".to_string())] {
                roundtrip_via_frame(BaseCommand::Connect(CommandConnect {
                    client_version: "matrix".to_string(),
                    auth_method_name: auth_method_name.clone(),
                    auth_data: auth_data.clone(),
                    protocol_version: 19,
                    proxy_to_broker_url: proxy.clone(),
                }));
            }
        }
    }
}

#[test]
fn connected_matrix() {
    for server_version in [None, Some("broker".to_string())] {
        for max_message_size in [None, Some(1), Some(5 * 1024 * 1024)] {
            roundtrip_via_frame(BaseCommand::Connected(CommandConnected {
                server_version: server_version.clone(),
                protocol_version: 6,
                max_message_size,
            }));
        }
    }
}

#[test]
fn producer_matrix() {
    for producer_name in [None, Some("named".to_string())] {
        for schema in [
            None,
            Some(SchemaInfo {
                schema_type: 4,
                data: Bytes::from_static(b"avro-def"),
                properties: vec![("k".to_string(), "v".to_string())],
            }),
        ] {
            for topic_epoch in [None, Some(42)] {
                for access_mode in [
                    ProducerAccessMode::Shared,
                    ProducerAccessMode::Exclusive,
                    ProducerAccessMode::WaitForExclusive,
                    ProducerAccessMode::ExclusiveWithFencing,
                ] {
                    roundtrip_via_frame(BaseCommand::Producer(CommandProducer {
                        topic: "persistent://a/b/c".to_string(),
                        producer_id: ProducerId(17),
                        request_id: RequestId(23),
                        producer_name: producer_name.clone(),
                        encrypted: topic_epoch.is_some(),
                        properties: vec![("app".to_string(), "matrix".to_string())],
                        schema: schema.clone(),
                        epoch: 3,
                        user_provided_producer_name: producer_name.is_some(),
                        access_mode,
                        topic_epoch,
                        initial_subscription_name: None,
                    }));
                }
            }
        }
    }
}

#[test]
fn producer_success_matrix() {
    for schema_version in [None, Some(Bytes::from_static(&[0, 0, 0, 1]))] {
        for topic_epoch in [None, Some(7)] {
            for producer_ready in [false, true] {
                roundtrip_via_frame(BaseCommand::ProducerSuccess(CommandProducerSuccess {
                    request_id: RequestId(1),
                    producer_name: "assigned".to_string(),
                    last_sequence_id: -1,
                    schema_version: schema_version.clone(),
                    topic_epoch,
                    producer_ready,
                }));
            }
        }
    }
}

#[test]
fn send_receipt_matrix() {
    for partition in [-1, 0, 12] {
        for batch_index in [-1, 0, 5] {
            roundtrip_via_frame(BaseCommand::SendReceipt(CommandSendReceipt {
                producer_id: ProducerId(2),
                sequence_id: u64::MAX,
                message_id: MessageId {
                    ledger_id: i64::MAX,
                    entry_id: 0,
                    partition,
                    batch_index,
                },
            }));
        }
    }
}

#[test]
fn send_and_send_error_roundtrip() {
    roundtrip_via_frame(BaseCommand::Send(CommandSend {
        producer_id: ProducerId(9),
        sequence_id: 12345,
        num_messages: 30,
    }));
    for error in [
        ServerError::ChecksumError,
        ServerError::PersistenceError,
        ServerError::NotAllowedError,
    ] {
        roundtrip_via_frame(BaseCommand::SendError(CommandSendError {
            producer_id: ProducerId(9),
            sequence_id: 12345,
            error,
            message: "failed".to_string(),
        }));
    }
}

#[test]
fn lookup_matrix() {
    for authoritative in [false, true] {
        for listener_name in [None, Some("internal".to_string())] {
            roundtrip_via_frame(BaseCommand::Lookup(CommandLookup {
                topic: "persistent://a/b/c".to_string(),
                request_id: RequestId(5),
                authoritative,
                listener_name: listener_name.clone(),
            }));
        }
    }
}

#[test]
fn lookup_response_matrix() {
    for response in [
        None,
        Some(LookupResponseType::Redirect),
        Some(LookupResponseType::Connect),
        Some(LookupResponseType::Failed),
    ] {
        for error in [None, Some(ServerError::ServiceNotReady)] {
            roundtrip_via_frame(BaseCommand::LookupResponse(CommandLookupResponse {
                request_id: RequestId(6),
                response,
                broker_service_url: Some("pulsar://b:6650".to_string()),
                broker_service_url_tls: Some("pulsar+ssl://b:6651".to_string()),
                authoritative: true,
                proxy_through_service_url: false,
                error,
                message: error.map(|_| "unloading".to_string()),
            }));
        }
    }
}

#[test]
fn partitioned_metadata_roundtrip() {
    roundtrip_via_frame(BaseCommand::PartitionedMetadata(CommandPartitionedMetadata {
        topic: "persistent://a/b/c".to_string(),
        request_id: RequestId(8),
    }));
    for response in [
        None,
        Some(PartitionedMetadataResponseType::Success),
        Some(PartitionedMetadataResponseType::Failed),
    ] {
        roundtrip_via_frame(BaseCommand::PartitionedMetadataResponse(
            CommandPartitionedMetadataResponse {
                request_id: RequestId(8),
                partitions: 16,
                response,
                error: None,
                message: None,
            },
        ));
    }
}

#[test]
fn consumer_side_notifications_roundtrip() {
    roundtrip_via_frame(BaseCommand::CloseConsumer(CommandCloseConsumer {
        consumer_id: ConsumerId(3),
        request_id: RequestId(4),
    }));
    roundtrip_via_frame(BaseCommand::ActiveConsumerChange(
        CommandActiveConsumerChange {
            consumer_id: ConsumerId(3),
            is_active: true,
        },
    ));
    roundtrip_via_frame(BaseCommand::Message(CommandMessage {
        consumer_id: ConsumerId(3),
        message_id: MessageId::new(10, 20),
        redelivery_count: 2,
    }));
}

#[test]
fn control_commands_roundtrip() {
    roundtrip_via_frame(BaseCommand::Ping);
    roundtrip_via_frame(BaseCommand::Pong);
    roundtrip_via_frame(BaseCommand::Success(CommandSuccess {
        request_id: RequestId(11),
    }));
    roundtrip_via_frame(BaseCommand::Error(CommandError {
        request_id: RequestId(11),
        error: ServerError::TooManyRequests,
        message: "slow down".to_string(),
    }));
    roundtrip_via_frame(BaseCommand::CloseProducer(CommandCloseProducer {
        producer_id: ProducerId(1),
        request_id: RequestId(2),
    }));
}

#[test]
fn auth_exchange_roundtrip() {
    roundtrip_via_frame(BaseCommand::AuthChallenge(CommandAuthChallenge {
        auth_method_name: Some("token".to_string()),
        challenge: Bytes::from_static(b"nonce-bytes"),
    }));
    roundtrip_via_frame(BaseCommand::AuthResponse(CommandAuthResponse {
        client_version: "client".to_string(),
        auth_method_name: Some("token".to_string()),
        auth_data: Bytes::from_static(b"refreshed"),
        protocol_version: 19,
    }));
}

#[test]
fn metadata_queries_roundtrip() {
    roundtrip_via_frame(BaseCommand::GetLastMessageId(CommandGetLastMessageId {
        consumer_id: ConsumerId(1),
        request_id: RequestId(2),
    }));
    for mark_delete in [None, Some(MessageId::new(4, 2))] {
        roundtrip_via_frame(BaseCommand::GetLastMessageIdResponse(
            CommandGetLastMessageIdResponse {
                request_id: RequestId(2),
                last_message_id: MessageId::new(4, 9),
                consumer_mark_delete_position: mark_delete,
            },
        ));
    }
    for mode in [
        TopicsOfNamespaceMode::Persistent,
        TopicsOfNamespaceMode::NonPersistent,
        TopicsOfNamespaceMode::All,
    ] {
        roundtrip_via_frame(BaseCommand::GetTopicsOfNamespace(
            CommandGetTopicsOfNamespace {
                namespace: "tenant/ns".to_string(),
                request_id: RequestId(3),
                mode,
            },
        ));
    }
    roundtrip_via_frame(BaseCommand::GetTopicsOfNamespaceResponse(
        CommandGetTopicsOfNamespaceResponse {
            request_id: RequestId(3),
            topics: vec!["a".to_string(), "b".to_string()],
        },
    ));
    for schema_version in [None, Some(Bytes::from_static(&[9]))] {
        roundtrip_via_frame(BaseCommand::GetSchema(CommandGetSchema {
            topic: "persistent://a/b/c".to_string(),
            schema_version: schema_version.clone(),
            request_id: RequestId(4),
        }));
    }
    roundtrip_via_frame(BaseCommand::GetSchemaResponse(CommandGetSchemaResponse {
        request_id: RequestId(4),
        error_code: None,
        error_message: None,
        schema: Some(SchemaInfo {
            schema_type: 2,
            data: Bytes::from_static(b"{\"type\":\"record\"}"),
            properties: vec![],
        }),
    }));
}

#[test]
fn stats_roundtrip() {
    roundtrip_via_frame(BaseCommand::ConsumerStats(CommandConsumerStats {
        consumer_id: ConsumerId(1),
        request_id: RequestId(2),
    }));
    roundtrip_via_frame(BaseCommand::ConsumerStatsResponse(
        CommandConsumerStatsResponse {
            request_id: RequestId(2),
            error_code: None,
            error_message: None,
            msg_rate_out: 1024.5,
            msg_throughput_out: 1_048_576.0,
            msg_rate_redeliver: 0.25,
            consumer_name: "stats-consumer".to_string(),
            available_permits: 100,
            unacked_messages: 12,
            blocked_consumer_on_unacked_msgs: true,
            address: "10.0.0.3:51413".to_string(),
            connected_since: "2024-06-01T12:00:00Z".to_string(),
            consumer_type: "Exclusive".to_string(),
            msg_rate_expired: 0.0,
            msg_backlog: 4000,
        },
    ));
    for error in [None, Some(ServerError::MetadataError)] {
        roundtrip_via_frame(BaseCommand::AckResponse(CommandAckResponse {
            request_id: RequestId(5),
            error,
        }));
    }
}
