//! Byte-level frame layout tests.
//!
//! These verify the wire image of command and data frames against the
//! framing contract:
//!
//! ```text
//! totalSize: u32 | commandSize: u32 | command | [payload region]
//! ```
//!
//! with the optional `0x0e01` broker-entry-metadata and `0x0e02` checksum
//! sections inside the payload region.

use bytes::{BufMut, Bytes, BytesMut};

use pulsaresque::codec::{
    crc32c, decode_frame, encode_command, encode_message_frame, encode_send, ChecksumType,
};
use pulsaresque::commands::{
    BaseCommand, BrokerEntryMetadata, CommandSend, CommandSuccess, MessageMetadata,
};
use pulsaresque::error::Error;
use pulsaresque::types::{ProducerId, RequestId};

fn send_command(sequence_id: u64) -> BaseCommand {
    BaseCommand::Send(CommandSend {
        producer_id: ProducerId(7),
        sequence_id,
        num_messages: 1,
    })
}

fn metadata(sequence_id: u64) -> MessageMetadata {
    MessageMetadata {
        producer_name: "wire-test".to_string(),
        publish_time: 1_700_000_000_000,
        sequence_id,
        ..Default::default()
    }
}

fn assemble(header: &Bytes, packet: &Bytes) -> Bytes {
    let mut wire = BytesMut::with_capacity(header.len() + packet.len());
    wire.put(header.clone());
    wire.put(packet.clone());
    wire.freeze()
}

#[test]
fn command_frame_sizes_are_consistent() {
    let frame = encode_command(&BaseCommand::Success(CommandSuccess {
        request_id: RequestId(99),
    }))
    .unwrap();

    let total = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let command_size = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;

    // totalSize covers everything after itself; commandSize everything
    // after itself.
    assert_eq!(total, frame.len() - 4);
    assert_eq!(command_size, total - 4);
}

#[test]
fn send_frame_matches_documented_layout() {
    // Happy-path layout from the protocol contract:
    // total = cmdSize(4) + cmd + magic(2) + checksum(4) + metaSize(4) + meta + payload
    let payload = Bytes::from_static(b"hello");
    let frame = encode_send(
        &send_command(0),
        &metadata(0),
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();

    let command_len = send_command(0).to_bytes().unwrap().len();
    let metadata_len = metadata(0).encoded_size();
    let total =
        u32::from_be_bytes([frame.header[0], frame.header[1], frame.header[2], frame.header[3]])
            as usize;
    assert_eq!(total, 4 + command_len + 2 + 4 + 4 + metadata_len + 5);

    // Checksum magic sits right after the command.
    let magic_offset = 8 + command_len;
    assert_eq!(
        &frame.header[magic_offset..magic_offset + 2],
        &[0x0e, 0x02]
    );

    // The stored checksum covers the packet (metadata size + metadata +
    // payload).
    let stored = u32::from_be_bytes([
        frame.header[magic_offset + 2],
        frame.header[magic_offset + 3],
        frame.header[magic_offset + 4],
        frame.header[magic_offset + 5],
    ]);
    assert_eq!(stored, crc32c(0, &frame.packet));
}

#[test]
fn encode_then_decode_is_identity() {
    let payload = Bytes::from_static(b"roundtrip payload bytes");
    let source_metadata = MessageMetadata {
        partition_key: Some("key".to_string()),
        ordering_key: Some(Bytes::from_static(b"ok")),
        ..metadata(42)
    };
    let frame = encode_send(
        &send_command(42),
        &source_metadata,
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();

    let decoded = decode_frame(assemble(&frame.header, &frame.packet).slice(4..)).unwrap();
    assert_eq!(decoded.command, send_command(42));
    let message = decoded.payload.expect("payload region");
    assert!(message.checksum_valid);
    assert_eq!(message.metadata, source_metadata);
    assert_eq!(message.payload, payload);
}

#[test]
fn checksum_round_trips_as_valid() {
    let payload = Bytes::from_static(b"checked");
    let frame = encode_send(
        &send_command(1),
        &metadata(1),
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();
    let decoded = decode_frame(assemble(&frame.header, &frame.packet).slice(4..)).unwrap();
    assert!(decoded.payload.unwrap().checksum_valid);
}

#[test]
fn absent_checksum_magic_means_no_verification() {
    let payload = Bytes::from_static(b"unchecked");
    let frame = encode_send(&send_command(1), &metadata(1), &payload, ChecksumType::None).unwrap();
    let mut wire = BytesMut::from(assemble(&frame.header, &frame.packet).as_ref());
    // Corrupt the payload; without a checksum section this is not
    // detected at the framing layer.
    let last = wire.len() - 1;
    wire[last] ^= 0xff;

    let decoded = decode_frame(wire.freeze().slice(4..)).unwrap();
    assert!(decoded.payload.unwrap().checksum_valid);
}

#[test]
fn corrupting_any_payload_byte_invalidates_checksum() {
    let payload = Bytes::from_static(b"sensitive");
    let frame = encode_send(
        &send_command(2),
        &metadata(2),
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();
    let clean = assemble(&frame.header, &frame.packet);

    // Flip every byte of the checksummed region, one at a time.
    let packet_start = clean.len() - frame.packet.len();
    for index in packet_start..clean.len() {
        let mut wire = BytesMut::from(clean.as_ref());
        wire[index] ^= 0x01;
        let decoded = decode_frame(wire.freeze().slice(4..)).unwrap();
        assert!(
            !decoded.payload.unwrap().checksum_valid,
            "corruption at byte {} went undetected",
            index
        );
    }
}

#[test]
fn broker_entry_metadata_section_is_decoded() {
    let broker_metadata = BrokerEntryMetadata {
        broker_timestamp: Some(1_700_000_000_777),
        index: Some(3),
    };
    let payload = Bytes::from_static(b"entry");
    let wire = encode_message_frame(
        &BaseCommand::Message(Default::default()),
        Some(&broker_metadata),
        &metadata(9),
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();

    // Broker metadata magic comes before the checksum magic.
    let decoded = decode_frame(wire.slice(4..)).unwrap();
    let message = decoded.payload.unwrap();
    assert_eq!(message.broker_metadata, Some(broker_metadata));
    assert!(message.checksum_valid);
    assert_eq!(message.payload, payload);
}

#[test]
fn truncated_frames_are_rejected() {
    let payload = Bytes::from_static(b"hello");
    let frame = encode_send(
        &send_command(3),
        &metadata(3),
        &payload,
        ChecksumType::Crc32c,
    )
    .unwrap();
    let wire = assemble(&frame.header, &frame.packet);
    let body = wire.slice(4..);

    // Every prefix shorter than the full frame must fail cleanly, not
    // panic.
    for cut in 0..body.len() {
        let result = decode_frame(body.slice(0..cut));
        assert!(
            result.is_err(),
            "truncation to {} bytes decoded successfully",
            cut
        );
    }
    assert!(decode_frame(body).is_ok());
}

#[test]
fn garbage_command_type_is_unknown_command() {
    let mut frame = BytesMut::new();
    let mut command = BytesMut::new();
    command.put_u16(0x7fff);
    frame.put_u32(command.len() as u32);
    frame.put(command);
    assert_eq!(
        decode_frame(frame.freeze()).unwrap_err(),
        Error::UnknownCommand
    );
}

#[test]
fn crc32c_matches_reference_vectors() {
    // RFC 3720 test vector: 32 bytes of zeros.
    assert_eq!(crc32c(0, &[0u8; 32]), 0x8A91_36AA);
    // Standard check input.
    assert_eq!(crc32c(0, b"123456789"), 0xE306_9283);
}
