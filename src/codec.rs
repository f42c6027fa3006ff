//! Frame encoding and decoding.
//!
//! Every wire unit is a length-prefixed frame:
//!
//! ```text
//! totalSize: u32 | commandSize: u32 | command | [payload region]
//! ```
//!
//! When a payload region follows (SEND and MESSAGE frames) it is laid out
//! as:
//!
//! ```text
//! [0x0e01 u16 | brokerMetaSize u32 | brokerMeta]?   optional broker entry metadata
//! [0x0e02 u16 | checksum u32]?                      optional CRC-32C
//! metadataSize: u32 | metadata | payload
//! ```
//!
//! The checksum covers every byte after the checksum field through the end
//! of the frame. Both magic sections are optional per frame; absence of
//! the checksum magic means the frame carries no checksum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nombytes::NomBytes;

use crate::commands::{
    parse_broker_entry_metadata, parse_message_metadata, BaseCommand, BrokerEntryMetadata,
    MessageMetadata,
};
use crate::constants::{MAGIC_BROKER_ENTRY_METADATA, MAGIC_CRC32C};
use crate::encode::ToByte;
use crate::error::{Error, Result};

// CRC-32C polynomial (Castagnoli), table generated at compile time.
// A hand-rolled implementation keeps the dependency tree small.
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute a CRC-32C checksum (Castagnoli polynomial) over `data`,
/// continuing from `seed`. Frames are checksummed with `seed = 0`.
pub fn crc32c(seed: u32, data: &[u8]) -> u32 {
    let mut crc = !seed;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// Whether outgoing SEND frames carry a checksum.
///
/// Decided once per connection from the negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumType {
    /// No checksum section is emitted.
    None,
    /// CRC-32C over metadata plus payload.
    #[default]
    Crc32c,
}

/// Encode a command-only frame: `[totalSize | cmdSize | cmd]`.
pub fn encode_command(command: &BaseCommand) -> Result<Bytes> {
    let mut body = BytesMut::new();
    command.encode(&mut body)?;

    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u32((4 + body.len()) as u32);
    frame.put_u32(body.len() as u32);
    frame.put(body);
    Ok(frame.freeze())
}

/// A SEND frame split into its two write segments.
///
/// The header carries the sizes, the command and the checksum section; the
/// packet carries the already-built metadata plus payload. Keeping them
/// separate lets the payload bytes be shared with the pending queue while
/// the header is rebuilt per write.
#[derive(Debug, Clone)]
pub struct SendFrame {
    /// `[totalSize | cmdSize | cmd | magic | checksum?]`
    pub header: Bytes,
    /// `[metadataSize | metadata | payload]`
    pub packet: Bytes,
}

impl SendFrame {
    /// Total frame length on the wire, including the size prefix.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.packet.len()
    }
}

/// Encode a SEND frame.
///
/// The packet segment is assembled first so the header sizes can be
/// patched in before the header is frozen.
pub fn encode_send(
    command: &BaseCommand,
    metadata: &MessageMetadata,
    payload: &Bytes,
    checksum: ChecksumType,
) -> Result<SendFrame> {
    let mut command_body = BytesMut::new();
    command.encode(&mut command_body)?;

    let mut packet = BytesMut::new();
    let metadata_size = metadata.encoded_size();
    packet.put_u32(metadata_size as u32);
    metadata.encode(&mut packet)?;
    packet.put(payload.clone());
    let packet = packet.freeze();

    let checksum_section = match checksum {
        ChecksumType::Crc32c => 2 + 4,
        ChecksumType::None => 0,
    };
    let total_size = 4 + command_body.len() + checksum_section + packet.len();

    let mut header = BytesMut::with_capacity(4 + total_size - packet.len());
    header.put_u32(total_size as u32);
    header.put_u32(command_body.len() as u32);
    header.put(command_body);
    if checksum == ChecksumType::Crc32c {
        header.put_u16(MAGIC_CRC32C);
        header.put_u32(crc32c(0, &packet));
    }

    Ok(SendFrame {
        header: header.freeze(),
        packet,
    })
}

/// The decoded payload region of a payload-bearing frame.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub broker_metadata: Option<BrokerEntryMetadata>,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
    /// False when the frame carried a checksum and it did not match. A
    /// frame without a checksum section reports true.
    pub checksum_valid: bool,
}

/// A decoded frame: the command plus, for data frames, the payload region.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub command: BaseCommand,
    pub payload: Option<MessagePayload>,
}

/// Decode one frame from `frame`, which must contain exactly the
/// `totalSize` bytes following the size prefix.
pub fn decode_frame(frame: Bytes) -> Result<DecodedFrame> {
    if frame.len() < 4 {
        return Err(Error::MalformedFrame);
    }
    let mut cursor = frame.clone();
    let command_size = cursor.get_u32() as usize;
    if cursor.remaining() < command_size {
        return Err(Error::MalformedFrame);
    }
    let command_bytes = cursor.copy_to_bytes(command_size);
    let command = BaseCommand::parse(command_bytes)?;

    if !cursor.has_remaining() {
        return Ok(DecodedFrame {
            command,
            payload: None,
        });
    }

    // Optional broker entry metadata section.
    let mut broker_metadata = None;
    if cursor.remaining() >= 2 {
        let mut peek = cursor.clone();
        if peek.get_u16() == MAGIC_BROKER_ENTRY_METADATA {
            cursor.advance(2);
            if cursor.remaining() < 4 {
                return Err(Error::MalformedFrame);
            }
            let broker_metadata_size = cursor.get_u32() as usize;
            if cursor.remaining() < broker_metadata_size {
                return Err(Error::MalformedFrame);
            }
            let raw = cursor.copy_to_bytes(broker_metadata_size);
            let (_, parsed) =
                parse_broker_entry_metadata(NomBytes::new(raw)).map_err(|_| Error::MalformedFrame)?;
            broker_metadata = Some(parsed);
        }
    }

    // Optional checksum section. The checksum covers everything after the
    // stored value through the end of the frame.
    let mut checksum_valid = true;
    if cursor.remaining() >= 2 {
        let mut peek = cursor.clone();
        if peek.get_u16() == MAGIC_CRC32C {
            cursor.advance(2);
            if cursor.remaining() < 4 {
                return Err(Error::MalformedFrame);
            }
            let stored = cursor.get_u32();
            let computed = crc32c(0, cursor.chunk());
            checksum_valid = stored == computed;
        }
    }

    if cursor.remaining() < 4 {
        return Err(Error::MalformedFrame);
    }
    let metadata_size = cursor.get_u32() as usize;
    if cursor.remaining() < metadata_size {
        return Err(Error::MalformedFrame);
    }
    let metadata_bytes = cursor.copy_to_bytes(metadata_size);
    let (_, metadata) =
        parse_message_metadata(NomBytes::new(metadata_bytes)).map_err(|_| Error::MalformedFrame)?;

    let payload = cursor.copy_to_bytes(cursor.remaining());

    Ok(DecodedFrame {
        command,
        payload: Some(MessagePayload {
            broker_metadata,
            metadata,
            payload,
            checksum_valid,
        }),
    })
}

/// Encode a broker-style MESSAGE frame. The inverse of the SEND path, used
/// by the mock brokers in the integration tests.
pub fn encode_message_frame(
    command: &BaseCommand,
    broker_metadata: Option<&BrokerEntryMetadata>,
    metadata: &MessageMetadata,
    payload: &Bytes,
    checksum: ChecksumType,
) -> Result<Bytes> {
    let mut command_body = BytesMut::new();
    command.encode(&mut command_body)?;

    let mut packet = BytesMut::new();
    packet.put_u32(metadata.encoded_size() as u32);
    metadata.encode(&mut packet)?;
    packet.put(payload.clone());

    let mut region = BytesMut::new();
    if let Some(broker_metadata) = broker_metadata {
        let mut broker_body = BytesMut::new();
        broker_metadata.encode(&mut broker_body)?;
        region.put_u16(MAGIC_BROKER_ENTRY_METADATA);
        region.put_u32(broker_body.len() as u32);
        region.put(broker_body);
    }
    if checksum == ChecksumType::Crc32c {
        region.put_u16(MAGIC_CRC32C);
        region.put_u32(crc32c(0, &packet));
    }
    region.put(packet);

    let total_size = 4 + command_body.len() + region.len();
    let mut frame = BytesMut::with_capacity(4 + total_size);
    frame.put_u32(total_size as u32);
    frame.put_u32(command_body.len() as u32);
    frame.put(command_body);
    frame.put(region);
    Ok(frame.freeze())
}
