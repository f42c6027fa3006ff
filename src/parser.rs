//! Deserialize data from the wire protocol.

use bytes::Bytes;
use nom::{
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_f64, be_i16, be_i32, be_i64, be_u8, be_u16, be_u32, be_u64},
    IResult,
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, nom::Err<nom::error::Error<NomBytes>>> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Parse a `u16`-length-prefixed string as raw bytes.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// Parse a `u16`-length-prefixed string as UTF-8.
pub fn parse_utf8(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, raw) = parse_string(s)?;
    let string = bytes_to_string(&raw)?;
    Ok((s, string))
}

/// Parse an optional string: `i16` length where `-1` means absent.
pub fn parse_opt_utf8(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    let (s, length) = be_i16(s)?;

    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let (s, raw) = take(length as u16)(s)?;
    let string = bytes_to_string(&raw.into_bytes())?;
    Ok((s, Some(string)))
}

/// Parse a `u32`-length-prefixed byte field.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u32(s)?;
    let (s, raw) = take(length)(s)?;
    Ok((s, raw.into_bytes()))
}

/// Parse an optional byte field: presence byte then `u32`-prefixed bytes.
pub fn parse_opt_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, present) = be_u8(s)?;
    if present == 0 {
        return Ok((s, None));
    }
    let (s, raw) = parse_bytes(s)?;
    Ok((s, Some(raw)))
}

/// Parse an optional fixed-width value: presence byte then the value.
pub fn parse_opt<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Option<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, present) = be_u8(input)?;
        if present == 0 {
            return Ok((i, None));
        }
        let mut parser = f;
        let (i, value) = parser.parse(i)?;
        Ok((i, Some(value)))
    }
}

/// Parse a bounded protocol array.
pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;

        // Null array
        if length == -1 {
            return Ok((i, vec![]));
        }

        // Validate array size bounds
        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        many_m_n(length as usize, length as usize, f)(i)
    }
}

/// Parse a boolean encoded as a single byte.
pub fn parse_bool(s: NomBytes) -> IResult<NomBytes, bool> {
    let (s, byte) = be_u8(s)?;
    Ok((s, byte != 0))
}

// Re-exports so command parsing has one import surface.
pub use nom::number::complete::{
    be_f64 as parse_f64, be_i32 as parse_i32, be_i64 as parse_i64, be_u8 as parse_u8,
    be_u16 as parse_u16, be_u32 as parse_u32, be_u64 as parse_u64,
};
