extern crate alloc;

use alloc::{format, string::String};

use chrono::{DateTime, NaiveDateTime, Utc};

const UTC_TIME_FORMATS: [&str; 2] = ["%y%m%d%H%M%S", "%y%m%d%H%M"];
const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Parses an ASN.1 UTCTime, trying the formats with and without seconds.
pub(crate) fn parse_utc_time(text: &str) -> Option<DateTime<Utc>> {
    UTC_TIME_FORMATS
        .iter()
        .find_map(|format| parse_with_zone(text, format))
}

pub(crate) fn parse_generalized_time(text: &str) -> Option<DateTime<Utc>> {
    parse_with_zone(text, GENERALIZED_TIME_FORMAT)
}

/// Parses the date strings stored in receipt attributes,
/// e.g. `2023-11-13T07:07:43Z`. Empty strings yield `None`.
pub(crate) fn parse_receipt_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// `format` followed by either `Z` or a numeric `+hhmm` offset.
fn parse_with_zone(text: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Some(local) = text.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(local, format)
            .ok()
            .map(|date| date.and_utc());
    }
    DateTime::parse_from_str(text, &format!("{format}%z"))
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// UTF-16 text as found in BMPString values. Big-endian unless
/// a byte order mark says otherwise.
pub(crate) fn decode_utf16(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let (little_endian, body) = match bytes {
        [0xff, 0xfe, rest @ ..] => (true, rest),
        [0xfe, 0xff, rest @ ..] => (false, rest),
        _ => (false, bytes),
    };
    let units = body.chunks_exact(2).map(|pair| {
        if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

pub(crate) fn decode_ascii(bytes: &[u8]) -> Option<String> {
    if bytes.is_ascii() {
        core::str::from_utf8(bytes).ok().map(String::from)
    } else {
        None
    }
}
