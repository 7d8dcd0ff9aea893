use chrono::{DateTime, Timelike, Utc};

use crate::error::ProtocolError;

/// 100 ns ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
/// Largest tick count a binary date may carry (9999-12-31T23:59:59.9999999).
const MAX_TICKS: i64 = 3_155_378_975_999_999_999;
const TICKS_MASK: i64 = 0x3FFF_FFFF_FFFF_FFFF;
const KIND_UTC: i64 = 0x4000_0000_0000_0000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Encodes `value` as a minimal signed little-endian two's-complement byte string.
///
/// Zero encodes as `[0x00]`; a value whose most significant byte has the top bit set
/// gets a trailing `0x00` so peers never read it back as negative.
pub fn to_signed_le_bytes(value: u128) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    bytes.push(0);
    while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] & 0x80 == 0 {
        bytes.pop();
    }
    bytes
}

/// Decodes a signed little-endian two's-complement byte string into a non-negative value.
///
/// An empty string decodes as zero. Negative values and values wider than 128 bits are
/// rejected.
pub fn from_signed_le_bytes(bytes: &[u8], field: &'static str) -> Result<u128, ProtocolError> {
    let Some(last) = bytes.last() else {
        return Ok(0);
    };
    if last & 0x80 != 0 {
        return Err(ProtocolError::InvalidInteger(field));
    }
    if bytes.len() > 16 && bytes[16..].iter().any(|b| *b != 0) {
        return Err(ProtocolError::InvalidInteger(field));
    }
    let mut buf = [0u8; 16];
    let len = bytes.len().min(16);
    buf[..len].copy_from_slice(&bytes[..len]);
    Ok(u128::from_le_bytes(buf))
}

/// Drops sub-tick precision so dates survive the binary encoding unchanged.
pub fn truncate_to_ticks(date: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = date.nanosecond() / 100 * 100;
    date.with_nanosecond(nanos).unwrap_or(date)
}

/// Encodes `date` as a UTC-kind .NET binary date.
pub fn date_to_binary(date: DateTime<Utc>) -> i64 {
    let ticks = date.timestamp() * TICKS_PER_SECOND
        + i64::from(date.timestamp_subsec_nanos() / 100)
        + UNIX_EPOCH_TICKS;
    (ticks.clamp(0, MAX_TICKS)) | KIND_UTC
}

/// Decodes a .NET binary date. Kind bits are ignored and the ticks read as UTC.
pub fn date_from_binary(value: i64) -> Result<DateTime<Utc>, ProtocolError> {
    let ticks = value & TICKS_MASK;
    if ticks > MAX_TICKS {
        return Err(ProtocolError::InvalidDate(value));
    }
    let unix_ticks = ticks - UNIX_EPOCH_TICKS;
    let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or(ProtocolError::InvalidDate(value))
}

/// Uppercase hex with `-` between bytes, e.g. `0A-FF-10`.
pub fn dashed_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_le_encoding() {
        assert_eq!(to_signed_le_bytes(0), vec![0x00]);
        assert_eq!(to_signed_le_bytes(1), vec![0x01]);
        assert_eq!(to_signed_le_bytes(0x7F), vec![0x7F]);
        assert_eq!(to_signed_le_bytes(0x80), vec![0x80, 0x00]);
        assert_eq!(to_signed_le_bytes(0x0100), vec![0x00, 0x01]);
        assert_eq!(to_signed_le_bytes(u128::MAX).len(), 17);
    }

    #[test]
    fn test_signed_le_decoding() {
        for value in [0u128, 1, 0x80, 0xFFFF, 1 << 100, u128::MAX, i128::MAX as u128] {
            let bytes = to_signed_le_bytes(value);
            assert_eq!(from_signed_le_bytes(&bytes, "value").unwrap(), value);
        }
        assert_eq!(from_signed_le_bytes(&[], "value").unwrap(), 0);
        // non-minimal encodings are still accepted
        assert_eq!(from_signed_le_bytes(&[0x05, 0x00, 0x00], "value").unwrap(), 5);
    }

    #[test]
    fn test_negative_and_oversized_integers_are_rejected() {
        assert_eq!(
            from_signed_le_bytes(&[0xFF], "blocks"),
            Err(ProtocolError::InvalidInteger("blocks"))
        );
        let mut wide = vec![0u8; 16];
        wide.push(0x01);
        assert!(from_signed_le_bytes(&wide, "blocks").is_err());
    }

    #[test]
    fn test_binary_date_round_trip() {
        let now = truncate_to_ticks(Utc::now());
        assert_eq!(date_from_binary(date_to_binary(now)).unwrap(), now);

        let epoch = DateTime::<Utc>::default();
        assert_eq!(date_to_binary(epoch), UNIX_EPOCH_TICKS | KIND_UTC);
    }

    #[test]
    fn test_binary_date_min_value() {
        let min = date_from_binary(0).unwrap();
        assert_eq!(min.timestamp(), -UNIX_EPOCH_TICKS / TICKS_PER_SECOND);
    }

    #[test]
    fn test_dashed_hex() {
        assert_eq!(dashed_hex(&[0x0A, 0xFF, 0x10]), "0A-FF-10");
        assert_eq!(dashed_hex(&[]), "");
    }
}
