//! Minimal SNTP (RFC 4330) client packet handling.

use chrono::{DateTime, NaiveDateTime};

use crate::error::SyncError;

pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_SIZE: usize = 48;

// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;
const NTP_ERA_SECONDS: u64 = 1 << 32;

const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;

/// LI = 0, VN = 3, Mode = 3 (client); everything else zero.
pub fn request_packet() -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0_u8; NTP_PACKET_SIZE];
    packet[0] = 0x1B;
    packet
}

/// Extracts the server transmit timestamp as UTC.
pub fn parse_response(packet: &[u8]) -> Result<NaiveDateTime, SyncError> {
    if packet.len() < NTP_PACKET_SIZE {
        return Err(SyncError::InvalidResponse("short packet"));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return Err(SyncError::InvalidResponse("not a server reply"));
    }
    if packet[1] == 0 {
        return Err(SyncError::InvalidResponse("kiss-of-death reply"));
    }

    let seconds = u64::from(u32::from_be_bytes([
        packet[40], packet[41], packet[42], packet[43],
    ]));
    let fraction = u64::from(u32::from_be_bytes([
        packet[44], packet[45], packet[46], packet[47],
    ]));
    if seconds == 0 && fraction == 0 {
        return Err(SyncError::InvalidResponse("empty transmit timestamp"));
    }

    // Timestamps below the Unix epoch belong to NTP era 1 (after 2036-02-07).
    let seconds = if seconds < NTP_UNIX_EPOCH_OFFSET {
        seconds + NTP_ERA_SECONDS
    } else {
        seconds
    };
    let unix_seconds = i64::try_from(seconds - NTP_UNIX_EPOCH_OFFSET)
        .map_err(|_| SyncError::InvalidResponse("timestamp out of range"))?;
    let nanos = u32::try_from((fraction * 1_000_000_000) >> 32)
        .map_err(|_| SyncError::InvalidResponse("timestamp out of range"))?;

    DateTime::from_timestamp(unix_seconds, nanos)
        .map(|utc| utc.naive_utc())
        .ok_or(SyncError::InvalidResponse("timestamp out of range"))
}
