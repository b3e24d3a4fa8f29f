use thiserror::Error;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

/// Prefix an upstream hop injects before the Minecraft stream to carry the
/// real client IP: 4 marker bytes, 1 length byte, then that many ASCII bytes.
const ADDRESS_MARKER: &[u8; 4] = b"MCIP";

const MAX_VARINT_BYTES: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer ended mid-VarInt")]
    UnexpectedEnd,
    #[error("VarInt longer than {MAX_VARINT_BYTES} bytes")]
    VarIntTooLong,
    #[error("negative length prefix")]
    NegativeLength,
    #[error("string of {declared} bytes overruns remaining {remaining}")]
    StringOverrun { declared: usize, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet of {declared} bytes overruns remaining {remaining}")]
    PacketOverrun { declared: usize, remaining: usize },
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("missing injected client address marker")]
    MissingMarker,
    #[error("truncated client address header")]
    ShortHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Modern,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

pub fn read_varint(buf: &[u8], offset: usize) -> Result<(i32, usize), DecodeError> {
    let mut result: i32 = 0;
    let mut num_read = 0usize;
    loop {
        let Some(&b) = buf.get(offset + num_read) else {
            return Err(DecodeError::UnexpectedEnd);
        };
        result |= ((b & 0x7f) as i32) << (7 * num_read as u32);
        num_read += 1;
        if b & 0x80 == 0 {
            return Ok((result, num_read));
        }
        if num_read == MAX_VARINT_BYTES {
            return Err(DecodeError::VarIntTooLong);
        }
    }
}

/// Length-prefixed UTF-8 string: VarInt byte count, then exactly that many bytes.
pub fn read_string(buf: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let (len, len_bytes) = read_varint(buf, offset)?;
    if len < 0 {
        return Err(DecodeError::NegativeLength);
    }
    let len = len as usize;
    let start = offset + len_bytes;
    let remaining = buf.len().saturating_sub(start);
    if len > remaining {
        return Err(DecodeError::StringOverrun {
            declared: len,
            remaining,
        });
    }
    let s = std::str::from_utf8(&buf[start..start + len]).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((s.to_string(), len_bytes + len))
}

/// Strips the injected client-IP header off the front of the stream.
///
/// Returns the advertised client IP and the residual bytes, which start at
/// the first Minecraft packet. The header is mandatory: the socket peer is an
/// upstream hop, not the player, so a stream without it is rejected.
pub fn strip_client_address(buf: &[u8]) -> Result<(String, &[u8]), DecodeError> {
    if buf.len() < ADDRESS_MARKER.len() {
        return Err(DecodeError::ShortHeader);
    }
    if &buf[..ADDRESS_MARKER.len()] != ADDRESS_MARKER {
        return Err(DecodeError::MissingMarker);
    }
    let Some(&len) = buf.get(ADDRESS_MARKER.len()) else {
        return Err(DecodeError::ShortHeader);
    };
    let end = ADDRESS_MARKER.len() + 1 + len as usize;
    if buf.len() < end {
        return Err(DecodeError::ShortHeader);
    }
    let ip = std::str::from_utf8(&buf[ADDRESS_MARKER.len() + 1..end])
        .map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((ip.to_string(), &buf[end..]))
}

/// A stream is modern iff it opens with `VarInt length, VarInt id` and the id
/// is a handshake (0x00) or ping (0x01). Anything else, notably the 0xFE
/// server-list ping of pre-Netty clients, is legacy.
pub fn classify(buf: &[u8]) -> Classification {
    let Ok((_, len_bytes)) = read_varint(buf, 0) else {
        return Classification::Legacy;
    };
    match read_varint(buf, len_bytes) {
        Ok((0x00 | 0x01, _)) => Classification::Modern,
        _ => Classification::Legacy,
    }
}

/// Parses the handshake packet and returns it together with the residual
/// slice positioned immediately after the declared packet length.
pub fn parse_handshake(buf: &[u8]) -> Result<(Handshake, &[u8]), DecodeError> {
    let (packet_len, len_bytes) = read_varint(buf, 0)?;
    if packet_len < 0 {
        return Err(DecodeError::NegativeLength);
    }
    let end = len_bytes + packet_len as usize;
    if end > buf.len() {
        return Err(DecodeError::PacketOverrun {
            declared: packet_len as usize,
            remaining: buf.len() - len_bytes,
        });
    }

    let (packet_id, id_bytes) = read_varint(buf, len_bytes)?;
    if packet_id != 0x00 {
        return Err(DecodeError::UnexpectedPacket(packet_id));
    }

    let mut off = len_bytes + id_bytes;
    let (protocol_version, n) = read_varint(buf, off)?;
    off += n;
    let (server_address, n) = read_string(buf, off)?;
    off += n;
    if off + 2 > buf.len() {
        return Err(DecodeError::UnexpectedEnd);
    }
    let server_port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;
    let (next_state, _) = read_varint(buf, off)?;

    Ok((
        Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
        },
        &buf[end..],
    ))
}

/// Parses a Login Start packet (the frame after a `nextState == 2` handshake)
/// and returns the username.
pub fn parse_login_start(buf: &[u8]) -> Result<String, DecodeError> {
    let (packet_len, len_bytes) = read_varint(buf, 0)?;
    if packet_len < 0 {
        return Err(DecodeError::NegativeLength);
    }
    if len_bytes + packet_len as usize > buf.len() {
        return Err(DecodeError::PacketOverrun {
            declared: packet_len as usize,
            remaining: buf.len() - len_bytes,
        });
    }
    let (packet_id, id_bytes) = read_varint(buf, len_bytes)?;
    if packet_id != 0x00 {
        return Err(DecodeError::UnexpectedPacket(packet_id));
    }
    let (username, _) = read_string(buf, len_bytes + id_bytes)?;
    Ok(username)
}
