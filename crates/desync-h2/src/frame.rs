//! Minimal HTTP/2 frame encode/decode. Only what a one-request client needs.

/// HTTP/2 client connection preface (RFC 7540 §3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// Size of an HTTP/2 frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame types.
pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

// Frame flags.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

// Settings identifiers.
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

/// Frame size assumed until the server advertises its own.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 14;
/// Flow-control window advertised by this client.
pub const INITIAL_WINDOW: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: usize,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

/// Parse the 9-byte frame header, or `None` if the buffer is too short.
pub fn parse_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | (buf[2] as usize);
    // Mask off the reserved R bit (bit 31).
    let stream_id = u32::from_be_bytes([buf[5] & 0x7f, buf[6], buf[7], buf[8]]);
    Some(FrameHeader {
        len,
        kind: buf[3],
        flags: buf[4],
        stream_id,
    })
}

pub fn encode_frame_header(out: &mut Vec<u8>, len: usize, kind: u8, flags: u8, stream_id: u32) {
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.push(kind);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
}

/// The initial SETTINGS frame this client advertises.
pub fn client_settings() -> Vec<u8> {
    settings_frame(&[
        (SETTINGS_INITIAL_WINDOW_SIZE, INITIAL_WINDOW),
        (SETTINGS_ENABLE_PUSH, 0),
        (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
    ])
}

pub fn settings_frame(entries: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * 6);
    for (id, val) in entries {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&val.to_be_bytes());
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_frame_header(&mut out, payload.len(), TYPE_SETTINGS, 0, 0);
    out.extend_from_slice(&payload);
    out
}

pub fn settings_ack() -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN);
    encode_frame_header(&mut out, 0, TYPE_SETTINGS, FLAG_ACK, 0);
    out
}

pub fn parse_settings(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect()
}

pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + 4);
    encode_frame_header(&mut out, 4, TYPE_WINDOW_UPDATE, 0, stream_id);
    out.extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes());
    out
}

/// A HEADERS frame followed by CONTINUATIONs, splitting `block` at
/// `max_frame` bytes.
pub fn header_frames(stream_id: u32, block: &[u8], max_frame: usize, end_stream: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() + 2 * FRAME_HEADER_LEN);
    let mut rest = block;
    let mut first = true;
    loop {
        let take = rest.len().min(max_frame);
        let (chunk, tail) = rest.split_at(take);
        rest = tail;
        let end_headers = rest.is_empty();

        let mut flags = 0u8;
        if end_headers {
            flags |= FLAG_END_HEADERS;
        }
        let kind = if first {
            if end_stream {
                flags |= FLAG_END_STREAM;
            }
            TYPE_HEADERS
        } else {
            TYPE_CONTINUATION
        };
        encode_frame_header(&mut out, chunk.len(), kind, flags, stream_id);
        out.extend_from_slice(chunk);

        first = false;
        if end_headers {
            return out;
        }
    }
}

/// DATA frames for `body`, the last carrying END_STREAM. Empty bodies produce
/// no frames (the caller flags END_STREAM on HEADERS instead).
pub fn data_frames(stream_id: u32, body: &[u8], max_frame: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2 * FRAME_HEADER_LEN);
    let mut rest = body;
    while !rest.is_empty() {
        let take = rest.len().min(max_frame);
        let (chunk, tail) = rest.split_at(take);
        rest = tail;
        let flags = if rest.is_empty() { FLAG_END_STREAM } else { 0 };
        encode_frame_header(&mut out, chunk.len(), TYPE_DATA, flags, stream_id);
        out.extend_from_slice(chunk);
    }
    out
}

/// `[start, end)` of the header block fragment inside a HEADERS payload,
/// stripping optional padding and priority bytes.
pub fn header_block_range(payload: &[u8], flags: u8) -> (usize, usize) {
    let mut start = 0usize;
    let mut end = payload.len();

    if flags & FLAG_PADDED != 0 {
        if payload.is_empty() {
            return (0, 0);
        }
        let pad_len = payload[0] as usize;
        start += 1;
        end = end.saturating_sub(pad_len);
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5; // 4 bytes stream dependency + 1 byte weight
    }
    if start > end { (0, 0) } else { (start, end) }
}

/// `[start, end)` of the data inside a DATA payload, stripping padding.
pub fn data_range(payload: &[u8], flags: u8) -> (usize, usize) {
    if flags & FLAG_PADDED != 0 && !payload.is_empty() {
        let pad = payload[0] as usize;
        (1, payload.len().saturating_sub(pad).max(1))
    } else {
        (0, payload.len())
    }
}

/// Error code from an RST_STREAM payload.
pub fn rst_error_code(payload: &[u8]) -> u32 {
    if payload.len() < 4 {
        return 0;
    }
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

/// Error code from a GOAWAY payload (follows the 4-byte last-stream-id).
pub fn goaway_error_code(payload: &[u8]) -> u32 {
    if payload.len() < 8 {
        return 0;
    }
    u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])
}

pub fn error_code_name(code: u32) -> &'static str {
    match code {
        0x0 => "NO_ERROR",
        0x1 => "PROTOCOL_ERROR",
        0x2 => "INTERNAL_ERROR",
        0x3 => "FLOW_CONTROL_ERROR",
        0x4 => "SETTINGS_TIMEOUT",
        0x5 => "STREAM_CLOSED",
        0x6 => "FRAME_SIZE_ERROR",
        0x7 => "REFUSED_STREAM",
        0x8 => "CANCEL",
        0x9 => "COMPRESSION_ERROR",
        0xa => "CONNECT_ERROR",
        0xb => "ENHANCE_YOUR_CALM",
        0xc => "INADEQUATE_SECURITY",
        0xd => "HTTP_1_1_REQUIRED",
        _ => "UNKNOWN",
    }
}
