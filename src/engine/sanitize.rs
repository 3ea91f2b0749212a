//! Cleans raw sandbox output into displayable text.
//!
//! Docker multiplexes stdout and stderr over one stream when no TTY is
//! attached: every chunk is prefixed with an 8 byte header
//! `[stream, 0, 0, 0, len(u32 big endian)]`.

const FRAME_HEADER_LEN: usize = 8;

pub fn sanitize(raw: &[u8]) -> String {
    let payload = strip_frames(raw);
    let text = String::from_utf8_lossy(&payload);
    let cleaned: String = text
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect();
    cleaned.trim().to_string()
}

/// Concatenates frame payloads while the input keeps parsing as frames; the
/// first bytes that are not a well-formed frame are kept verbatim.
fn strip_frames(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(len) = frame_len(rest) {
        let end = FRAME_HEADER_LEN + len;
        out.extend_from_slice(&rest[FRAME_HEADER_LEN..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}

fn frame_len(bytes: &[u8]) -> Option<usize> {
    let header = bytes.get(..FRAME_HEADER_LEN)?;
    if header[0] > 2 || header[1..4] != [0, 0, 0] {
        return None;
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    (bytes.len() - FRAME_HEADER_LEN >= len).then_some(len)
}
