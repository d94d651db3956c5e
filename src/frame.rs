//! Frame marshalling.
//!
//! Wire format:
//!
//! ```text
//! ACTION\n
//! key:value\n        (zero or more)
//! \n
//! body               (content-length bytes, or up to the first NUL)
//! \0[\n]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, StompError};
use crate::types::{header, Command, Frame, Headers, FRAME_TERMINATOR};

/// Default upper bound on a single buffered frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A decoded frame, or the recoverable reason it could not be decoded.
pub type DecodedFrame = std::result::Result<Frame, FrameError>;

/// Encode a frame into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(64 + frame.body.len());
    encode_frame_into(frame, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode a frame, appending to `dst`. Nothing is written on error.
pub fn encode_frame_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    let action = frame.command.as_str();
    check_action(action)?;
    for (key, value) in frame.headers.iter() {
        check_header(key, value)?;
    }

    dst.put_slice(action.as_bytes());
    dst.put_u8(b'\n');
    for (key, value) in frame.headers.iter() {
        // Length framing is decided below, never taken from the map.
        if key == header::CONTENT_LENGTH {
            continue;
        }
        dst.put_slice(key.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(value.as_bytes());
        dst.put_u8(b'\n');
    }
    if frame.binary || frame.body.contains(&FRAME_TERMINATOR) {
        dst.put_slice(header::CONTENT_LENGTH.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(frame.body.len().to_string().as_bytes());
        dst.put_u8(b'\n');
    }
    dst.put_u8(b'\n');
    dst.put_slice(&frame.body);
    dst.put_u8(FRAME_TERMINATOR);
    dst.put_u8(b'\n');
    Ok(())
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. A malformed frame is
/// consumed and returned as `Ok(Some(Err(_)))` so the caller can keep
/// reading. Only an oversized frame is fatal.
pub fn try_decode_frame(
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<DecodedFrame>, StompError> {
    // Newlines between frames are keep-alives.
    let skip = buf
        .iter()
        .take_while(|b| **b == b'\n' || **b == b'\r')
        .count();
    let _ = buf.split_to(skip);
    if buf.is_empty() {
        return Ok(None);
    }

    let Some(body_start) = find_header_end(buf) else {
        check_size(buf.len(), max_frame_size)?;
        return Ok(None);
    };
    check_size(body_start, max_frame_size)?;

    let parsed = parse_head(&buf[..body_start]);
    let content_length = match &parsed {
        Ok((_, headers)) => headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<usize>().ok()),
        Err(_) => None,
    };

    let (terminator, length_error) = match content_length {
        Some(len) => {
            check_size(body_start.saturating_add(len).saturating_add(1), max_frame_size)?;
            if buf.len() <= body_start + len {
                return Ok(None);
            }
            if buf[body_start + len] == FRAME_TERMINATOR {
                (body_start + len, None)
            } else {
                // Resynchronise on the next NUL after the declared body.
                match find_terminator(buf, body_start + len) {
                    Some(pos) => (
                        pos,
                        Some(FrameError::Format(format!(
                            "body is longer than its content-length of {len}"
                        ))),
                    ),
                    None => {
                        check_size(buf.len(), max_frame_size)?;
                        return Ok(None);
                    }
                }
            }
        }
        None => match find_terminator(buf, body_start) {
            Some(pos) => (pos, None),
            None => {
                check_size(buf.len(), max_frame_size)?;
                return Ok(None);
            }
        },
    };

    let mut consumed = terminator + 1;
    let mut trailer_error = None;
    if let Some(&next) = buf.get(consumed) {
        if next == b'\n' {
            consumed += 1;
        } else {
            trailer_error = Some(FrameError::Format(format!(
                "expected a newline after the frame terminator, found byte 0x{next:02x}"
            )));
        }
    }

    let raw = buf.split_to(consumed).freeze();
    let (command, mut headers) = match parsed {
        Ok(head) => head,
        Err(e) => return Ok(Some(Err(e))),
    };
    if let Some(e) = length_error.or(trailer_error) {
        return Ok(Some(Err(e)));
    }

    let binary = content_length.is_some();
    if binary {
        headers.remove(header::CONTENT_LENGTH);
    }
    Ok(Some(Ok(Frame {
        command,
        headers,
        body: raw.slice(body_start..terminator),
        binary,
    })))
}

fn check_size(size: usize, max: usize) -> Result<(), StompError> {
    if size > max {
        return Err(StompError::FrameTooLarge { size, max });
    }
    Ok(())
}

fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .iter()
        .position(|b| *b == FRAME_TERMINATOR)
        .map(|pos| from + pos)
}

/// Index just past the blank line closing the header section.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    let mut first = true;
    while let Some(pos) = buf[line_start..].iter().position(|b| *b == b'\n') {
        let line_end = line_start + pos;
        let line = strip_cr(&buf[line_start..line_end]);
        if line.is_empty() && !first {
            return Some(line_end + 1);
        }
        // A NUL inside the head means the frame ended without a blank line.
        if buf[line_start..line_end].contains(&FRAME_TERMINATOR) {
            return Some(line_start + find_terminator(&buf[line_start..], 0)?);
        }
        first = false;
        line_start = line_end + 1;
    }
    None
}

// The decoder applies the same rules, so every decoded frame can be
// written back out.
fn check_action(action: &str) -> Result<(), FrameError> {
    if action.is_empty() || action.contains(&['\n', '\r'][..]) {
        return Err(FrameError::Format(format!("invalid action {action:?}")));
    }
    Ok(())
}

fn check_header(key: &str, value: &str) -> Result<(), FrameError> {
    if key.is_empty() || key.contains(&[':', '\n', '\r'][..]) {
        return Err(FrameError::Format(format!("invalid header name {key:?}")));
    }
    if value.contains(&['\n', '\r'][..]) {
        return Err(FrameError::Format(format!(
            "header {key} has a line break in its value"
        )));
    }
    Ok(())
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_head(head: &[u8]) -> Result<(Command, Headers), FrameError> {
    let mut lines = head.split(|b| *b == b'\n').map(strip_cr);

    let action = lines
        .next()
        .map(std::str::from_utf8)
        .transpose()
        .map_err(|e| FrameError::Format(format!("action line is not UTF-8: {e}")))?
        .map(str::trim)
        .unwrap_or_default();
    check_action(action)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line)
            .map_err(|e| FrameError::Format(format!("header line is not UTF-8: {e}")))?;
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::Format(format!("header line without ':': {line:?}")))?;
        let (key, value) = (key.trim(), value.trim());
        check_header(key, value)?;
        headers.insert_if_absent(key, value);
    }
    Ok((Command::parse(action), headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn decode_one(bytes: &[u8]) -> DecodedFrame {
        let mut buf = BytesMut::from(bytes);
        try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .expect("complete frame")
    }

    #[test]
    fn encodes_deterministically() {
        let frame = Frame::new(Command::Send)
            .with_header("destination", "/queue/a")
            .with_header("receipt", "r1")
            .with_body("hello");
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(
            &encoded[..],
            b"SEND\ndestination:/queue/a\nreceipt:r1\n\nhello\0\n"
        );
    }

    #[test]
    fn text_frame_round_trips() {
        let frame = Frame::new(Command::Message)
            .with_header("destination", "/topic/prices")
            .with_header("message-id", "ID:1")
            .with_header("custom", "a value with spaces")
            .with_body("{\"price\": 10}");
        let decoded = decode_one(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn binary_frame_round_trips() {
        let mut payload = vec![0u8; 512];
        rand::thread_rng().fill_bytes(&mut payload);
        payload[10] = 0;
        let frame = Frame::new(Command::Send)
            .with_header("destination", "/queue/bin")
            .with_binary_body(payload);
        let encoded = encode_frame(&frame).unwrap();
        let decoded = decode_one(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.header(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn content_length_reads_exact_bytes() {
        let decoded = decode_one(b"SEND\ndestination:/queue/a\ncontent-length:5\n\n\x01\x00\x02\x03\x04\0\n")
            .unwrap();
        assert!(decoded.binary);
        assert_eq!(&decoded.body[..], &[1, 0, 2, 3, 4]);
        assert!(!decoded.headers.contains(header::CONTENT_LENGTH));
    }

    #[test]
    fn trims_header_whitespace_and_keeps_first_occurrence() {
        let decoded =
            decode_one(b"CONNECT\nlogin: brianm\npasscode: wombats\nlogin:other\n\n\0").unwrap();
        assert_eq!(decoded.command, Command::Connect);
        assert_eq!(decoded.header("login"), Some("brianm"));
        assert_eq!(decoded.header("passcode"), Some("wombats"));
    }

    #[test]
    fn accepts_crlf_lines() {
        let decoded = decode_one(b"SEND\r\ndestination:/queue/a\r\n\r\nhi\0").unwrap();
        assert_eq!(decoded.header("destination"), Some("/queue/a"));
        assert_eq!(&decoded.body[..], b"hi");
    }

    #[test]
    fn waits_for_more_bytes() {
        let mut buf = BytesMut::from(&b"SEND\ndestination:/queue/a\n\nhel"[..]);
        assert!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
        buf.extend_from_slice(b"lo\0\n");
        let frame = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame.body[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_content_length_bytes() {
        let mut buf = BytesMut::from(&b"SEND\ncontent-length:4\n\n\0\0"[..]);
        assert!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
        buf.extend_from_slice(b"\0\0\0");
        let frame = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame.body[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::from(&b"\nBEGIN\ntransaction:tx1\n\n\0\nCOMMIT\ntransaction:tx1\n\n\0"[..]);
        let first = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        let second = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.command, Command::Begin);
        assert_eq!(second.command, Command::Commit);
        assert!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_garbage_after_terminator() {
        let mut buf = BytesMut::from(&b"SEND\n\nbody\0XSEND\n\nnext\0\n"[..]);
        let first = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert!(matches!(first, Err(FrameError::Format(_))));
        // The offending byte starts the next frame, which is itself garbage.
        let second = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.command, Command::Other("XSEND".into()));
    }

    #[test]
    fn header_without_colon_is_recoverable() {
        let mut buf = BytesMut::from(&b"SEND\nnot-a-header\n\nbody\0\nDISCONNECT\n\n\0\n"[..]);
        let first = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert!(matches!(first, Err(FrameError::Format(_))));
        let second = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.command, Command::Disconnect);
    }

    #[test]
    fn unencodable_headers_are_rejected_on_decode() {
        for raw in [
            &b"SEND\ndestination:/queue/k\n:odd\n\nhello\0\n"[..],
            &b"SEND\n  :blank key\n\n\0\n"[..],
            &b"SEND\nke\ry:v\n\n\0\n"[..],
            &b"SEND\nkey:a\rb\n\n\0\n"[..],
            &b"SE\rND\n\n\0\n"[..],
        ] {
            let mut buf = BytesMut::from(raw);
            let decoded = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap();
            assert!(
                matches!(decoded, Err(FrameError::Format(_))),
                "{:?} should be rejected",
                String::from_utf8_lossy(raw)
            );
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn non_utf8_action_is_recoverable() {
        let decoded = decode_one(b"\xff\xfe\n\n\0\n");
        assert!(matches!(decoded, Err(FrameError::Format(_))));
    }

    #[test]
    fn invalid_content_length_falls_back_to_terminator() {
        let decoded = decode_one(b"SEND\ncontent-length:abc\n\nhi\0\n").unwrap();
        assert!(!decoded.binary);
        assert_eq!(decoded.header(header::CONTENT_LENGTH), Some("abc"));
        assert_eq!(&decoded.body[..], b"hi");
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut buf = BytesMut::from(&b"SEND\ncontent-length:100\n\n"[..]);
        let err = try_decode_frame(&mut buf, 64).unwrap_err();
        assert!(matches!(err, StompError::FrameTooLarge { max: 64, .. }));
    }

    #[test]
    fn encoder_rejects_line_breaks_in_headers() {
        let frame = Frame::new(Command::Send).with_header("bad", "a\nb");
        assert!(encode_frame(&frame).is_err());
    }

    #[test]
    fn encoder_ignores_stale_content_length_header() {
        let frame = Frame::new(Command::Send)
            .with_header(header::CONTENT_LENGTH, "999")
            .with_body("abc");
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(&encoded[..], b"SEND\n\nabc\0\n");
    }
}
