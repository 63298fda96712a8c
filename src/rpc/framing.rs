//! LSP wire framing
//!
//! One frame on the wire is a header block of ASCII lines terminated by
//! `\r\n`, containing at least `Content-Length: <decimal>`, followed by the
//! `\r\n\r\n` separator and exactly Content-Length bytes of UTF-8 JSON:
//!
//! `Content-Length: <length>\r\n\r\n<content>`
//!
//! [`StreamBuffer`] reassembles frames from arbitrarily fragmented
//! delivery; [`wrap`] produces them.

use tracing::trace;

/// Maximum announced body size, to prevent memory exhaustion
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Header/body separator mandated by the protocol
const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while parsing the frame header
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame header: {0}")]
    Header(String),

    #[error("announced body of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
}

/// Frame a message body for the wire
pub fn wrap(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut framed = Vec::with_capacity(header.len() + body.len());
    framed.extend_from_slice(header.as_bytes());
    framed.extend_from_slice(body);
    framed
}

/// Stateful reassembly buffer for the inbound byte stream.
///
/// Feed chunks with [`put`](Self::put) as they arrive and drain complete
/// frames by calling [`try_take`](Self::try_take) in a loop until it
/// returns `Ok(None)`; a single `put` may complete several frames, or none.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: Vec<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw stream data
    pub fn put(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered, not yet consumed bytes
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to extract the next complete frame body.
    ///
    /// Returns `Ok(None)` while the header or body is still incomplete;
    /// nothing is consumed in that case. On a corrupt header the whole
    /// buffer is discarded, since a byte stream with an unparsable header
    /// cannot be resynchronized.
    pub fn try_take(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(header_end) = find_separator(&self.buf) else {
            return Ok(None);
        };

        let content_length = match parse_content_length(&self.buf[..header_end]) {
            Ok(length) => length,
            Err(err) => {
                self.buf.clear();
                return Err(err);
            }
        };

        let body_start = header_end + HEADER_SEPARATOR.len();
        if self.buf.len() - body_start < content_length {
            trace!(
                have = self.buf.len() - body_start,
                want = content_length,
                "frame body incomplete"
            );
            return Ok(None);
        }

        let body = self.buf[body_start..body_start + content_length].to_vec();
        // keep trailing bytes, they are the start of the next frame
        self.buf.drain(..body_start + content_length);
        trace!(bytes = content_length, "frame complete");
        Ok(Some(body))
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SEPARATOR.len() {
        return None;
    }
    buf.windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
}

/// Parse `Content-Length` out of the header block (case-sensitive match,
/// per the protocol; other header lines are tolerated and ignored)
fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| FrameError::Header("header block is not ASCII".into()))?;

    for line in header.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Content-Length:") {
            let digits = rest.trim();
            let size = digits
                .parse::<usize>()
                .map_err(|_| FrameError::Header(format!("unparsable Content-Length {digits:?}")))?;

            if size > MAX_BODY_SIZE {
                return Err(FrameError::Oversized {
                    size,
                    max: MAX_BODY_SIZE,
                });
            }

            return Ok(size);
        }
    }

    Err(FrameError::Header("missing Content-Length".into()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut StreamBuffer) -> Vec<Vec<u8>> {
        let mut bodies = Vec::new();
        while let Some(body) = buffer.try_take().unwrap() {
            bodies.push(body);
        }
        bodies
    }

    #[test]
    fn wrap_produces_canonical_frame() {
        let framed = wrap(b"{}");
        assert_eq!(framed, b"Content-Length: 2\r\n\r\n{}");
    }

    #[test]
    fn round_trip() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let mut buffer = StreamBuffer::new();
        buffer.put(&wrap(body));
        assert_eq!(buffer.try_take().unwrap().unwrap(), body);
        assert_eq!(buffer.try_take().unwrap(), None);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn empty_body_round_trip() {
        // Content-Length 0 is valid at this layer
        let mut buffer = StreamBuffer::new();
        buffer.put(&wrap(b""));
        assert_eq!(buffer.try_take().unwrap().unwrap(), b"");
    }

    #[test]
    fn fragmentation_invariance() {
        let body = br#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#;
        let framed = wrap(body);

        // split the frame at every possible boundary, including inside the
        // header, inside the separator and inside the body
        for split in 1..framed.len() {
            let mut buffer = StreamBuffer::new();
            buffer.put(&framed[..split]);
            assert_eq!(
                buffer.try_take().unwrap(),
                None,
                "split at {split} yielded a premature frame"
            );
            buffer.put(&framed[split..]);
            assert_eq!(buffer.try_take().unwrap().unwrap(), body);
            assert_eq!(buffer.try_take().unwrap(), None);
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let body = b"{\"jsonrpc\":\"2.0\",\"id\":9,\"result\":null}";
        let framed = wrap(body);

        let mut buffer = StreamBuffer::new();
        let mut frames = Vec::new();
        for byte in &framed {
            buffer.put(std::slice::from_ref(byte));
            frames.extend(drain(&mut buffer));
        }
        assert_eq!(frames, vec![body.to_vec()]);
    }

    #[test]
    fn multi_frame_batching() {
        let mut batch = wrap(b"first");
        batch.extend_from_slice(&wrap(b"second"));

        let mut buffer = StreamBuffer::new();
        buffer.put(&batch);
        assert_eq!(
            drain(&mut buffer),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn extra_header_lines_are_tolerated() {
        let mut framed = b"Content-Type: application/vscode-jsonrpc\r\n".to_vec();
        framed.extend_from_slice(&wrap(b"body"));
        let mut buffer = StreamBuffer::new();
        buffer.put(&framed);
        assert_eq!(buffer.try_take().unwrap().unwrap(), b"body");
    }

    #[test]
    fn header_corruption_discards_buffer() {
        let mut buffer = StreamBuffer::new();
        buffer.put(b"Content-Size: 12\r\n\r\ngarbage");
        assert!(matches!(buffer.try_take(), Err(FrameError::Header(_))));
        assert_eq!(buffer.pending(), 0);

        // a fresh buffer is unaffected by the failure above
        let mut fresh = StreamBuffer::new();
        fresh.put(&wrap(b"ok"));
        assert_eq!(fresh.try_take().unwrap().unwrap(), b"ok");
    }

    #[test]
    fn unparsable_length_discards_buffer() {
        let mut buffer = StreamBuffer::new();
        buffer.put(b"Content-Length: twelve\r\n\r\n{}");
        assert!(matches!(buffer.try_take(), Err(FrameError::Header(_))));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn lowercase_header_is_rejected() {
        // the Content-Length match is case-sensitive
        let mut buffer = StreamBuffer::new();
        buffer.put(b"content-length: 2\r\n\r\n{}");
        assert!(matches!(buffer.try_take(), Err(FrameError::Header(_))));
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut buffer = StreamBuffer::new();
        buffer.put(format!("Content-Length: {}\r\n\r\n", MAX_BODY_SIZE + 1).as_bytes());
        assert!(matches!(
            buffer.try_take(),
            Err(FrameError::Oversized { .. })
        ));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn incomplete_header_waits_for_more() {
        let mut buffer = StreamBuffer::new();
        buffer.put(b"Content-Length: 4\r\n");
        assert_eq!(buffer.try_take().unwrap(), None);
        buffer.put(b"\r\nabcd");
        assert_eq!(buffer.try_take().unwrap().unwrap(), b"abcd");
    }
}
